//! Reconciling entity cache
//!
//! A keyed store that is only ever replaced by complete snapshots. See
//! [`ReconcilingCache::reconcile_snapshot`] for the diff rules.

mod entity;
mod reconcile;

pub use entity::{EntityState, IllegalTransition, ReconciledEntity};
pub use reconcile::{
    Enricher, Entries, NoEnrichment, ReconcileError, ReconcileReport, ReconcilingCache, SnapshotEntry,
};
