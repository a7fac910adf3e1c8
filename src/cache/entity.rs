//! Cached entities and their lifecycle

use std::fmt;

/// Lifecycle state of a cached entity
///
/// `New -> Enriched -> Cached`, and `Cached -> Evicted` once a later
/// snapshot no longer contains the key. Nothing else is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    New,
    Enriched,
    Cached,
    Evicted,
}

impl EntityState {
    pub fn can_transition_to(self, next: EntityState) -> bool {
        matches!(
            (self, next),
            (EntityState::New, EntityState::Enriched)
                | (EntityState::Enriched, EntityState::Cached)
                | (EntityState::Cached, EntityState::Evicted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::New => "new",
            EntityState::Enriched => "enriched",
            EntityState::Cached => "cached",
            EntityState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted an illegal lifecycle move
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal entity transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: EntityState,
    pub to: EntityState,
}

/// A value held by a `ReconcilingCache`
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledEntity<K, V> {
    pub key: K,
    pub value: V,
    /// Upstream version token (e.g. `updatedAt`); `None` means "always refresh"
    pub version: Option<String>,
    pub state: EntityState,
    /// Generation of the snapshot that last wrote this entity
    pub generation: u64,
}

impl<K, V> ReconciledEntity<K, V> {
    pub fn new(key: K, value: V, version: Option<String>, generation: u64) -> Self {
        Self {
            key,
            value,
            version,
            state: EntityState::New,
            generation,
        }
    }

    pub fn transition(&mut self, next: EntityState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether an incoming version token leaves this entity untouched
    pub fn is_current(&self, version: Option<&str>) -> bool {
        match (self.version.as_deref(), version) {
            (Some(cached), Some(incoming)) => cached == incoming,
            _ => false,
        }
    }
}
