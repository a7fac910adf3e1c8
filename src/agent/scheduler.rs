//! Periodic agent scheduling
//!
//! Every agent gets its own task. Cycles of one agent never overlap: a cycle
//! that overruns its interval simply delays the next tick.

use super::polling::{CachingAgent, CycleError, CycleReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run one cycle bounded by `cycle_timeout`
///
/// A timed out cycle is dropped mid-flight, so nothing gets published.
pub async fn run_bounded(agent: &dyn CachingAgent, cycle_timeout: Duration) -> Result<CycleReport, CycleError> {
    match tokio::time::timeout(cycle_timeout, agent.run_cycle()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(agent = %agent.name(), "Cycle timed out after {:?}", cycle_timeout);
            Err(CycleError::TimedOut {
                resource_type: agent.name(),
                timeout: cycle_timeout,
            })
        },
    }
}

/// Spawn the polling loop for an agent
///
/// The loop exits when `shutdown` flips to `true` or its sender is dropped; a
/// cycle in progress at that moment is abandoned.
pub fn spawn(
    agent: Arc<dyn CachingAgent>,
    interval: Duration,
    cycle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(agent = %agent.name(), interval_secs = interval.as_secs(), "Agent started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                },
            }

            tokio::select! {
                result = run_bounded(agent.as_ref(), cycle_timeout) => {
                    if let Ok(report) = result {
                        tracing::debug!(agent = %agent.name(), "Cycle took {:?}", report.duration);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(agent = %agent.name(), "Abandoning cycle for shutdown");
                        break;
                    }
                },
            }
        }

        tracing::info!(agent = %agent.name(), "Agent stopped");
    })
}
