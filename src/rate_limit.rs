//! Rate limiting for live provider calls
//!
//! Budgets grant at most `capacity` permits in any window of length `window`
//! per (service, account). A budget configured for a service alone applies to
//! each account of that service separately; a budget naming an account
//! overrides it. Pairs with no budget are unlimited.

use crate::error::RateLimited;
use crate::metrics::MetricsSink;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Budget configuration for a service, optionally pinned to one account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateBudget {
    pub service: String,
    #[serde(default)]
    pub account: Option<String>,
    pub capacity: u32,
    #[serde(rename = "window_ms", with = "millis")]
    pub window: Duration,
    /// Wait for a permit instead of failing with `RateLimited`
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl RateBudget {
    pub fn new(service: &str, capacity: u32, window: Duration) -> Self {
        Self {
            service: service.to_string(),
            account: None,
            capacity,
            window,
            blocking: true,
        }
    }

    pub fn for_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Proof that a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// How long the caller waited for it
    pub waited: Duration,
}

/// Grants made inside the current window, oldest first
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity as usize,
            window,
            grants: VecDeque::with_capacity(capacity as usize),
        }
    }

    /// Grant at `now`, or report how long until the oldest grant leaves the window
    fn try_grant(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(oldest) = self.grants.front() {
            if *oldest + self.window <= now {
                self.grants.pop_front();
            } else {
                break;
            }
        }

        if self.grants.len() < self.capacity {
            self.grants.push_back(now);
            return Ok(());
        }

        match self.grants.front() {
            Some(oldest) => Err((*oldest + self.window).saturating_duration_since(now)),
            // capacity 0: nothing is ever granted, retry after a full window
            None => Err(self.window),
        }
    }
}

type BudgetKey = (String, String);

/// Per (service, account) rate limiter
pub struct RateLimiter {
    budgets: Vec<RateBudget>,
    windows: Mutex<HashMap<BudgetKey, Arc<Mutex<SlidingWindow>>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(budgets: Vec<RateBudget>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            budgets,
            windows: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// A limiter with no budgets at all
    pub fn unlimited(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::new(Vec::new(), metrics)
    }

    fn budget_for(&self, service: &str, account: &str) -> Option<&RateBudget> {
        self.budgets
            .iter()
            .find(|b| b.service == service && b.account.as_deref() == Some(account))
            .or_else(|| {
                self.budgets
                    .iter()
                    .find(|b| b.service == service && b.account.is_none())
            })
    }

    async fn window_for(&self, service: &str, account: &str, budget: &RateBudget) -> Arc<Mutex<SlidingWindow>> {
        let mut windows = self.windows.lock().await;
        windows
            .entry((service.to_string(), account.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::new(budget.capacity, budget.window))))
            .clone()
    }

    /// Wait for (or, for non-blocking budgets, try to take) a permit
    pub async fn acquire(&self, service: &str, account: &str) -> Result<Permit, RateLimited> {
        let tags = [("service", service), ("account", account)];

        let Some(budget) = self.budget_for(service, account) else {
            self.metrics.increment("ratelimit.acquire", &tags, 1);
            return Ok(Permit {
                waited: Duration::ZERO,
            });
        };

        let window = self.window_for(service, account, budget).await;
        let started = Instant::now();

        loop {
            let wait = {
                let mut window = window.lock().await;
                match window.try_grant(Instant::now()) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };

            let Some(wait) = wait else {
                let waited = started.elapsed();
                self.metrics.increment("ratelimit.acquire", &tags, 1);
                if !waited.is_zero() {
                    self.metrics.record_duration("ratelimit.wait", &tags, waited);
                }
                return Ok(Permit { waited });
            };

            if !budget.blocking {
                self.metrics.increment("ratelimit.deny", &tags, 1);
                tracing::debug!(service, account, "Rate budget exhausted");
                return Err(RateLimited {
                    service: service.to_string(),
                    account: account.to_string(),
                });
            }

            tracing::trace!(service, account, wait_ms = wait.as_millis() as u64, "Waiting for rate budget");
            tokio::time::sleep(wait).await;
        }
    }
}
