//! Bounded worker pool
//!
//! One pool is shared per (account, resource type) scope. It limits how many
//! detail fetches or enrichment tasks are in flight at once.

use crate::error::PoolClosed;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.to_string(),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop handing out slots; pending and future tasks fail with `PoolClosed`
    pub fn close(&self) {
        self.permits.close();
    }

    async fn run_one<T, E, F>(&self, task: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<PoolClosed>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| PoolClosed)?;
        task.await
    }

    async fn run_settled<T, F>(&self, task: F) -> Result<T, PoolClosed>
    where
        F: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| PoolClosed)?;
        Ok(task.await)
    }

    /// Run every task, results in input order
    ///
    /// The first failure is returned as soon as it is observed. Sibling tasks
    /// still pending are dropped, which cancels them.
    pub async fn try_run_all<T, E, F, I>(&self, tasks: I) -> Result<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        E: From<PoolClosed>,
    {
        // built eagerly so no closure is held across an await
        let slots: Vec<_> = tasks.into_iter().map(|task| self.run_one(task)).collect();
        stream::iter(slots).buffered(self.size).try_collect().await
    }

    /// Run every task to completion and keep every outcome, in input order
    pub async fn run_all_settled<T, F, I>(&self, tasks: I) -> Vec<Result<T, PoolClosed>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        let slots: Vec<_> = tasks.into_iter().map(|task| self.run_settled(task)).collect();
        stream::iter(slots).buffered(self.size).collect().await
    }
}
