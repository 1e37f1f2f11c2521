//! Best-effort collaborators: long-term memory and issue tracking.
//!
//! Neither may influence an iteration's outcome. Every call goes through
//! [`best_effort`], which bounds it with a timeout and turns errors into a
//! `warn!` plus `None`.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::types::{IterationResult, Story};

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Notes relevant to `story` from earlier sessions.
    async fn recall(&self, story: &Story) -> Result<Vec<String>>;
    /// Remember what an iteration learned.
    async fn record(&self, story: &Story, result: &IterationResult) -> Result<()>;
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Notified once per recorded iteration of a story with an issue reference.
    async fn iteration_recorded(&self, issue: &str, result: &IterationResult) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn recall(&self, _story: &Story) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn record(&self, _story: &Story, _result: &IterationResult) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIssueTracker;

#[async_trait]
impl IssueTracker for NoopIssueTracker {
    async fn iteration_recorded(&self, _issue: &str, _result: &IterationResult) -> Result<()> {
        Ok(())
    }
}

/// Await `fut` for at most `limit`; failures and timeouts are logged and yield `None`.
pub async fn best_effort<T, F>(label: &str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => {
            debug!(label, "collaborator call succeeded");
            Some(value)
        }
        Ok(Err(err)) => {
            warn!(label, err = %format!("{err:#}"), "collaborator call failed");
            None
        }
        Err(_) => {
            warn!(label, limit_ms = limit.as_millis() as u64, "collaborator call timed out");
            None
        }
    }
}
