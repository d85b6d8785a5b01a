//! Per-request execution state (§3 "Context").
//!
//! Every other core entity is immutable after compilation; `Context` is
//! the one live, mutable structure, and it lives entirely on the
//! executing task's stack — no locking is required for intra-request
//! access (§5 "shared-nothing executor").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::result::StepResult;
use crate::value::Value;

/// A cancellable deadline shared by every collaborator call a step makes.
///
/// Pairs a hard deadline instant with a cooperative cancellation token,
/// matching the pattern the rest of the ecosystem uses for suspending
/// calls: every collaborator method takes `&DeadlineCtx` and is expected
/// to race its own work against `ctx.cancelled()`.
#[derive(Clone)]
pub struct DeadlineCtx {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl DeadlineCtx {
    pub fn new(timeout: Option<Duration>) -> Self {
        DeadlineCtx {
            deadline: timeout.map(|d| Instant::now() + d),
            token: CancellationToken::new(),
        }
    }

    pub fn no_timeout() -> Self {
        DeadlineCtx {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True when the deadline has passed or cancellation was requested —
    /// the single check the executor makes between steps/iterations.
    pub fn should_stop(&self) -> bool {
        self.is_expired() || self.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Race a future against this deadline/cancellation, returning `None`
    /// on timeout or cancellation.
    pub async fn race<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        let cancelled = self.token.clone();
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    res = fut => Some(res),
                    _ = tokio::time::sleep(remaining) => None,
                    _ = cancelled.cancelled() => None,
                }
            }
            None => {
                tokio::select! {
                    res = fut => Some(res),
                    _ = cancelled.cancelled() => None,
                }
            }
        }
    }
}

/// The inbound event that started this run.
#[derive(Debug, Clone)]
pub enum TriggerData {
    Http {
        params: BTreeMap<String, Value>,
        headers: BTreeMap<String, String>,
        cookies: BTreeMap<String, String>,
        client_ip: String,
        method: String,
        path: String,
    },
    Cron {
        schedule_time: chrono::DateTime<chrono::Utc>,
        cron: String,
    },
}

impl TriggerData {
    pub fn type_name(&self) -> &'static str {
        match self {
            TriggerData::Http { .. } => "http",
            TriggerData::Cron { .. } => "cron",
        }
    }
}

/// A minimal logger handle; `flowcore-core` provides the `tracing`-backed
/// implementation, kept here as a trait so the data model stays
/// dependency-light.
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str, fields: &BTreeMap<String, String>);
    fn info(&self, msg: &str, fields: &BTreeMap<String, String>);
    fn warn(&self, msg: &str, fields: &BTreeMap<String, String>);
    fn error(&self, msg: &str, fields: &BTreeMap<String, String>);
}

/// Per-request execution state.
pub struct Context {
    pub deadline: DeadlineCtx,
    pub trigger: TriggerData,
    pub step_results: BTreeMap<String, StepResult>,
    pub vars: BTreeMap<String, Value>,
    pub request_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub workflow_name: String,
    pub logger: Arc<dyn Logger>,
}

impl Context {
    pub fn new(
        deadline: DeadlineCtx,
        trigger: TriggerData,
        request_id: String,
        workflow_name: String,
        vars: BTreeMap<String, Value>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Context {
            deadline,
            trigger,
            step_results: BTreeMap::new(),
            vars,
            request_id,
            start_time: chrono::Utc::now(),
            workflow_name,
            logger,
        }
    }

    pub fn record(&mut self, step_name: &str, result: StepResult) {
        self.step_results.insert(step_name.to_string(), result);
    }
}

/// A `Context` addendum active while executing inside a block iteration:
/// the current item, its zero-based index, the total count, and a
/// read-through to the parent for anything not locally overridden.
pub struct BlockContext<'p> {
    pub parent: &'p Context,
    pub as_name: String,
    pub item: Value,
    pub index: usize,
    pub total: usize,
    pub step_results: BTreeMap<String, StepResult>,
}

impl<'p> BlockContext<'p> {
    pub fn new(parent: &'p Context, as_name: String, item: Value, index: usize, total: usize) -> Self {
        BlockContext {
            parent,
            as_name,
            item,
            index,
            total,
            step_results: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, step_name: &str, result: StepResult) {
        self.step_results.insert(step_name.to_string(), result);
    }

    /// Look up a step result, checking this block's own namespace first
    /// and falling back to the parent's (steps before the block remain
    /// visible inside it, per the environment builder's document-order
    /// rule).
    pub fn find_step(&self, name: &str) -> Option<&StepResult> {
        self.step_results
            .get(name)
            .or_else(|| self.parent.step_results.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_not_expired_without_timeout() {
        let ctx = DeadlineCtx::no_timeout();
        assert!(!ctx.is_expired());
        assert!(!ctx.should_stop());
    }

    #[test]
    fn cancel_marks_should_stop() {
        let ctx = DeadlineCtx::no_timeout();
        ctx.cancel();
        assert!(ctx.should_stop());
    }
}
