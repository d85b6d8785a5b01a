//! `tracing`-backed implementation of `flowcore_workflow::context::Logger`.
//!
//! Library crates only ever call `tracing::{debug,info,warn,error}!`
//! directly; this is the one place those events are also routed through
//! the core's `Logger` trait object so the executor can log without a
//! hard dependency on a particular subscriber.

use std::collections::BTreeMap;

use flowcore_workflow::context::Logger;

pub struct TracingLogger {
    pub request_id: String,
    pub workflow: String,
}

impl TracingLogger {
    pub fn new(request_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        TracingLogger {
            request_id: request_id.into(),
            workflow: workflow.into(),
        }
    }
}

fn render_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Logger for TracingLogger {
    fn debug(&self, msg: &str, fields: &BTreeMap<String, String>) {
        tracing::debug!(request_id = %self.request_id, workflow = %self.workflow, "{msg} {}", render_fields(fields));
    }

    fn info(&self, msg: &str, fields: &BTreeMap<String, String>) {
        tracing::info!(request_id = %self.request_id, workflow = %self.workflow, "{msg} {}", render_fields(fields));
    }

    fn warn(&self, msg: &str, fields: &BTreeMap<String, String>) {
        tracing::warn!(request_id = %self.request_id, workflow = %self.workflow, "{msg} {}", render_fields(fields));
    }

    fn error(&self, msg: &str, fields: &BTreeMap<String, String>) {
        tracing::error!(request_id = %self.request_id, workflow = %self.workflow, "{msg} {}", render_fields(fields));
    }
}
