//! Declarative configuration: the shape authors write in YAML.
//!
//! These types are the input to validation and compilation. They are
//! plain data — no parsing or compiled programs live here, only what an
//! operator can express in a workflow file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named workflow: optional timeout, an alias table of reusable
/// predicates, an ordered list of triggers, and an ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    pub triggers: Vec<TriggerConfig>,
    pub steps: Vec<StepConfig>,
}

/// Inbound event that starts a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerConfig {
    Http(HttpTriggerConfig),
    Cron(CronTriggerConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpTriggerConfig {
    /// Path with `{name}` placeholders, e.g. `/api/users/{id}`.
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<ParamConfig>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRef>,
    /// Template for the trigger-level response cache key; absent disables
    /// response caching for this trigger.
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub cache_ttl_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronTriggerConfig {
    /// Five-field cron schedule (`min hour dom month dow`).
    pub schedule: String,
    // The following are accepted for symmetry with HTTP triggers but are
    // meaningless for a cron trigger; the validator warns if set.
    #[serde(default)]
    pub params: Vec<ParamConfig>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRef>,
    #[serde(default)]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    Json,
    #[serde(rename = "int[]")]
    IntArray,
    #[serde(rename = "string[]")]
    StringArray,
}

/// Either a named pool (shared rate-limit bucket) or an inline policy;
/// never both, never neither — enforced by the validator, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRef {
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub burst: Option<u32>,
}

/// `abort | continue` for a plain step; `skip` is additionally valid for
/// a block's `iterate.on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    Abort,
    Continue,
    Skip,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Abort
    }
}

/// One step in document order. The `type` tag, when present, is
/// authoritative; when absent the compiler/validator infer the kind from
/// which kind-specific fields are populated (§3: block ⇐ nested steps,
/// query ⇐ `sql`, httpcall ⇐ `url`, response ⇐ `template`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub step_type: Option<StepKind>,
    #[serde(default)]
    pub disabled: bool,
    /// An alias name, `!alias_name`, or an inline expression source.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: OnError,

    // --- query ---
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub isolation: Option<String>,
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub deadlock_priority: Option<String>,
    #[serde(default)]
    pub json_columns: Vec<String>,

    // --- query/httpcall response caching ---
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub cache_ttl_sec: u64,

    // --- httpcall ---
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub parse: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    // --- response ---
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub template: Option<String>,

    // --- block ---
    #[serde(default)]
    pub iterate: Option<IterateConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    // --- computed params (pre-evaluated value templates; §4.4 step 4) ---
    #[serde(default)]
    pub computed_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Query,
    Httpcall,
    Response,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub initial_backoff_sec: f64,
    #[serde(default)]
    pub max_backoff_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IterateConfig {
    /// Expression evaluating to the driving collection.
    pub over: String,
    /// Binding name for the current item, exposed in the environment.
    #[serde(rename = "as")]
    pub as_name: String,
    #[serde(default)]
    pub on_error: OnError,
}

impl StepConfig {
    /// The explicit or inferred kind (§3). Returns `None` only when no
    /// field combination matches any kind — a validator error, not a
    /// panic (§9 "unknown step kind").
    pub fn resolved_kind(&self) -> Option<StepKind> {
        if let Some(kind) = self.step_type {
            return Some(kind);
        }
        if !self.steps.is_empty() || self.iterate.is_some() {
            Some(StepKind::Block)
        } else if self.sql.is_some() {
            Some(StepKind::Query)
        } else if self.url.is_some() {
            Some(StepKind::Httpcall)
        } else if self.template.is_some() {
            Some(StepKind::Response)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_kind_from_fields() {
        let mut s = StepConfig::blank();
        s.sql = Some("select 1".into());
        assert_eq!(s.resolved_kind(), Some(StepKind::Query));

        let mut s = StepConfig::blank();
        s.url = Some("https://example.com".into());
        assert_eq!(s.resolved_kind(), Some(StepKind::Httpcall));

        let mut s = StepConfig::blank();
        s.template = Some("{{.x}}".into());
        assert_eq!(s.resolved_kind(), Some(StepKind::Response));

        let mut s = StepConfig::blank();
        s.steps = vec![StepConfig::blank()];
        assert_eq!(s.resolved_kind(), Some(StepKind::Block));
    }

    #[test]
    fn explicit_type_wins_over_inference() {
        let mut s = StepConfig::blank();
        s.sql = Some("select 1".into());
        s.step_type = Some(StepKind::Block);
        assert_eq!(s.resolved_kind(), Some(StepKind::Block));
    }

    impl StepConfig {
        pub(crate) fn blank() -> Self {
            StepConfig {
                name: None,
                step_type: None,
                disabled: false,
                condition: None,
                on_error: OnError::default(),
                database: None,
                sql: None,
                params: BTreeMap::new(),
                isolation: None,
                lock_timeout_ms: None,
                deadlock_priority: None,
                json_columns: vec![],
                cache_key: None,
                cache_ttl_sec: 0,
                url: None,
                method: None,
                headers: BTreeMap::new(),
                body: None,
                parse: None,
                timeout_sec: None,
                retry: None,
                status: None,
                template: None,
                iterate: None,
                steps: vec![],
                computed_params: BTreeMap::new(),
            }
        }
    }
}
