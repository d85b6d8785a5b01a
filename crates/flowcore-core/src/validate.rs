//! Structural and semantic validation (§4.3), run before compilation.
//!
//! Returns `{valid, errors, warnings}` rather than failing fast so a
//! workflow author sees every problem in one pass, mirroring the
//! teacher's aggregate-then-report posture for its own config checks
//! (`ada-n8n/src/types.rs`'s DTO validation helpers).

use std::collections::{BTreeSet, HashSet};

use flowcore_workflow::config::{
    HttpTriggerConfig, OnError, ParamType, RateLimitRef, StepConfig, StepKind, TriggerConfig,
    WorkflowConfig,
};

use crate::expr::alias::build_alias_table;
use crate::expr::parser;

const RESERVED_PARAM_NAMES: &[&str] = &["_timeout", "_nocache"];
const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
const ALLOWED_PARSE_MODES: &[&str] = &["json", "text", "form", ""];
const ALLOWED_ISOLATION: &[&str] = &[
    "read_uncommitted",
    "read_committed",
    "repeatable_read",
    "serializable",
];
const ALLOWED_DEADLOCK_PRIORITY: &[&str] = &["low", "normal", "high"];
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "EXEC",
];

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub locator: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(locator: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            locator: locator.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, locator: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(locator, message));
    }

    fn warn(&mut self, locator: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(locator, message));
    }
}

/// Information the validator needs about the deployment's known
/// databases and rate-limit pools — supplied by the host, since the
/// core has no registry of its own (§6 collaborators are interface-only).
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Database name -> whether it's marked read-only.
    pub databases: std::collections::BTreeMap<String, bool>,
    pub rate_limit_pools: BTreeSet<String>,
}

pub fn validate(workflow: &WorkflowConfig, ctx: &ValidationContext) -> ValidationResult {
    let mut result = ValidationResult::default();

    if workflow.name.trim().is_empty() {
        result.error("name", "workflow must have a non-empty name");
    }
    if workflow.triggers.is_empty() {
        result.error("triggers", "workflow must declare at least one trigger");
    }
    if workflow.steps.is_empty() {
        result.error("steps", "workflow must declare at least one step");
    }

    match build_alias_table(&workflow.aliases) {
        Ok(_) => {}
        Err(e) => result.error("aliases", e.to_string()),
    }

    validate_triggers(workflow, ctx, &mut result);
    validate_rate_limit_refs(workflow, ctx, &mut result);

    let mut response_count_unconditional = 0usize;
    let mut response_count_conditional = 0usize;
    let mut has_any_response = false;
    let aliases: BTreeSet<String> = workflow.aliases.keys().cloned().collect();
    for (i, step) in workflow.steps.iter().enumerate() {
        validate_step(
            &format!("steps[{i}]"),
            step,
            &aliases,
            ctx,
            false,
            workflow.steps.len() > 1,
            &mut result,
        );
        count_responses(
            step,
            &mut has_any_response,
            &mut response_count_unconditional,
            &mut response_count_conditional,
        );
    }

    if response_count_unconditional > 1 {
        result.error(
            "steps",
            "more than one unconditional response step can fire; only one response can win",
        );
    }
    if has_any_response && response_count_unconditional == 0 && response_count_conditional > 0 {
        result.warn(
            "steps",
            "all response steps are conditional; requests may fall through with no response",
        );
    }
    if workflow
        .triggers
        .iter()
        .any(|t| matches!(t, TriggerConfig::Http(_)))
        && !has_any_response
    {
        result.warn(
            "triggers",
            "workflow has an HTTP trigger but no response step; the front-end will write a default response",
        );
    }

    result
}

fn count_responses(
    step: &StepConfig,
    has_any: &mut bool,
    unconditional: &mut usize,
    conditional: &mut usize,
) {
    if step.resolved_kind() == Some(StepKind::Response) && !step.disabled {
        *has_any = true;
        if step.condition.is_some() {
            *conditional += 1;
        } else {
            *unconditional += 1;
        }
    }
    for child in &step.steps {
        count_responses(child, has_any, unconditional, conditional);
    }
}

fn validate_triggers(workflow: &WorkflowConfig, _ctx: &ValidationContext, result: &mut ValidationResult) {
    let mut seen_routes: HashSet<(String, String)> = HashSet::new();
    for (i, trigger) in workflow.triggers.iter().enumerate() {
        let locator = format!("triggers[{i}]");
        match trigger {
            TriggerConfig::Http(http) => validate_http_trigger(&locator, http, &mut seen_routes, result),
            TriggerConfig::Cron(cron) => {
                if parse_cron(&cron.schedule).is_err() {
                    result.error(
                        format!("{locator}.schedule"),
                        "cron schedule must be a valid 5-field expression (min hour dom month dow)",
                    );
                }
                if !cron.params.is_empty() {
                    result.warn(format!("{locator}.params"), "params are meaningless on a cron trigger");
                }
                if !cron.rate_limits.is_empty() {
                    result.warn(
                        format!("{locator}.rate_limits"),
                        "rate_limits are meaningless on a cron trigger",
                    );
                }
                if cron.cache_key.is_some() {
                    result.warn(format!("{locator}.cache_key"), "cache_key is meaningless on a cron trigger");
                }
            }
        }
    }
}

fn validate_http_trigger(
    locator: &str,
    http: &HttpTriggerConfig,
    seen_routes: &mut HashSet<(String, String)>,
    result: &mut ValidationResult,
) {
    if !http.path.starts_with('/') {
        result.error(format!("{locator}.path"), "path must start with '/'");
    }
    if http.path.starts_with("/_/") {
        result.error(format!("{locator}.path"), "path prefix '/_/' is reserved");
    }
    let method = http.method.to_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        result.error(
            format!("{locator}.method"),
            format!("method must be one of {ALLOWED_METHODS:?}"),
        );
    }
    let route = (method.clone(), http.path.clone());
    if !seen_routes.insert(route) {
        result.error(
            locator,
            format!("duplicate trigger for method+path '{} {}'", method, http.path),
        );
    }

    let mut names = HashSet::new();
    for p in &http.params {
        if !names.insert(p.name.clone()) {
            result.error(format!("{locator}.params"), format!("duplicate parameter name '{}'", p.name));
        }
        if RESERVED_PARAM_NAMES.contains(&p.name.as_str()) {
            result.error(
                format!("{locator}.params"),
                format!("parameter name '{}' is reserved", p.name),
            );
        }
    }

    for name in path_placeholders(&http.path) {
        match http.params.iter().find(|p| p.name == name) {
            Some(p) if p.required => {}
            Some(_) => result.error(
                format!("{locator}.params"),
                format!("path parameter '{{{name}}}' must be declared with required=true"),
            ),
            None => result.error(
                format!("{locator}.params"),
                format!("path parameter '{{{name}}}' has no matching declared parameter"),
            ),
        }
    }

    for r in &http.rate_limits {
        validate_rate_limit_shape(locator, r, result);
    }

    if http.cache_key.is_none() && http.cache_ttl_sec > 0 {
        result.warn(
            format!("{locator}.cache_ttl_sec"),
            "cache_ttl_sec has no effect without a cache_key",
        );
    }
}

fn path_placeholders(path: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = path.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '{' {
            if let Some(end) = path[i..].find('}') {
                names.push(path[i + 1..i + end].to_string());
            }
        }
    }
    names
}

fn validate_rate_limit_refs(workflow: &WorkflowConfig, ctx: &ValidationContext, result: &mut ValidationResult) {
    for (i, trigger) in workflow.triggers.iter().enumerate() {
        if let TriggerConfig::Http(http) = trigger {
            for (j, r) in http.rate_limits.iter().enumerate() {
                if let Some(pool) = &r.pool {
                    if !ctx.rate_limit_pools.contains(pool) {
                        result.error(
                            format!("triggers[{i}].rate_limits[{j}]"),
                            format!("unknown rate-limit pool '{pool}'"),
                        );
                    }
                }
            }
        }
    }
}

fn validate_rate_limit_shape(locator: &str, r: &RateLimitRef, result: &mut ValidationResult) {
    let inline = r.requests_per_second.is_some() || r.burst.is_some();
    match (&r.pool, inline) {
        (Some(_), true) => result.error(
            format!("{locator}.rate_limits"),
            "a rate limit must be either a pool reference or inline, never both",
        ),
        (None, false) => result.error(
            format!("{locator}.rate_limits"),
            "a rate limit must specify either a pool reference or an inline policy",
        ),
        (None, true) => {
            if r.requests_per_second.map(|v| v <= 0.0).unwrap_or(true) {
                result.error(
                    format!("{locator}.rate_limits"),
                    "inline rate limit requires requests_per_second > 0",
                );
            }
            if r.burst.map(|v| v == 0).unwrap_or(true) {
                result.error(format!("{locator}.rate_limits"), "inline rate limit requires burst > 0");
            }
        }
        (Some(_), false) => {}
    }
}

fn validate_step(
    locator: &str,
    step: &StepConfig,
    aliases: &BTreeSet<String>,
    ctx: &ValidationContext,
    inside_block: bool,
    requires_name: bool,
    result: &mut ValidationResult,
) {
    let kind = match step.resolved_kind() {
        Some(k) => k,
        None => {
            result.error(locator, "step kind could not be determined from its fields; set 'type' explicitly");
            return;
        }
    };

    if requires_name && step.name.is_none() && kind != StepKind::Response {
        result.error(locator, "multi-step workflows require a 'name' on every non-response step");
    }

    if let Some(condition) = &step.condition {
        validate_condition_source(locator, condition, aliases, result);
    }

    match step.on_error {
        OnError::Skip if !inside_block => {
            result.error(
                format!("{locator}.on_error"),
                "on_error: skip is only valid on a block's iterate policy, not a bare step",
            );
        }
        _ => {}
    }

    match kind {
        StepKind::Query => validate_query_step(locator, step, ctx, result),
        StepKind::Httpcall => validate_httpcall_step(locator, step, result),
        StepKind::Response => validate_response_step(locator, step, result),
        StepKind::Block => validate_block_step(locator, step, aliases, ctx, result),
    }
}

fn validate_condition_source(
    locator: &str,
    condition: &str,
    aliases: &BTreeSet<String>,
    result: &mut ValidationResult,
) {
    let trimmed = condition.trim();
    if aliases.contains(trimmed) {
        return;
    }
    if let Some(name) = trimmed.strip_prefix('!') {
        if aliases.contains(name.trim()) {
            return;
        }
    }
    if let Err(e) = parser::parse(condition) {
        result.error(format!("{locator}.condition"), format!("invalid condition expression: {e}"));
    }
}

fn validate_query_step(locator: &str, step: &StepConfig, ctx: &ValidationContext, result: &mut ValidationResult) {
    let database = match &step.database {
        Some(d) => d,
        None => {
            result.error(format!("{locator}.database"), "query step requires 'database'");
            return;
        }
    };
    let sql = match &step.sql {
        Some(s) => s,
        None => {
            result.error(format!("{locator}.sql"), "query step requires 'sql'");
            return;
        }
    };

    if sql.contains("{{") {
        result.error(
            format!("{locator}.sql"),
            "SQL must not contain template interpolation ('{{ }}'); use @param-style bound parameters instead",
        );
    }

    if !ctx.databases.is_empty() && !ctx.databases.contains_key(database) {
        result.error(format!("{locator}.database"), format!("unknown database '{database}'"));
    }

    if contains_write_keyword(sql) {
        let is_read_only = ctx.databases.get(database).copied().unwrap_or(false);
        if is_read_only {
            result.error(
                format!("{locator}.sql"),
                format!("database '{database}' is marked read-only but the SQL contains a write statement"),
            );
        } else {
            result.warn(
                format!("{locator}.sql"),
                "SQL appears to contain a write statement; ensure the target database is not read-only",
            );
        }
    }

    if let Some(isolation) = &step.isolation {
        if !ALLOWED_ISOLATION.contains(&isolation.as_str()) {
            result.error(
                format!("{locator}.isolation"),
                format!("isolation level must be one of {ALLOWED_ISOLATION:?}"),
            );
        }
    }
    if let Some(priority) = &step.deadlock_priority {
        if !ALLOWED_DEADLOCK_PRIORITY.contains(&priority.as_str()) {
            result.error(
                format!("{locator}.deadlock_priority"),
                format!("deadlock_priority must be one of {ALLOWED_DEADLOCK_PRIORITY:?}"),
            );
        }
    }
    if step.cache_key.is_none() && step.cache_ttl_sec > 0 {
        result.warn(format!("{locator}.cache_ttl_sec"), "cache_ttl_sec has no effect without a cache_key");
    }
}

fn contains_write_keyword(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    WRITE_KEYWORDS
        .iter()
        .any(|kw| upper.contains(&format!("{kw} ")))
}

fn validate_httpcall_step(locator: &str, step: &StepConfig, result: &mut ValidationResult) {
    if step.url.is_none() {
        result.error(format!("{locator}.url"), "httpcall step requires 'url'");
    }
    if let Some(method) = &step.method {
        if !ALLOWED_METHODS.contains(&method.to_uppercase().as_str()) {
            result.error(format!("{locator}.method"), format!("method must be one of {ALLOWED_METHODS:?}"));
        }
    }
    if let Some(parse) = &step.parse {
        if !ALLOWED_PARSE_MODES.contains(&parse.as_str()) {
            result.error(format!("{locator}.parse"), "parse mode must be one of json, text, form, or empty");
        }
    }
    if let Some(retry) = &step.retry {
        if retry.initial_backoff_sec < 0.0 || retry.max_backoff_sec < 0.0 {
            result.error(format!("{locator}.retry"), "retry backoff values must be non-negative");
        }
    }
    if step.cache_key.is_none() && step.cache_ttl_sec > 0 {
        result.warn(format!("{locator}.cache_ttl_sec"), "cache_ttl_sec has no effect without a cache_key");
    }
}

fn validate_response_step(locator: &str, step: &StepConfig, result: &mut ValidationResult) {
    if step.template.is_none() {
        result.error(format!("{locator}.template"), "response step requires 'template'");
    }
    if let Some(status) = step.status {
        if !(100..=599).contains(&status) {
            result.error(format!("{locator}.status"), "status must be in [100, 599]");
        }
    }
}

fn validate_block_step(
    locator: &str,
    step: &StepConfig,
    aliases: &BTreeSet<String>,
    ctx: &ValidationContext,
    result: &mut ValidationResult,
) {
    if step.step_type.is_none() {
        // inferred block: leaf fields must be entirely absent to avoid
        // ambiguity with a misconfigured query/httpcall/response step.
    }
    if step.sql.is_some() || step.url.is_some() || step.template.is_some() {
        result.error(locator, "block steps cannot carry leaf fields (sql/url/template)");
    }
    if step.steps.is_empty() {
        result.error(locator, "block steps must have at least one nested step");
    }

    if let Some(iterate) = &step.iterate {
        if let Err(e) = parser::parse(&iterate.over) {
            result.error(format!("{locator}.iterate.over"), format!("invalid iterate expression: {e}"));
        }
        if iterate.as_name.trim().is_empty() {
            result.error(format!("{locator}.iterate.as"), "iterate.as must be non-empty");
        }
    }

    let multi = step.steps.len() > 1;
    for (i, child) in step.steps.iter().enumerate() {
        if child.resolved_kind() == Some(StepKind::Response) {
            result.error(format!("{locator}.steps[{i}]"), "response steps are not allowed inside a block");
            continue;
        }
        validate_step(&format!("{locator}.steps[{i}]"), child, aliases, ctx, true, multi, result);
    }
}

/// Minimal 5-field cron grammar check: five whitespace-separated fields,
/// each either `*` or a comma/range/step expression over digits.
fn parse_cron(schedule: &str) -> Result<(), String> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    for field in fields {
        if !is_valid_cron_field(field) {
            return Err(format!("invalid cron field '{field}'"));
        }
    }
    Ok(())
}

fn is_valid_cron_field(field: &str) -> bool {
    field.split(',').all(|part| {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        if let Some(s) = step {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                return false;
            }
        }
        if range == "*" {
            return true;
        }
        range.split('-').all(|bound| !bound.is_empty() && bound.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Not part of the public param-type enum's validation above since
/// parameter *types* are always valid serde variants by construction;
/// kept here only to document that `ParamType` needs no further runtime
/// validation beyond what `serde` already enforces at parse time.
#[allow(dead_code)]
fn _all_param_types_are_statically_valid(_: ParamType) {}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_workflow::config::{HttpTriggerConfig, ParamConfig, StepConfig};
    use std::collections::BTreeMap;

    /// `blank_step()` is crate-private to flowcore-workflow, so
    /// tests here build the zeroed shape by hand via serde instead.
    fn blank_step() -> StepConfig {
        serde_json::from_value(serde_json::json!({ "steps": [] })).unwrap()
    }

    fn base_workflow() -> WorkflowConfig {
        WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![TriggerConfig::Http(HttpTriggerConfig {
                path: "/api/test".to_string(),
                method: "GET".to_string(),
                params: vec![],
                rate_limits: vec![],
                cache_key: None,
                cache_ttl_sec: 0,
            })],
            steps: vec![{
                let mut s = blank_step();
                s.name = Some("respond".to_string());
                s.template = Some("ok".to_string());
                s
            }],
        }
    }

    #[test]
    fn valid_minimal_workflow_passes() {
        let result = validate(&base_workflow(), &ValidationContext::default());
        assert!(result.valid(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_sql_template_interpolation() {
        let mut wf = base_workflow();
        let mut step = blank_step();
        step.name = Some("fetch".to_string());
        step.database = Some("primary".to_string());
        step.sql = Some("SELECT * FROM t WHERE n = '{{.name}}'".to_string());
        wf.steps = vec![step];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("template interpolation") && e.message.contains("@param")));
    }

    #[test]
    fn rejects_missing_path_param() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Http(HttpTriggerConfig {
            path: "/api/users/{id}".to_string(),
            method: "GET".to_string(),
            params: vec![],
            rate_limits: vec![],
            cache_key: None,
            cache_ttl_sec: 0,
        })];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn accepts_declared_required_path_param() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Http(HttpTriggerConfig {
            path: "/api/users/{id}".to_string(),
            method: "GET".to_string(),
            params: vec![ParamConfig {
                name: "id".to_string(),
                param_type: ParamType::String,
                required: true,
                default: None,
            }],
            rate_limits: vec![],
            cache_key: None,
            cache_ttl_sec: 0,
        })];
        let result = validate(&wf, &ValidationContext::default());
        assert!(result.valid(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_duplicate_route() {
        let mut wf = base_workflow();
        wf.triggers.push(wf.triggers[0].clone());
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn warns_on_all_conditional_responses() {
        let mut wf = base_workflow();
        let mut step = blank_step();
        step.name = Some("maybe".to_string());
        step.template = Some("ok".to_string());
        step.condition = Some("true".to_string());
        wf.steps = vec![step];
        let result = validate(&wf, &ValidationContext::default());
        assert!(result.valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn errors_on_multiple_unconditional_responses() {
        let mut wf = base_workflow();
        let mut step2 = blank_step();
        step2.name = Some("also_respond".to_string());
        step2.template = Some("ok2".to_string());
        wf.steps.push(step2);
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn rejects_block_with_leaf_fields() {
        let mut wf = base_workflow();
        let mut block = blank_step();
        block.name = Some("blk".to_string());
        block.step_type = Some(StepKind::Block);
        block.url = Some("https://example.com".to_string());
        block.steps = vec![{
            let mut s = blank_step();
            s.name = Some("inner".to_string());
            s.url = Some("https://example.com".to_string());
            s
        }];
        wf.steps = vec![block];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn rejects_response_step_inside_block() {
        let mut wf = base_workflow();
        let mut block = blank_step();
        block.name = Some("blk".to_string());
        block.step_type = Some(StepKind::Block);
        block.steps = vec![{
            let mut s = blank_step();
            s.name = Some("inner_response".to_string());
            s.template = Some("oops".to_string());
            s
        }];
        wf.steps = vec![block];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn rejects_skip_outside_block() {
        let mut wf = base_workflow();
        let mut step = blank_step();
        step.name = Some("fetch".to_string());
        step.database = Some("primary".to_string());
        step.sql = Some("SELECT 1".to_string());
        step.on_error = OnError::Skip;
        wf.steps = vec![step];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn rejects_unknown_rate_limit_pool() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Http(HttpTriggerConfig {
            path: "/api/test".to_string(),
            method: "GET".to_string(),
            params: vec![],
            rate_limits: vec![RateLimitRef {
                pool: Some("nope".to_string()),
                requests_per_second: None,
                burst: None,
            }],
            cache_key: None,
            cache_ttl_sec: 0,
        })];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn accepts_known_rate_limit_pool() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Http(HttpTriggerConfig {
            path: "/api/test".to_string(),
            method: "GET".to_string(),
            params: vec![],
            rate_limits: vec![RateLimitRef {
                pool: Some("global".to_string()),
                requests_per_second: None,
                burst: None,
            }],
            cache_key: None,
            cache_ttl_sec: 0,
        })];
        let mut ctx = ValidationContext::default();
        ctx.rate_limit_pools.insert("global".to_string());
        let result = validate(&wf, &ctx);
        assert!(result.valid(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_cyclic_alias() {
        let mut wf = base_workflow();
        wf.aliases.insert("a".to_string(), "b".to_string());
        wf.aliases.insert("b".to_string(), "a".to_string());
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    #[test]
    fn valid_cron_schedule_passes() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Cron(flowcore_workflow::config::CronTriggerConfig {
            schedule: "*/5 * * * *".to_string(),
            params: vec![],
            rate_limits: vec![],
            cache_key: None,
        })];
        let result = validate(&wf, &ValidationContext::default());
        assert!(result.valid(), "{:?}", result.errors);
    }

    #[test]
    fn invalid_cron_schedule_fails() {
        let mut wf = base_workflow();
        wf.triggers = vec![TriggerConfig::Cron(flowcore_workflow::config::CronTriggerConfig {
            schedule: "not a cron".to_string(),
            params: vec![],
            rate_limits: vec![],
            cache_key: None,
        })];
        let result = validate(&wf, &ValidationContext::default());
        assert!(!result.valid());
    }

    fn query_step(database: &str, sql: &str) -> StepConfig {
        let mut s = blank_step();
        s.name = Some("fetch".to_string());
        s.database = Some(database.to_string());
        s.sql = Some(sql.to_string());
        s
    }

    #[test]
    fn rejects_query_step_against_unknown_database_when_context_declares_some() {
        let mut wf = base_workflow();
        wf.steps.insert(0, query_step("primary", "SELECT 1"));
        let mut ctx = ValidationContext::default();
        ctx.databases.insert("analytics".to_string(), false);
        let result = validate(&wf, &ctx);
        assert!(!result.valid());
        assert!(result.errors.iter().any(|e| e.message.contains("unknown database")));
    }

    #[test]
    fn allows_any_database_name_when_context_declares_none() {
        let mut wf = base_workflow();
        wf.steps.insert(0, query_step("primary", "SELECT 1"));
        let result = validate(&wf, &ValidationContext::default());
        assert!(result.valid(), "{:?}", result.errors);
    }

    #[test]
    fn write_keyword_against_read_only_database_is_an_error() {
        let mut wf = base_workflow();
        wf.steps.insert(0, query_step("primary", "DELETE FROM t WHERE id = 1"));
        let mut ctx = ValidationContext::default();
        ctx.databases.insert("primary".to_string(), true);
        let result = validate(&wf, &ctx);
        assert!(!result.valid());
        assert!(result.errors.iter().any(|e| e.message.contains("read-only")));
    }

    #[test]
    fn write_keyword_against_writable_database_is_only_a_warning() {
        let mut wf = base_workflow();
        wf.steps.insert(0, query_step("primary", "DELETE FROM t WHERE id = 1"));
        let mut ctx = ValidationContext::default();
        ctx.databases.insert("primary".to_string(), false);
        let result = validate(&wf, &ctx);
        assert!(result.valid(), "{:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.message.contains("write statement")));
    }
}
