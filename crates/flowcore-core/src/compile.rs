//! Workflow-level compiler (§4.2): walks a `WorkflowConfig` and emits a
//! `CompiledWorkflow` — a total function modulo the error cases the spec
//! enumerates, each wrapped with a locator so an author can find the
//! offending field.
//!
//! Grounded on the teacher's own single-pass "resolve then freeze"
//! compilation of a workflow graph into an executable form
//! (`ada-n8n/src/executor.rs`'s `resolve_execution_order` followed by
//! node materialization), generalized from a node DAG to this step tree.

use std::collections::BTreeMap;

use thiserror::Error;

use flowcore_workflow::config::{
    CronTriggerConfig, HttpTriggerConfig, IterateConfig, OnError, ParamConfig, RateLimitRef,
    StepConfig, StepKind, TriggerConfig, WorkflowConfig,
};
use flowcore_workflow::error::WorkflowError;

use crate::expr::alias::build_alias_table;
use crate::expr::compile::{compile as compile_expr, ExpressionError, Program};
use crate::expr::ast::Expr;
use crate::template::{parse_template, Template, TemplateParseError};

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("{locator}: {source}")]
    Expression {
        locator: String,
        #[source]
        source: ExpressionError,
    },
    #[error("{locator}: {source}")]
    Template {
        locator: String,
        #[source]
        source: TemplateParseError,
    },
    #[error("{0}")]
    Workflow(#[from] WorkflowError),
}

impl CompileError {
    fn expr(locator: impl Into<String>, source: ExpressionError) -> Self {
        CompileError::Expression {
            locator: locator.into(),
            source,
        }
    }

    fn template(locator: impl Into<String>, source: TemplateParseError) -> Self {
        CompileError::Template {
            locator: locator.into(),
            source,
        }
    }
}

/// A step's condition, recorded as a compiled program plus whether the
/// source was a bare alias reference (`NAME`) or negated (`!NAME`) —
/// the executor never needs this distinction, but keeping the original
/// form alongside the program matches `Program::source`'s own
/// "reconstructible from text" contract and keeps compile-time locators
/// readable.
pub type CompiledCondition = Program;

#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub name: String,
    pub timeout_sec: u64,
    pub triggers: Vec<CompiledTrigger>,
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone)]
pub enum CompiledTrigger {
    Http(CompiledHttpTrigger),
    Cron(CompiledCronTrigger),
}

#[derive(Debug, Clone)]
pub struct CompiledHttpTrigger {
    pub path: String,
    pub method: String,
    pub params: Vec<ParamConfig>,
    pub rate_limits: Vec<RateLimitRef>,
    pub cache_key: Option<Template>,
    pub cache_ttl_sec: u64,
}

#[derive(Debug, Clone)]
pub struct CompiledCronTrigger {
    pub schedule: String,
}

#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub name: Option<String>,
    pub disabled: bool,
    pub condition: Option<CompiledCondition>,
    pub on_error: OnError,
    pub kind: CompiledStepKind,
}

#[derive(Debug, Clone)]
pub enum CompiledStepKind {
    Query {
        database: String,
        sql: String,
        params: BTreeMap<String, Template>,
        isolation: Option<String>,
        lock_timeout_ms: Option<u64>,
        deadlock_priority: Option<String>,
        json_columns: Vec<String>,
        cache_key: Option<Template>,
        cache_ttl_sec: u64,
        computed_params: BTreeMap<String, Program>,
    },
    Httpcall {
        url: Template,
        method: String,
        headers: BTreeMap<String, Template>,
        body: Option<Template>,
        parse: Option<String>,
        timeout_sec: Option<u64>,
        retry: Option<flowcore_workflow::config::RetryConfig>,
        cache_key: Option<Template>,
        cache_ttl_sec: u64,
        computed_params: BTreeMap<String, Program>,
    },
    Response {
        status: u16,
        template: Template,
        computed_params: BTreeMap<String, Program>,
    },
    Block {
        iterate: Option<CompiledIterate>,
        children: Vec<CompiledStep>,
    },
}

#[derive(Debug, Clone)]
pub struct CompiledIterate {
    pub over: Program,
    pub as_name: String,
    pub on_error: OnError,
}

/// Compiles a workflow. Assumes the workflow has already passed
/// [`crate::validate::validate`] — this function still surfaces
/// malformed expressions/templates as errors, but does not repeat the
/// validator's structural checks (duplicate routes, reserved param
/// names, and so on).
pub fn compile(workflow: &WorkflowConfig) -> Result<CompiledWorkflow, CompileError> {
    let aliases = build_alias_table(&workflow.aliases)?;

    let triggers = workflow
        .triggers
        .iter()
        .enumerate()
        .map(|(i, t)| compile_trigger(&format!("triggers[{i}]"), t))
        .collect::<Result<Vec<_>, _>>()?;

    let steps = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| compile_step(&step_locator(i, s), s, &aliases))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledWorkflow {
        name: workflow.name.clone(),
        timeout_sec: workflow.timeout_sec,
        triggers,
        steps,
    })
}

fn step_locator(index: usize, step: &StepConfig) -> String {
    match &step.name {
        Some(name) => format!("steps[{name}]"),
        None => format!("steps[{index}]"),
    }
}

fn compile_trigger(locator: &str, trigger: &TriggerConfig) -> Result<CompiledTrigger, CompileError> {
    match trigger {
        TriggerConfig::Http(http) => Ok(CompiledTrigger::Http(compile_http_trigger(locator, http)?)),
        TriggerConfig::Cron(cron) => Ok(CompiledTrigger::Cron(compile_cron_trigger(cron))),
    }
}

fn compile_http_trigger(locator: &str, http: &HttpTriggerConfig) -> Result<CompiledHttpTrigger, CompileError> {
    let cache_key = http
        .cache_key
        .as_deref()
        .map(|t| parse_template(t).map_err(|e| CompileError::template(format!("{locator}.cache_key"), e)))
        .transpose()?;

    Ok(CompiledHttpTrigger {
        path: http.path.clone(),
        method: http.method.to_uppercase(),
        params: http.params.clone(),
        rate_limits: http.rate_limits.clone(),
        cache_key,
        cache_ttl_sec: http.cache_ttl_sec,
    })
}

fn compile_cron_trigger(cron: &CronTriggerConfig) -> CompiledCronTrigger {
    CompiledCronTrigger {
        schedule: cron.schedule.clone(),
    }
}

fn compile_step(
    locator: &str,
    step: &StepConfig,
    aliases: &BTreeMap<String, Expr>,
) -> Result<CompiledStep, CompileError> {
    let condition = step
        .condition
        .as_deref()
        .map(|source| compile_condition(locator, source, aliases))
        .transpose()?;

    let kind = step
        .resolved_kind()
        .ok_or_else(|| CompileError::Workflow(WorkflowError::located(locator, "step kind could not be determined")))?;

    let computed_params = compile_computed_params(locator, &step.computed_params, aliases)?;

    let compiled_kind = match kind {
        StepKind::Query => compile_query_step(locator, step, computed_params)?,
        StepKind::Httpcall => compile_httpcall_step(locator, step, aliases, computed_params)?,
        StepKind::Response => compile_response_step(locator, step, computed_params)?,
        StepKind::Block => compile_block_step(locator, step, aliases)?,
    };

    Ok(CompiledStep {
        name: step.name.clone(),
        disabled: step.disabled,
        condition,
        on_error: step.on_error,
        kind: compiled_kind,
    })
}

/// A condition source is one of: a bare alias name (reuse its already-
/// compiled program), `!NAME` referencing an alias (synthesize
/// `!(<alias source>)` and compile that), or an inline expression
/// (compile fresh against the alias table).
fn compile_condition(
    locator: &str,
    source: &str,
    aliases: &BTreeMap<String, Expr>,
) -> Result<Program, CompileError> {
    let trimmed = source.trim();
    if let Some(name) = trimmed.strip_prefix('!') {
        let name = name.trim();
        if aliases.contains_key(name) {
            let negated = format!("!({name})");
            return compile_expr(&negated, aliases, true)
                .map_err(|e| CompileError::expr(format!("{locator}.condition"), e));
        }
    }
    compile_expr(trimmed, aliases, true).map_err(|e| CompileError::expr(format!("{locator}.condition"), e))
}

fn compile_computed_params(
    locator: &str,
    computed: &BTreeMap<String, String>,
    aliases: &BTreeMap<String, Expr>,
) -> Result<BTreeMap<String, Program>, CompileError> {
    computed
        .iter()
        .map(|(name, source)| {
            let program = compile_expr(source, aliases, false)
                .map_err(|e| CompileError::expr(format!("{locator}.computed_params[{name}]"), e))?;
            Ok((name.clone(), program))
        })
        .collect()
}

fn compile_query_step(
    locator: &str,
    step: &StepConfig,
    computed_params: BTreeMap<String, Program>,
) -> Result<CompiledStepKind, CompileError> {
    let database = step
        .database
        .clone()
        .ok_or_else(|| CompileError::Workflow(WorkflowError::located(locator, "query step requires 'database'")))?;
    let sql = step
        .sql
        .clone()
        .ok_or_else(|| CompileError::Workflow(WorkflowError::located(locator, "query step requires 'sql'")))?;

    let params = step
        .params
        .iter()
        .map(|(name, t)| {
            let template = parse_template(t)
                .map_err(|e| CompileError::template(format!("{locator}.params[{name}]"), e))?;
            Ok((name.clone(), template))
        })
        .collect::<Result<BTreeMap<_, _>, CompileError>>()?;

    let cache_key = step
        .cache_key
        .as_deref()
        .map(|t| parse_template(t).map_err(|e| CompileError::template(format!("{locator}.cache_key"), e)))
        .transpose()?;

    Ok(CompiledStepKind::Query {
        database,
        sql,
        params,
        isolation: step.isolation.clone(),
        lock_timeout_ms: step.lock_timeout_ms,
        deadlock_priority: step.deadlock_priority.clone(),
        json_columns: step.json_columns.clone(),
        cache_key,
        cache_ttl_sec: step.cache_ttl_sec,
        computed_params,
    })
}

fn compile_httpcall_step(
    locator: &str,
    step: &StepConfig,
    _aliases: &BTreeMap<String, Expr>,
    computed_params: BTreeMap<String, Program>,
) -> Result<CompiledStepKind, CompileError> {
    let url_source = step
        .url
        .as_deref()
        .ok_or_else(|| CompileError::Workflow(WorkflowError::located(locator, "httpcall step requires 'url'")))?;
    let url = parse_template(url_source).map_err(|e| CompileError::template(format!("{locator}.url"), e))?;

    let headers = step
        .headers
        .iter()
        .map(|(name, t)| {
            let template = parse_template(t)
                .map_err(|e| CompileError::template(format!("{locator}.headers[{name}]"), e))?;
            Ok((name.clone(), template))
        })
        .collect::<Result<BTreeMap<_, _>, CompileError>>()?;

    let body = step
        .body
        .as_deref()
        .map(|t| parse_template(t).map_err(|e| CompileError::template(format!("{locator}.body"), e)))
        .transpose()?;

    let cache_key = step
        .cache_key
        .as_deref()
        .map(|t| parse_template(t).map_err(|e| CompileError::template(format!("{locator}.cache_key"), e)))
        .transpose()?;

    Ok(CompiledStepKind::Httpcall {
        url,
        method: step.method.clone().unwrap_or_else(|| "GET".to_string()).to_uppercase(),
        headers,
        body,
        parse: step.parse.clone(),
        timeout_sec: step.timeout_sec,
        retry: step.retry.clone(),
        cache_key,
        cache_ttl_sec: step.cache_ttl_sec,
        computed_params,
    })
}

fn compile_response_step(
    locator: &str,
    step: &StepConfig,
    computed_params: BTreeMap<String, Program>,
) -> Result<CompiledStepKind, CompileError> {
    let source = step
        .template
        .as_deref()
        .ok_or_else(|| CompileError::Workflow(WorkflowError::located(locator, "response step requires 'template'")))?;
    let template = parse_template(source).map_err(|e| CompileError::template(format!("{locator}.template"), e))?;

    Ok(CompiledStepKind::Response {
        status: step.status.unwrap_or(200),
        template,
        computed_params,
    })
}

fn compile_block_step(
    locator: &str,
    step: &StepConfig,
    aliases: &BTreeMap<String, Expr>,
) -> Result<CompiledStepKind, CompileError> {
    let iterate = step
        .iterate
        .as_ref()
        .map(|it| compile_iterate(locator, it, aliases))
        .transpose()?;

    let children = step
        .steps
        .iter()
        .enumerate()
        .map(|(i, child)| compile_step(&format!("{locator}.steps[{}]", child_locator_suffix(i, child)), child, aliases))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledStepKind::Block { iterate, children })
}

fn child_locator_suffix(index: usize, step: &StepConfig) -> String {
    step.name.clone().unwrap_or_else(|| index.to_string())
}

fn compile_iterate(
    locator: &str,
    iterate: &IterateConfig,
    aliases: &BTreeMap<String, Expr>,
) -> Result<CompiledIterate, CompileError> {
    let over = compile_expr(&iterate.over, aliases, false)
        .map_err(|e| CompileError::expr(format!("{locator}.iterate.over"), e))?;
    Ok(CompiledIterate {
        over,
        as_name: iterate.as_name.clone(),
        on_error: iterate.on_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_workflow::config::HttpTriggerConfig;

    fn blank_step() -> StepConfig {
        serde_json::from_value(serde_json::json!({ "steps": [] })).unwrap()
    }

    fn base_workflow() -> WorkflowConfig {
        WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 30,
            aliases: BTreeMap::new(),
            triggers: vec![TriggerConfig::Http(HttpTriggerConfig {
                path: "/api/test".to_string(),
                method: "get".to_string(),
                params: vec![],
                rate_limits: vec![],
                cache_key: None,
                cache_ttl_sec: 0,
            })],
            steps: vec![{
                let mut s = blank_step();
                s.name = Some("respond".to_string());
                s.template = Some("hello {{.trigger.params.name}}".to_string());
                s
            }],
        }
    }

    #[test]
    fn compiles_minimal_workflow() {
        let compiled = compile(&base_workflow()).unwrap();
        assert_eq!(compiled.triggers.len(), 1);
        assert_eq!(compiled.steps.len(), 1);
        match &compiled.triggers[0] {
            CompiledTrigger::Http(h) => assert_eq!(h.method, "GET"),
            _ => panic!("expected http trigger"),
        }
    }

    #[test]
    fn negated_alias_condition_compiles_to_negation() {
        let mut wf = base_workflow();
        wf.aliases.insert("ready".to_string(), "1 == 1".to_string());
        let mut step = blank_step();
        step.name = Some("maybe".to_string());
        step.template = Some("skip".to_string());
        step.condition = Some("!ready".to_string());
        wf.steps = vec![step];
        let compiled = compile(&wf).unwrap();
        assert!(compiled.steps[0].condition.is_some());
    }

    #[test]
    fn rejects_sql_with_dynamic_division() {
        let mut wf = base_workflow();
        let mut step = blank_step();
        step.name = Some("fetch".to_string());
        step.database = Some("primary".to_string());
        step.sql = Some("SELECT 1".to_string());
        step.computed_params.insert("ratio".to_string(), "total / count".to_string());
        wf.steps = vec![step];
        let err = compile(&wf).unwrap_err();
        assert!(matches!(err, CompileError::Expression { .. }));
    }

    #[test]
    fn block_compiles_iterate_and_children() {
        let mut wf = base_workflow();
        let mut inner = blank_step();
        inner.name = Some("inner".to_string());
        inner.database = Some("primary".to_string());
        inner.sql = Some("SELECT 1".to_string());

        let mut block = blank_step();
        block.name = Some("loop".to_string());
        block.step_type = Some(StepKind::Block);
        block.iterate = Some(IterateConfig {
            over: "steps.fetch.data".to_string(),
            as_name: "item".to_string(),
            on_error: OnError::Continue,
        });
        block.steps = vec![inner];
        wf.steps = vec![block];

        let compiled = compile(&wf).unwrap();
        match &compiled.steps[0].kind {
            CompiledStepKind::Block { iterate, children } => {
                assert!(iterate.is_some());
                assert_eq!(children.len(), 1);
            }
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn reports_locator_for_bad_template() {
        let mut wf = base_workflow();
        let mut step = blank_step();
        step.name = Some("bad_respond".to_string());
        step.template = Some("{{unknownPathThatIsFine".to_string());
        wf.steps = vec![step];
        let err = compile(&wf).unwrap_err();
        match err {
            CompileError::Template { locator, .. } => assert!(locator.contains("bad_respond")),
            other => panic!("expected template error, got {other:?}"),
        }
    }
}
