//! The executor (§4.4): a per-request state machine that walks a
//! `CompiledWorkflow`'s steps in document order, dispatching each to its
//! kind-specific collaborator and threading an ever-growing environment
//! forward.
//!
//! Grounded on the teacher's `engine.rs` node-execution loop
//! (`ada-n8n/src/executor.rs`'s `execute_node`/between-node cancellation
//! check), generalized from "run a DAG of nodes" to "run a document-
//! ordered step list with conditions, blocks, and caching."

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use flowcore_workflow::context::{DeadlineCtx, Logger, TriggerData};
use flowcore_workflow::config::OnError;
use flowcore_workflow::result::{IterationRecord, StepResult, StepResultKind};
use flowcore_workflow::value::Value;

use crate::collab::{
    is_valid_public_id, CollabError, Db, HttpClient, HttpRequest, QueryOpts, StepCache,
};
use crate::compile::{CompiledCronTrigger, CompiledHttpTrigger, CompiledStep, CompiledStepKind, CompiledWorkflow};
use crate::expr::compile::Program;
use crate::expr::eval::{eval, Environment};
use crate::template::render as render_template;

#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("workflow execution was canceled")]
    Canceled,
    #[error("workflow deadline exceeded")]
    DeadlineExceeded,
    #[error("step '{name}' failed: {error}")]
    StepFailed { name: String, error: String },
}

/// Where a completed response is written. The server binary implements
/// this over its own HTTP response type; tests use `CapturingSink`.
pub trait ResponseSink {
    fn send(&mut self, status: u16, body: String);
}

#[derive(Debug, Default, Clone)]
pub struct CapturingSink {
    pub status: Option<u16>,
    pub body: Option<String>,
}

impl ResponseSink for CapturingSink {
    fn send(&mut self, status: u16, body: String) {
        self.status = Some(status);
        self.body = Some(body);
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub response_sent: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<ExecutionError>,
    pub step_results: BTreeMap<String, StepResult>,
}

/// The collaborator handles a single execution needs. Assembled by the
/// caller (tests, or `flowcore-server`) from concrete implementations of
/// the `collab` traits.
pub struct Collaborators {
    pub db: Arc<dyn Db>,
    pub http: Arc<dyn HttpClient>,
    pub step_cache: Option<Arc<dyn StepCache>>,
}

/// Runs a compiled workflow to completion for one trigger event.
///
/// Safe to call concurrently on the same `CompiledWorkflow` from many
/// requests — all mutable state lives in this call's stack (§5
/// "shared-nothing executor").
pub async fn execute(
    deadline: DeadlineCtx,
    workflow: &CompiledWorkflow,
    trigger: TriggerData,
    request_id: String,
    sink: &mut dyn ResponseSink,
    variables: BTreeMap<String, Value>,
    collab: &Collaborators,
    logger: Arc<dyn Logger>,
) -> ExecuteResult {
    let common = Common {
        workflow_name: workflow.name.clone(),
        request_id,
        start_time: Utc::now(),
        deadline,
        logger,
    };
    let mut scope = Scope {
        steps: BTreeMap::new(),
        block: None,
    };

    let outcome = execute_steps(&workflow.steps, &mut scope, &trigger, &variables, &common, collab, sink).await;

    match outcome {
        StepOutcome::ResponseSent { status, body } => ExecuteResult {
            response_sent: true,
            status: Some(status),
            body: Some(body),
            error: None,
            step_results: scope.steps,
        },
        StepOutcome::Abort(error) => ExecuteResult {
            response_sent: false,
            status: None,
            body: None,
            error: Some(error),
            step_results: scope.steps,
        },
        StepOutcome::Continue => ExecuteResult {
            response_sent: false,
            status: None,
            body: None,
            error: None,
            step_results: scope.steps,
        },
    }
}

struct Common {
    workflow_name: String,
    request_id: String,
    start_time: DateTime<Utc>,
    deadline: DeadlineCtx,
    logger: Arc<dyn Logger>,
}

/// The current step namespace plus, inside a block iteration, the
/// iteration-specific bindings and a snapshot of the enclosing scope's
/// environment root (exposed as `parent`). Nested blocks chain this
/// naturally: a block two levels deep sees its immediate parent's root,
/// which itself already carries a `parent` key one level further up.
struct Scope {
    steps: BTreeMap<String, StepResult>,
    block: Option<BlockFrame>,
}

struct BlockFrame {
    as_name: String,
    item: Value,
    index: usize,
    total: usize,
    parent_root: Value,
}

enum StepOutcome {
    Continue,
    Abort(ExecutionError),
    ResponseSent { status: u16, body: String },
}

fn fields(pairs: &[(&str, String)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn execute_steps(
    steps: &[CompiledStep],
    scope: &mut Scope,
    trigger: &TriggerData,
    vars: &BTreeMap<String, Value>,
    common: &Common,
    collab: &Collaborators,
    sink: &mut dyn ResponseSink,
) -> StepOutcome {
    for (index, step) in steps.iter().enumerate() {
        if step.disabled {
            continue;
        }

        if common.deadline.should_stop() {
            return StepOutcome::Abort(if common.deadline.is_cancelled() {
                ExecutionError::Canceled
            } else {
                ExecutionError::DeadlineExceeded
            });
        }

        let name = step.name.clone().unwrap_or_else(|| format!("step_{index}"));

        if let Some(condition) = &step.condition {
            let root = build_root(scope, common, trigger, vars);
            let env = environment(root);
            let passes = match eval(condition, &env) {
                Ok(v) => v.is_truthy(),
                Err(e) => {
                    common.logger.warn(
                        "step_condition_error",
                        &fields(&[("step", name.clone()), ("error", e.to_string())]),
                    );
                    false
                }
            };
            if !passes {
                continue;
            }
        }

        let root = build_root(scope, common, trigger, vars);
        let env = environment(root.clone());
        let computed_params = match compile_computed_params(step, &env) {
            Ok(p) => p,
            Err(e) => {
                let result = StepResult {
                    success: false,
                    error: Some(e.to_string()),
                    duration: Duration::ZERO,
                    cache_hit: false,
                    kind: StepResultKind::Response {
                        status_code: 0,
                        body: String::new(),
                    },
                };
                scope.steps.insert(name.clone(), result);
                match step.on_error {
                    OnError::Abort => {
                        return StepOutcome::Abort(ExecutionError::StepFailed { name, error: e.to_string() })
                    }
                    _ => {
                        common.logger.warn(
                            "workflow_step_failed_continue",
                            &fields(&[("step", name.clone()), ("error", e.to_string())]),
                        );
                        continue;
                    }
                }
            }
        };

        // Computed params are stored under `params.<name>` in the
        // environment every kind-specific template renders against, not
        // just the query param set (§4.4 step 4).
        let env = environment(with_params(root, &computed_params));

        let started = std::time::Instant::now();
        let result = match &step.kind {
            CompiledStepKind::Query { .. } => {
                run_query_step(step, &env, &computed_params, common, collab, started).await
            }
            CompiledStepKind::Httpcall { .. } => {
                run_httpcall_step(step, &env, &computed_params, common, collab, started).await
            }
            CompiledStepKind::Response { status, template, .. } => {
                run_response_step(*status, template, &env, started)
            }
            CompiledStepKind::Block { iterate, children } => {
                run_block_step(iterate.as_ref(), children, scope, common, collab, trigger, vars, started).await
            }
        };

        let failed = !result.success;
        let error_text = result.error.clone();
        let is_response = matches!(result.kind, StepResultKind::Response { .. });
        scope.steps.insert(name.clone(), result);

        if failed {
            match step.on_error {
                OnError::Abort => {
                    return StepOutcome::Abort(ExecutionError::StepFailed {
                        name,
                        error: error_text.unwrap_or_default(),
                    })
                }
                _ => {
                    common.logger.warn(
                        "workflow_step_failed_continue",
                        &fields(&[("step", name.clone()), ("error", error_text.unwrap_or_default())]),
                    );
                    continue;
                }
            }
        }

        if is_response {
            if let Some(StepResultKind::Response { status_code, body }) = scope.steps.get(&name).map(|r| r.kind.clone()) {
                sink.send(status_code, body.clone());
                return StepOutcome::ResponseSent { status: status_code, body };
            }
        }
    }

    StepOutcome::Continue
}

fn environment(root: Value) -> Environment {
    Environment::new(root).with_public_id_validator(Arc::new(is_valid_public_id))
}

fn compile_computed_params(
    step: &CompiledStep,
    env: &Environment,
) -> Result<BTreeMap<String, Value>, crate::expr::compile::ExpressionError> {
    let programs: &BTreeMap<String, Program> = match &step.kind {
        CompiledStepKind::Query { computed_params, .. } => computed_params,
        CompiledStepKind::Httpcall { computed_params, .. } => computed_params,
        CompiledStepKind::Response { computed_params, .. } => computed_params,
        CompiledStepKind::Block { .. } => return Ok(BTreeMap::new()),
    };
    let mut out = BTreeMap::new();
    for (name, program) in programs {
        let value = eval(program, env)?;
        out.insert(name.clone(), coerce_int_like(value));
    }
    Ok(out)
}

/// Coerces an integer-looking string to `Int`, bounded to `i64` range
/// (§4.4 step 4). A pure-digit string goes through the direct integer
/// parser; a fractional string representing a whole number is accepted
/// only when it fits in `i64` without rounding surprises.
fn coerce_int_like(v: Value) -> Value {
    if let Value::String(s) = &v {
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 9_223_372_036_854_775_808.0 {
                return Value::Int(f as i64);
            }
        }
    }
    v
}

/// Inserts the step's computed parameters under `params.<name>` in the
/// environment root (§4.4 step 4) — distinct from `Param`, which stays
/// an alias for `trigger.params`.
fn with_params(root: Value, params: &BTreeMap<String, Value>) -> Value {
    let mut map = match root {
        Value::Map(m) => m,
        other => BTreeMap::from([("value".to_string(), other)]),
    };
    map.insert("params".to_string(), Value::Map(params.clone()));
    Value::Map(map)
}

fn build_root(scope: &Scope, common: &Common, trigger: &TriggerData, vars: &BTreeMap<String, Value>) -> Value {
    let mut map = BTreeMap::new();

    let mut steps_map = BTreeMap::new();
    for (name, result) in &scope.steps {
        steps_map.insert(name.clone(), step_result_view(result));
    }
    map.insert("steps".to_string(), Value::Map(steps_map));
    map.insert("trigger".to_string(), trigger_view(trigger));
    map.insert(
        "workflow".to_string(),
        Value::Map(BTreeMap::from([
            ("name".to_string(), Value::String(common.workflow_name.clone())),
            ("start_time".to_string(), Value::String(common.start_time.to_rfc3339())),
            ("request_id".to_string(), Value::String(common.request_id.clone())),
        ])),
    );
    map.insert("vars".to_string(), Value::Map(vars.clone()));

    let params = match trigger {
        TriggerData::Http { params, .. } => Value::Map(params.clone()),
        TriggerData::Cron { .. } => Value::map(),
    };
    map.insert("Param".to_string(), params);

    if let Some(block) = &scope.block {
        map.insert(block.as_name.clone(), block.item.clone());
        map.insert("_index".to_string(), Value::Int(block.index as i64));
        map.insert("_count".to_string(), Value::Int(block.total as i64));
        map.insert("parent".to_string(), block.parent_root.clone());
    }

    Value::Map(map)
}

fn trigger_view(trigger: &TriggerData) -> Value {
    match trigger {
        TriggerData::Http {
            params,
            headers,
            cookies,
            client_ip,
            method,
            path,
        } => Value::Map(BTreeMap::from([
            ("type".to_string(), Value::String("http".to_string())),
            ("params".to_string(), Value::Map(params.clone())),
            (
                "headers".to_string(),
                Value::Map(headers.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()),
            ),
            (
                "cookies".to_string(),
                Value::Map(cookies.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()),
            ),
            ("client_ip".to_string(), Value::String(client_ip.clone())),
            ("method".to_string(), Value::String(method.clone())),
            ("path".to_string(), Value::String(path.clone())),
        ])),
        TriggerData::Cron { schedule_time, cron } => Value::Map(BTreeMap::from([
            ("type".to_string(), Value::String("cron".to_string())),
            ("schedule_time".to_string(), Value::String(schedule_time.to_rfc3339())),
            ("cron".to_string(), Value::String(cron.clone())),
        ])),
    }
}

/// Projects a `StepResult` into the `steps.<name>` map exposed to
/// expressions/templates, computing the derived cardinality fields at
/// build time rather than storing them (§9 design note).
fn step_result_view(result: &StepResult) -> Value {
    let mut map = BTreeMap::new();
    map.insert("success".to_string(), Value::Bool(result.success));
    map.insert("duration_ms".to_string(), Value::Int(result.duration.as_millis() as i64));
    map.insert("cache_hit".to_string(), Value::Bool(result.cache_hit));
    if let Some(err) = &result.error {
        map.insert("error".to_string(), Value::String(err.clone()));
    }

    match &result.kind {
        StepResultKind::Query { data, count, rows_affected } => {
            map.insert("type".to_string(), Value::String("query".to_string()));
            map.insert("rows_affected".to_string(), Value::Int(*rows_affected as i64));
            insert_rows_and_cardinality(&mut map, data, *count);
        }
        StepResultKind::HttpCall {
            status_code,
            headers,
            response_body,
            data,
            count,
        } => {
            map.insert("type".to_string(), Value::String("httpcall".to_string()));
            map.insert("status_code".to_string(), Value::Int(*status_code as i64));
            map.insert(
                "headers".to_string(),
                Value::Map(headers.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()),
            );
            map.insert("body".to_string(), Value::String(response_body.clone()));
            let rows = data.clone().unwrap_or_default();
            insert_rows_and_cardinality(&mut map, &rows, count.unwrap_or(0));
        }
        StepResultKind::Response { status_code, body } => {
            map.insert("type".to_string(), Value::String("response".to_string()));
            map.insert("status_code".to_string(), Value::Int(*status_code as i64));
            map.insert("body".to_string(), Value::String(body.clone()));
        }
        StepResultKind::Block {
            success_count,
            failure_count,
            skipped_count,
            iterations,
        } => {
            map.insert("type".to_string(), Value::String("block".to_string()));
            map.insert("success_count".to_string(), Value::Int(*success_count as i64));
            map.insert("failure_count".to_string(), Value::Int(*failure_count as i64));
            map.insert("skipped_count".to_string(), Value::Int(*skipped_count as i64));
            map.insert(
                "iterations".to_string(),
                Value::List(iterations.iter().map(iteration_record_view).collect()),
            );
        }
    }

    Value::Map(map)
}

fn insert_rows_and_cardinality(map: &mut BTreeMap<String, Value>, rows: &[BTreeMap<String, Value>], count: usize) {
    map.insert(
        "data".to_string(),
        Value::List(rows.iter().map(|r| Value::Map(r.clone())).collect()),
    );
    map.insert("count".to_string(), Value::Int(count as i64));
    map.insert("found".to_string(), Value::Bool(count > 0));
    map.insert("empty".to_string(), Value::Bool(count == 0));
    map.insert("one".to_string(), Value::Bool(count == 1));
    map.insert("many".to_string(), Value::Bool(count > 1));
    map.insert(
        "row".to_string(),
        rows.first().map(|r| Value::Map(r.clone())).unwrap_or(Value::Null),
    );
}

fn iteration_record_view(record: &IterationRecord) -> Value {
    let mut map = BTreeMap::from([
        ("index".to_string(), Value::Int(record.index as i64)),
        ("item".to_string(), record.item.clone()),
        ("success".to_string(), Value::Bool(record.success)),
    ]);
    if let Some(err) = &record.error {
        map.insert("error".to_string(), Value::String(err.clone()));
    }
    Value::Map(map)
}

async fn run_query_step(
    step: &CompiledStep,
    env: &Environment,
    computed_params: &BTreeMap<String, Value>,
    common: &Common,
    collab: &Collaborators,
    started: std::time::Instant,
) -> StepResult {
    let CompiledStepKind::Query {
        database,
        sql,
        params,
        isolation,
        lock_timeout_ms,
        deadlock_priority,
        json_columns,
        cache_key,
        cache_ttl_sec,
        ..
    } = &step.kind
    else {
        unreachable!("run_query_step called on a non-query step");
    };

    let mut rendered_params: BTreeMap<String, Value> = BTreeMap::new();
    for (name, template) in params {
        match render_template(template, env_root(env)) {
            Ok(s) => {
                rendered_params.insert(name.clone(), Value::String(s));
            }
            Err(e) => return StepResult::query_failure(e.to_string(), started.elapsed()),
        }
    }
    for (name, value) in computed_params {
        rendered_params.insert(format!("params.{name}"), value.clone());
    }

    let resolved_key = match cache_key {
        Some(t) => match render_template(t, env_root(env)) {
            Ok(k) => Some(k),
            Err(e) => {
                common.logger.warn(
                    "step_cache_key_error",
                    &fields(&[("error", e.to_string())]),
                );
                None
            }
        },
        None => None,
    };

    if let (Some(key), Some(cache)) = (&resolved_key, &collab.step_cache) {
        if let Ok(Some(rows)) = cache.get(&common.workflow_name, key).await {
            let mut result = StepResult::query_success(rows, 0, started.elapsed());
            result.cache_hit = true;
            return result;
        }
    }

    let opts = QueryOpts {
        isolation: isolation.clone(),
        lock_timeout_ms: *lock_timeout_ms,
        deadlock_priority: deadlock_priority.clone(),
        json_columns: json_columns.clone(),
    };

    let query_future = collab.db.execute_query(&common.deadline, database, sql, &rendered_params, &opts);
    let outcome = common.deadline.race(query_future).await;

    match outcome {
        None => StepResult::query_failure("deadline exceeded", started.elapsed()),
        Some(Err(e)) => StepResult::query_failure(collab_error_message(e), started.elapsed()),
        Some(Ok((rows, rows_affected))) => {
            if let (Some(key), Some(cache)) = (&resolved_key, &collab.step_cache) {
                let _ = cache
                    .set(
                        &common.workflow_name,
                        key,
                        rows.clone(),
                        Duration::from_secs(*cache_ttl_sec),
                    )
                    .await;
            }
            StepResult::query_success(rows, rows_affected, started.elapsed())
        }
    }
}

async fn run_httpcall_step(
    step: &CompiledStep,
    env: &Environment,
    computed_params: &BTreeMap<String, Value>,
    common: &Common,
    collab: &Collaborators,
    started: std::time::Instant,
) -> StepResult {
    let CompiledStepKind::Httpcall {
        url,
        method,
        headers,
        body,
        parse,
        timeout_sec: _,
        retry,
        cache_key,
        cache_ttl_sec,
        ..
    } = &step.kind
    else {
        unreachable!("run_httpcall_step called on a non-httpcall step");
    };
    let _ = computed_params;

    let resolved_key = match cache_key {
        Some(t) => match render_template(t, env_root(env)) {
            Ok(k) => Some(k),
            Err(e) => {
                common.logger.warn("step_cache_key_error", &fields(&[("error", e.to_string())]));
                None
            }
        },
        None => None,
    };

    if let (Some(key), Some(cache)) = (&resolved_key, &collab.step_cache) {
        if let Ok(Some(rows)) = cache.get(&common.workflow_name, key).await {
            let mut result = StepResult::query_success(rows, 0, started.elapsed());
            result.cache_hit = true;
            return result;
        }
    }

    let rendered_url = match render_template(url, env_root(env)) {
        Ok(u) => u,
        Err(e) => return StepResult::httpcall_failure(e.to_string(), started.elapsed()),
    };
    let mut rendered_headers = BTreeMap::new();
    for (name, t) in headers {
        match render_template(t, env_root(env)) {
            Ok(v) => {
                rendered_headers.insert(name.clone(), v);
            }
            Err(e) => return StepResult::httpcall_failure(e.to_string(), started.elapsed()),
        }
    }
    let rendered_body = match body {
        Some(t) => match render_template(t, env_root(env)) {
            Ok(b) => b,
            Err(e) => return StepResult::httpcall_failure(e.to_string(), started.elapsed()),
        },
        None => String::new(),
    };

    let max_attempts = retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let initial_backoff = retry.as_ref().map(|r| r.initial_backoff_sec).unwrap_or(0.0);
    let max_backoff = retry.as_ref().map(|r| r.max_backoff_sec).unwrap_or(0.0);

    let mut last_error: Option<CollabError> = None;
    let mut response = None;
    for attempt in 1..=max_attempts {
        if common.deadline.should_stop() {
            return StepResult::httpcall_failure("deadline exceeded", started.elapsed());
        }
        let request = HttpRequest {
            method: method.clone(),
            url: rendered_url.clone(),
            headers: rendered_headers.clone(),
            body: rendered_body.clone(),
        };
        match common.deadline.race(collab.http.do_request(&common.deadline, request)).await {
            None => return StepResult::httpcall_failure("deadline exceeded", started.elapsed()),
            Some(Ok(r)) => {
                response = Some(r);
                break;
            }
            Some(Err(e)) => {
                last_error = Some(e);
                if attempt < max_attempts {
                    let backoff = (initial_backoff * 2f64.powi((attempt - 1) as i32)).min(max_backoff.max(initial_backoff));
                    if backoff > 0.0 {
                        if common.deadline.race(tokio::time::sleep(Duration::from_secs_f64(backoff))).await.is_none() {
                            return StepResult::httpcall_failure("deadline exceeded", started.elapsed());
                        }
                    }
                }
            }
        }
    }

    let response = match response {
        Some(r) => r,
        None => {
            return StepResult::httpcall_failure(
                last_error.map(collab_error_message).unwrap_or_else(|| "http call failed".to_string()),
                started.elapsed(),
            )
        }
    };

    let (data, count) = match parse.as_deref() {
        Some("json") => match parse_json_rows(&response.body) {
            Ok(rows) => {
                let count = rows.len();
                (Some(rows), Some(count))
            }
            Err(e) => {
                return StepResult {
                    success: false,
                    error: Some(format!("failed to parse json response: {e}")),
                    duration: started.elapsed(),
                    cache_hit: false,
                    kind: StepResultKind::HttpCall {
                        status_code: response.status,
                        headers: response.headers,
                        response_body: response.body,
                        data: None,
                        count: None,
                    },
                }
            }
        },
        Some("form") => {
            let row = parse_form_row(&response.body);
            (Some(vec![row]), Some(1))
        }
        _ => (None, None),
    };

    let success = (200..400).contains(&response.status);
    let result = StepResult {
        success,
        error: if success { None } else { Some(format!("http call returned status {}", response.status)) },
        duration: started.elapsed(),
        cache_hit: false,
        kind: StepResultKind::HttpCall {
            status_code: response.status,
            headers: response.headers,
            response_body: response.body,
            data: data.clone(),
            count,
        },
    };

    if success {
        if let (Some(key), Some(cache)) = (&resolved_key, &collab.step_cache) {
            let _ = cache
                .set(&common.workflow_name, key, data.unwrap_or_default(), Duration::from_secs(*cache_ttl_sec))
                .await;
        }
    }

    result
}

fn parse_json_rows(body: &str) -> Result<Vec<BTreeMap<String, Value>>, String> {
    let parsed: serde_json::Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    match parsed {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| match Value::from_json(&item) {
                Value::Map(m) => m,
                other => BTreeMap::from([("value".to_string(), other)]),
            })
            .collect()),
        serde_json::Value::Object(_) => match Value::from_json(&parsed) {
            Value::Map(m) => Ok(vec![m]),
            _ => unreachable!(),
        },
        other => Ok(vec![BTreeMap::from([("value".to_string(), Value::from_json(&other))])]),
    }
}

fn parse_form_row(body: &str) -> BTreeMap<String, Value> {
    let mut row = BTreeMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        row.insert(percent_decode(k), Value::String(percent_decode(v)));
    }
    row
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn collab_error_message(e: CollabError) -> String {
    e.to_string()
}

fn run_response_step(
    status: u16,
    template: &crate::template::Template,
    env: &Environment,
    started: std::time::Instant,
) -> StepResult {
    match render_template(template, env_root(env)) {
        Ok(body) => StepResult::response(status, body, started.elapsed()),
        Err(e) => StepResult::response_failure(e.to_string(), started.elapsed()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_block_step(
    iterate: Option<&crate::compile::CompiledIterate>,
    children: &[CompiledStep],
    scope: &mut Scope,
    common: &Common,
    collab: &Collaborators,
    trigger: &TriggerData,
    vars: &BTreeMap<String, Value>,
    started: std::time::Instant,
) -> StepResult {
    let parent_root = build_root(scope, common, trigger, vars);

    let (as_name, items, iterate_on_error) = match iterate {
        Some(it) => {
            let env = environment(parent_root.clone());
            let value = match eval(&it.over, &env) {
                Ok(v) => v,
                Err(e) => return StepResult::block(0, 0, 0, vec![], false, Some(e.to_string()), started.elapsed()),
            };
            let items = match value {
                Value::List(items) => items,
                Value::Null => vec![],
                other => vec![other],
            };
            (it.as_name.clone(), items, it.on_error)
        }
        None => ("item".to_string(), vec![Value::Null], OnError::Continue),
    };

    let total = items.len();
    let mut success_count = 0usize;
    let mut failure_count = 0usize;
    let mut skipped_count = 0usize;
    let mut records = Vec::with_capacity(total);
    let mut aborted: Option<String> = None;

    for (i, item) in items.into_iter().enumerate() {
        if common.deadline.should_stop() {
            aborted = Some("deadline exceeded".to_string());
            break;
        }

        let mut iteration_scope = Scope {
            steps: scope.steps.clone(),
            block: Some(BlockFrame {
                as_name: as_name.clone(),
                item: item.clone(),
                index: i,
                total,
                parent_root: parent_root.clone(),
            }),
        };

        let mut child_sink = CapturingSink::default();
        let outcome = Box::pin(execute_steps(
            children,
            &mut iteration_scope,
            trigger,
            vars,
            common,
            collab,
            &mut child_sink,
        ))
        .await;

        match outcome {
            StepOutcome::Continue | StepOutcome::ResponseSent { .. } => {
                success_count += 1;
                records.push(IterationRecord {
                    index: i,
                    item,
                    success: true,
                    error: None,
                });
            }
            StepOutcome::Abort(e) => {
                records.push(IterationRecord {
                    index: i,
                    item,
                    success: false,
                    error: Some(e.to_string()),
                });
                match iterate_on_error {
                    OnError::Abort => {
                        failure_count += 1;
                        aborted = Some(e.to_string());
                        break;
                    }
                    OnError::Skip => skipped_count += 1,
                    OnError::Continue => failure_count += 1,
                }
            }
        }
    }

    let overall_success = aborted.is_none() && failure_count == 0;
    StepResult::block(
        success_count,
        failure_count,
        skipped_count,
        records,
        overall_success,
        aborted,
        started.elapsed(),
    )
}

fn env_root(env: &Environment) -> &Value {
    env.root()
}

/// Resolves an HTTP trigger's own cache key, if any — used by the
/// server binary to gate a whole workflow execution behind the trigger
/// response cache before ever calling [`execute`].
pub fn http_trigger_cache_key(
    trigger: &CompiledHttpTrigger,
    trigger_data: &TriggerData,
    workflow_name: &str,
    request_id: &str,
) -> Option<Result<String, crate::template::TemplateRenderError>> {
    let template = trigger.cache_key.as_ref()?;
    let mut map = BTreeMap::new();
    map.insert("trigger".to_string(), trigger_view(trigger_data));
    map.insert(
        "workflow".to_string(),
        Value::Map(BTreeMap::from([
            ("name".to_string(), Value::String(workflow_name.to_string())),
            ("request_id".to_string(), Value::String(request_id.to_string())),
        ])),
    );
    let params = match trigger_data {
        TriggerData::Http { params, .. } => Value::Map(params.clone()),
        TriggerData::Cron { .. } => Value::map(),
    };
    map.insert("Param".to_string(), params);
    Some(render_template(template, &Value::Map(map)))
}

/// The next cron tick instant for a compiled cron trigger's schedule.
/// Out of the core's scope to parse; a full implementation lives in
/// `flowcore-server`'s cron ticker (§1 "out of core scope").
pub fn cron_schedule_text(trigger: &CompiledCronTrigger) -> &str {
    &trigger.schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryDb;
    use crate::compile::compile;
    use flowcore_workflow::config::{HttpTriggerConfig, StepConfig, TriggerConfig, WorkflowConfig};
    use flowcore_workflow::context::Logger as LoggerTrait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NullLogger;
    impl LoggerTrait for NullLogger {
        fn debug(&self, _msg: &str, _fields: &BTreeMap<String, String>) {}
        fn info(&self, _msg: &str, _fields: &BTreeMap<String, String>) {}
        fn warn(&self, _msg: &str, _fields: &BTreeMap<String, String>) {}
        fn error(&self, _msg: &str, _fields: &BTreeMap<String, String>) {}
    }

    struct FailingHttp {
        calls: AtomicU64,
    }
    #[async_trait::async_trait]
    impl HttpClient for FailingHttp {
        async fn do_request(&self, _ctx: &DeadlineCtx, _req: HttpRequest) -> Result<crate::collab::HttpResponse, CollabError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CollabError::Other("connection refused".to_string()))
        }
    }

    /// Succeeds for every request except one whose URL contains a chosen
    /// marker — used to exercise a block iteration with a mixed outcome.
    struct PartialFailHttp {
        fail_marker: String,
    }
    #[async_trait::async_trait]
    impl HttpClient for PartialFailHttp {
        async fn do_request(&self, _ctx: &DeadlineCtx, req: HttpRequest) -> Result<crate::collab::HttpResponse, CollabError> {
            if req.url.contains(&self.fail_marker) {
                return Err(CollabError::Other("upstream unavailable".to_string()));
            }
            Ok(crate::collab::HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: "{}".to_string(),
            })
        }
    }

    fn blank_step() -> StepConfig {
        serde_json::from_value(serde_json::json!({ "steps": [] })).unwrap()
    }

    fn http_trigger(path: &str) -> TriggerConfig {
        TriggerConfig::Http(HttpTriggerConfig {
            path: path.to_string(),
            method: "GET".to_string(),
            params: vec![],
            rate_limits: vec![],
            cache_key: None,
            cache_ttl_sec: 0,
        })
    }

    fn http_trigger_data() -> TriggerData {
        TriggerData::Http {
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            client_ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/api/test".to_string(),
        }
    }

    #[tokio::test]
    async fn happy_path_query_then_response() {
        let mut fetch = blank_step();
        fetch.name = Some("fetch".to_string());
        fetch.database = Some("primary".to_string());
        fetch.sql = Some("SELECT id FROM items".to_string());

        let mut respond = blank_step();
        respond.name = Some("respond".to_string());
        respond.template = Some(r#"{"data": {{json .steps.fetch.data}}}"#.to_string());

        let wf = WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![http_trigger("/api/test")],
            steps: vec![fetch, respond],
        };
        let compiled = compile(&wf).unwrap();

        let db = MemoryDb::new();
        let mut row1 = BTreeMap::new();
        row1.insert("id".to_string(), Value::Int(1));
        let mut row2 = BTreeMap::new();
        row2.insert("id".to_string(), Value::Int(2));
        db.seed("SELECT id FROM items", vec![row1, row2], 0).await;

        let collab = Collaborators {
            db: Arc::new(db),
            http: Arc::new(FailingHttp { calls: AtomicU64::new(0) }),
            step_cache: None,
        };

        let mut sink = CapturingSink::default();
        let result = execute(
            DeadlineCtx::no_timeout(),
            &compiled,
            http_trigger_data(),
            "req-1".to_string(),
            &mut sink,
            BTreeMap::new(),
            &collab,
            Arc::new(NullLogger),
        )
        .await;

        assert!(result.response_sent);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.body.as_deref(), Some(r#"{"data": [{"id":1},{"id":2}]}"#));
    }

    #[tokio::test]
    async fn negated_alias_branches_to_not_found() {
        let mut fetch = blank_step();
        fetch.name = Some("fetch".to_string());
        fetch.database = Some("primary".to_string());
        fetch.sql = Some("SELECT id FROM items".to_string());

        let mut success_response = blank_step();
        success_response.name = Some("success_response".to_string());
        success_response.condition = Some("found".to_string());
        success_response.template = Some(r#"{"ok":true}"#.to_string());

        let mut not_found_response = blank_step();
        not_found_response.name = Some("not_found_response".to_string());
        not_found_response.condition = Some("!found".to_string());
        not_found_response.status = Some(404);
        not_found_response.template = Some(r#"{"error":"not found"}"#.to_string());

        let mut wf = WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![http_trigger("/api/test")],
            steps: vec![fetch, success_response, not_found_response],
        };
        wf.aliases.insert("found".to_string(), "steps.fetch.count > 0".to_string());
        let compiled = compile(&wf).unwrap();

        let db = MemoryDb::new();
        db.seed("SELECT id FROM items", vec![], 0).await;
        let collab = Collaborators {
            db: Arc::new(db),
            http: Arc::new(FailingHttp { calls: AtomicU64::new(0) }),
            step_cache: None,
        };

        let mut sink = CapturingSink::default();
        let result = execute(
            DeadlineCtx::no_timeout(),
            &compiled,
            http_trigger_data(),
            "req-2".to_string(),
            &mut sink,
            BTreeMap::new(),
            &collab,
            Arc::new(NullLogger),
        )
        .await;

        assert!(result.response_sent);
        assert_eq!(result.status, Some(404));
        assert_eq!(result.body.as_deref(), Some(r#"{"error":"not found"}"#));
    }

    #[tokio::test]
    async fn cache_hit_skips_db_call() {
        use crate::collab::MemoryCache;

        let mut fetch_user = blank_step();
        fetch_user.name = Some("fetch_user".to_string());
        fetch_user.database = Some("primary".to_string());
        fetch_user.sql = Some("SELECT * FROM users WHERE id = @id".to_string());
        fetch_user.cache_key = Some("user:{{.trigger.params.id}}".to_string());

        let mut respond = blank_step();
        respond.name = Some("respond".to_string());
        respond.template = Some(r#"{{json .steps.fetch_user.data}}"#.to_string());

        let wf = WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![http_trigger("/api/test")],
            steps: vec![fetch_user, respond],
        };
        let compiled = compile(&wf).unwrap();

        let cache = MemoryCache::new();
        let mut cached_row = BTreeMap::new();
        cached_row.insert("id".to_string(), Value::Int(1));
        cached_row.insert("cached".to_string(), Value::Bool(true));
        cache.set("test", "user:42", vec![cached_row], Duration::from_secs(60)).await.unwrap();

        let db = MemoryDb::new();
        let collab = Collaborators {
            db: Arc::new(db),
            http: Arc::new(FailingHttp { calls: AtomicU64::new(0) }),
            step_cache: Some(Arc::new(cache)),
        };

        let mut params = BTreeMap::new();
        params.insert("id".to_string(), Value::String("42".to_string()));
        let trigger = TriggerData::Http {
            params,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            client_ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/api/test".to_string(),
        };

        let mut sink = CapturingSink::default();
        let result = execute(
            DeadlineCtx::no_timeout(),
            &compiled,
            trigger,
            "req-3".to_string(),
            &mut sink,
            BTreeMap::new(),
            &collab,
            Arc::new(NullLogger),
        )
        .await;

        assert!(result.step_results.get("fetch_user").unwrap().cache_hit);
        assert_eq!(
            result.body.as_deref(),
            Some(r#"[{"cached":true,"id":1}]"#)
        );
    }

    #[tokio::test]
    async fn block_iteration_continues_past_failure() {
        let mut fetch = blank_step();
        fetch.name = Some("fetch".to_string());
        fetch.database = Some("primary".to_string());
        fetch.sql = Some("SELECT id FROM items".to_string());

        let mut inner = blank_step();
        inner.name = Some("call".to_string());
        inner.url = Some("https://example.com/{{.item.id}}".to_string());

        let mut block = blank_step();
        block.name = Some("loop".to_string());
        block.step_type = Some(flowcore_workflow::config::StepKind::Block);
        block.iterate = Some(flowcore_workflow::config::IterateConfig {
            over: "steps.fetch.data".to_string(),
            as_name: "item".to_string(),
            on_error: OnError::Continue,
        });
        block.steps = vec![inner];

        let wf = WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![http_trigger("/api/test")],
            steps: vec![fetch, block],
        };
        let compiled = compile(&wf).unwrap();

        let db = MemoryDb::new();
        let mut rows = vec![];
        for id in [1, 2, 3] {
            let mut row = BTreeMap::new();
            row.insert("id".to_string(), Value::Int(id));
            rows.push(row);
        }
        db.seed("SELECT id FROM items", rows, 0).await;

        let collab = Collaborators {
            db: Arc::new(db),
            http: Arc::new(PartialFailHttp {
                fail_marker: "/2".to_string(),
            }),
            step_cache: None,
        };

        let mut sink = CapturingSink::default();
        let result = execute(
            DeadlineCtx::no_timeout(),
            &compiled,
            http_trigger_data(),
            "req-4".to_string(),
            &mut sink,
            BTreeMap::new(),
            &collab,
            Arc::new(NullLogger),
        )
        .await;

        let block_result = result.step_results.get("loop").unwrap();
        match &block_result.kind {
            StepResultKind::Block {
                success_count,
                failure_count,
                iterations,
                ..
            } => {
                assert_eq!(*success_count, 2);
                assert_eq!(*failure_count, 1);
                assert_eq!(iterations.len(), 3);
            }
            other => panic!("expected block result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_iteration_aborts_strictly_at_first_failure() {
        let mut fetch = blank_step();
        fetch.name = Some("fetch".to_string());
        fetch.database = Some("primary".to_string());
        fetch.sql = Some("SELECT id FROM items".to_string());

        let mut inner = blank_step();
        inner.name = Some("call".to_string());
        inner.url = Some("https://example.com/{{.item.id}}".to_string());

        let mut block = blank_step();
        block.name = Some("loop".to_string());
        block.step_type = Some(flowcore_workflow::config::StepKind::Block);
        block.iterate = Some(flowcore_workflow::config::IterateConfig {
            over: "steps.fetch.data".to_string(),
            as_name: "item".to_string(),
            on_error: OnError::Abort,
        });
        block.steps = vec![inner];

        let wf = WorkflowConfig {
            name: "test".to_string(),
            timeout_sec: 0,
            aliases: BTreeMap::new(),
            triggers: vec![http_trigger("/api/test")],
            steps: vec![fetch, block],
        };
        let compiled = compile(&wf).unwrap();

        let db = MemoryDb::new();
        let mut rows = vec![];
        for id in [1, 2, 3] {
            let mut row = BTreeMap::new();
            row.insert("id".to_string(), Value::Int(id));
            rows.push(row);
        }
        db.seed("SELECT id FROM items", rows, 0).await;

        let collab = Collaborators {
            db: Arc::new(db),
            http: Arc::new(PartialFailHttp {
                fail_marker: "/2".to_string(),
            }),
            step_cache: None,
        };

        let mut sink = CapturingSink::default();
        let result = execute(
            DeadlineCtx::no_timeout(),
            &compiled,
            http_trigger_data(),
            "req-5".to_string(),
            &mut sink,
            BTreeMap::new(),
            &collab,
            Arc::new(NullLogger),
        )
        .await;

        let block_result = result.step_results.get("loop").unwrap();
        match &block_result.kind {
            StepResultKind::Block {
                success_count,
                failure_count,
                skipped_count,
                iterations,
            } => {
                // Stops at item id=2 (the second item, index 1): one
                // success (index 0), one failure (index 1), nothing
                // attempted past it.
                assert_eq!(*success_count, 1);
                assert_eq!(*failure_count, 1);
                assert_eq!(iterations.len(), 2);
                assert_eq!(success_count + failure_count + skipped_count, iterations.len());
            }
            other => panic!("expected block result, got {other:?}"),
        }
    }
}
