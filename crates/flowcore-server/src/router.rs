//! Builds the `axum` router: one route per compiled HTTP trigger plus
//! `/healthz`, grounded on the teacher's `main.rs` route table
//! (`Router::new().route(path, method(handler)) ... .with_state(state)`)
//! generalized from a fixed handler list to one handler closure per
//! loaded workflow trigger.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path as AxPath, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put, MethodRouter};
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use flowcore_core::collab::RateLimitContext;
use flowcore_core::compile::CompiledTrigger;
use flowcore_core::exec::{self, CapturingSink, ExecutionError};
use flowcore_workflow::config::{ParamConfig, ParamType};
use flowcore_workflow::context::{DeadlineCtx, TriggerData};
use flowcore_workflow::value::Value;

use crate::error::ServerError;
use crate::loader::LoadedWorkflow;
use crate::logger::TracingLogger;
use crate::request::{client_ip, header_map, new_request_id, parse_cookies};
use crate::state::AppState;

pub fn build_router(workflows: Vec<Arc<LoadedWorkflow>>) -> Router<AppState> {
    let mut router: Router<AppState> = Router::new().route("/healthz", get(health));

    for workflow in workflows {
        for (trigger_index, trigger) in workflow.compiled.triggers.iter().enumerate() {
            let CompiledTrigger::Http(http_trigger) = trigger else {
                continue;
            };
            let axum_path = to_axum_path(&http_trigger.path);
            let workflow = workflow.clone();

            let method_router = match on_method(&http_trigger.method, workflow.clone(), trigger_index) {
                Some(mr) => mr,
                None => {
                    warn!(
                        workflow = %workflow.config.name,
                        method = %http_trigger.method,
                        "unsupported HTTP method on trigger, route not mounted"
                    );
                    continue;
                }
            };

            router = router.route(&axum_path, method_router);
        }
    }

    router
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Rewrites `{name}` placeholders (the spec's path syntax) into axum
/// 0.7's `:name` form.
fn to_axum_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            out.push(':');
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                out.push(c);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn on_method(method: &str, workflow: Arc<LoadedWorkflow>, trigger_index: usize) -> Option<MethodRouter<AppState>> {
    let handler = move |state: State<AppState>,
                         path: AxPath<BTreeMap<String, String>>,
                         query: RawQuery,
                         headers: HeaderMap,
                         connect_info: ConnectInfo<SocketAddr>,
                         body: Bytes| {
        let workflow = workflow.clone();
        async move { handle_trigger(state, workflow, trigger_index, path, query, headers, connect_info, body).await }
    };

    match method.to_uppercase().as_str() {
        "GET" => Some(get(handler)),
        "POST" => Some(post(handler)),
        "PUT" => Some(put(handler)),
        "DELETE" => Some(delete(handler)),
        "PATCH" => Some(patch(handler)),
        _ => None,
    }
}

async fn handle_trigger(
    State(state): State<AppState>,
    workflow: Arc<LoadedWorkflow>,
    trigger_index: usize,
    AxPath(path_params): AxPath<BTreeMap<String, String>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    match run_trigger(state, workflow, trigger_index, path_params, raw_query, headers, peer, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn run_trigger(
    state: AppState,
    workflow: Arc<LoadedWorkflow>,
    trigger_index: usize,
    path_params: BTreeMap<String, String>,
    raw_query: Option<String>,
    headers: HeaderMap,
    peer: SocketAddr,
    body: Bytes,
) -> Result<Response, ServerError> {
    let CompiledTrigger::Http(trigger) = &workflow.compiled.triggers[trigger_index] else {
        return Err(ServerError::WorkflowNotFound(workflow.config.name.clone()));
    };

    let query_params = parse_query(raw_query.as_deref());
    let body_params = parse_body(&headers, &body);

    let params = resolve_params(&trigger.params, &path_params, &query_params, &body_params)?;

    let client_ip_value = client_ip(&headers, peer, state.config.trust_proxy_headers);
    let header_map_value = header_map(&headers);
    let cookies = parse_cookies(&headers);
    let request_id = new_request_id();

    let rate_ctx = RateLimitContext {
        ip: client_ip_value.clone(),
        params: params.clone(),
        headers: header_map_value.clone(),
        query: query_params.clone(),
        cookies: cookies.clone(),
    };
    let rate_key = format!("{}:{}:{}", workflow.config.name, trigger.path, client_ip_value);
    let decision = state
        .rate_limits
        .check(&trigger.rate_limits, &rate_key, &rate_ctx)
        .await
        .map_err(|e| ServerError::ExecutionFailed(e.to_string()))?;
    if !decision.allowed {
        return Err(ServerError::RateLimited {
            retry_after_sec: decision.retry_after_sec,
        });
    }

    let trigger_data = TriggerData::Http {
        params: params.clone(),
        headers: header_map_value,
        cookies,
        client_ip: client_ip_value,
        method: trigger.method.clone(),
        path: trigger.path.clone(),
    };

    let cache_key = exec::http_trigger_cache_key(trigger, &trigger_data, &workflow.config.name, &request_id);
    if let Some(Ok(key)) = &cache_key {
        if let Some(cache) = &state.trigger_cache {
            match cache.get(&workflow.config.name, key).await {
                Ok(Some((body, status))) => {
                    return Ok(response_from(status, body));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "trigger cache lookup failed, executing uncached"),
            }
        }
    } else if let Some(Err(e)) = &cache_key {
        warn!(error = %e, "trigger cache key render failed, executing uncached");
    }

    let timeout_sec = if workflow.compiled.timeout_sec > 0 {
        workflow.compiled.timeout_sec
    } else {
        state.config.default_timeout_sec
    };
    let deadline = DeadlineCtx::new(Some(Duration::from_secs(timeout_sec)));
    let logger = Arc::new(TracingLogger::new(request_id.clone(), workflow.config.name.clone()));

    let mut sink = CapturingSink::default();
    let result = exec::execute(
        deadline,
        &workflow.compiled,
        trigger_data,
        request_id,
        &mut sink,
        params,
        &state.collab,
        logger,
    )
    .await;

    let response = match (result.response_sent, result.status, result.body, result.error) {
        (true, Some(status), Some(body), _) => {
            if let (Some(Ok(key)), Some(cache)) = (&cache_key, &state.trigger_cache) {
                if let Err(e) = cache
                    .set(&workflow.config.name, key, body.clone(), status, Duration::from_secs(trigger.cache_ttl_sec.max(1)))
                    .await
                {
                    warn!(error = %e, "failed to populate trigger cache");
                }
            }
            response_from(status, body)
        }
        (_, _, _, Some(ExecutionError::Canceled)) => ServerError::ExecutionFailed("canceled".to_string()).into_response(),
        (_, _, _, Some(ExecutionError::DeadlineExceeded)) => {
            ServerError::ExecutionFailed("deadline exceeded".to_string()).into_response()
        }
        (_, _, _, Some(ExecutionError::StepFailed { name, error })) => {
            ServerError::ExecutionFailed(format!("step '{name}' failed: {error}")).into_response()
        }
        _ => StatusCode::NO_CONTENT.into_response(),
    };

    Ok(response)
}

fn response_from(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, body).into_response()
}

fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let Some(raw) = raw else {
        return map;
    };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let (Some(name), value) = (parts.next(), parts.next().unwrap_or("")) else {
            continue;
        };
        map.insert(percent_decode(name), percent_decode(value));
    }
    map
}

fn parse_body(headers: &HeaderMap, body: &Bytes) -> BTreeMap<String, serde_json::Value> {
    if body.is_empty() {
        return BTreeMap::new();
    }
    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");
    if content_type.contains("application/json") {
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    } else {
        let text = String::from_utf8_lossy(body);
        text.split('&')
            .filter(|p| !p.is_empty())
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let name = parts.next()?;
                let value = parts.next().unwrap_or("");
                Some((percent_decode(name), serde_json::Value::String(percent_decode(value))))
            })
            .collect()
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(value) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    out.push(value);
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

fn resolve_params(
    declared: &[ParamConfig],
    path_params: &BTreeMap<String, String>,
    query_params: &BTreeMap<String, String>,
    body_params: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, Value>, ServerError> {
    let mut resolved = BTreeMap::new();
    for param in declared {
        let value = if let Some(raw) = path_params.get(&param.name) {
            Some(coerce_str(raw, param.param_type).map_err(|message| ServerError::InvalidParam {
                name: param.name.clone(),
                message,
            })?)
        } else if let Some(raw) = query_params.get(&param.name) {
            Some(coerce_str(raw, param.param_type).map_err(|message| ServerError::InvalidParam {
                name: param.name.clone(),
                message,
            })?)
        } else if let Some(raw) = body_params.get(&param.name) {
            Some(coerce_json(raw, param.param_type))
        } else {
            None
        };

        let value = match value {
            Some(v) => v,
            None => match &param.default {
                Some(default) => Value::from_json(default),
                None if param.required => return Err(ServerError::MissingParam(param.name.clone())),
                None => Value::Null,
            },
        };

        resolved.insert(param.name.clone(), value);
    }
    Ok(resolved)
}

fn coerce_str(raw: &str, param_type: ParamType) -> Result<Value, String> {
    match param_type {
        ParamType::String => Ok(Value::String(raw.to_string())),
        ParamType::Int => raw.parse::<i64>().map(Value::Int).map_err(|_| format!("'{raw}' is not an integer")),
        ParamType::Float => raw.parse::<f64>().map(Value::Float).map_err(|_| format!("'{raw}' is not a number")),
        ParamType::Bool => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{raw}' is not a boolean")),
        },
        ParamType::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(|v| Value::from_json(&v))
            .map_err(|e| format!("invalid json: {e}")),
        ParamType::IntArray => raw
            .split(',')
            .map(|s| s.trim().parse::<i64>().map(Value::Int))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
            .map_err(|_| format!("'{raw}' is not a comma-separated list of integers")),
        ParamType::StringArray => Ok(Value::List(
            raw.split(',').map(|s| Value::String(s.trim().to_string())).collect(),
        )),
    }
}

fn coerce_json(raw: &serde_json::Value, param_type: ParamType) -> Value {
    match param_type {
        ParamType::String => match raw {
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        _ => Value::from_json(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axum_path_rewrites_braces_to_colon_segments() {
        assert_eq!(to_axum_path("/api/users/{id}"), "/api/users/:id");
        assert_eq!(to_axum_path("/api/{a}/{b}"), "/api/:a/:b");
        assert_eq!(to_axum_path("/healthz"), "/healthz");
    }

    #[test]
    fn percent_decode_handles_plus_and_escapes() {
        assert_eq!(percent_decode("a+b%20c"), "a b c");
        assert_eq!(percent_decode("no-escapes"), "no-escapes");
    }

    #[test]
    fn resolve_params_applies_default_and_rejects_missing_required() {
        let declared = vec![
            ParamConfig {
                name: "id".to_string(),
                param_type: ParamType::Int,
                required: true,
                default: None,
            },
            ParamConfig {
                name: "limit".to_string(),
                param_type: ParamType::Int,
                required: false,
                default: Some(serde_json::json!(10)),
            },
        ];

        let mut path_params = BTreeMap::new();
        path_params.insert("id".to_string(), "42".to_string());
        let result = resolve_params(&declared, &path_params, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(result.get("id"), Some(&Value::Int(42)));
        assert_eq!(result.get("limit"), Some(&Value::Int(10)));

        let missing = resolve_params(&declared, &BTreeMap::new(), &BTreeMap::new(), &BTreeMap::new());
        assert!(missing.is_err());
    }

    #[test]
    fn coerce_str_rejects_non_numeric_int() {
        assert!(coerce_str("not-a-number", ParamType::Int).is_err());
        assert_eq!(coerce_str("7", ParamType::Int).unwrap(), Value::Int(7));
    }
}
