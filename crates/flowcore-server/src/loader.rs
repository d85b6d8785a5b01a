//! Discovers and loads workflow files from disk (§1 "configuration file
//! discovery... out of scope" for the *core*, owned here instead).
//!
//! Each `*.yaml`/`*.yml` file under the configured workflow directory is
//! parsed into a `WorkflowConfig`, validated, and — if valid — compiled.
//! A workflow that fails validation or compilation is logged and
//! skipped rather than aborting the whole load, so one broken file
//! doesn't take the rest of the fleet down.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use flowcore_core::compile::{compile, CompiledWorkflow};
use flowcore_core::validate::{validate, ValidationContext};
use flowcore_workflow::config::WorkflowConfig;
use serde::Deserialize;
use tracing::{error, warn};

/// A loaded, compiled workflow alongside the raw config it came from
/// (kept around for re-validation messages and for the router to read
/// trigger-level rate-limit refs without re-walking the compiled form).
pub struct LoadedWorkflow {
    pub config: WorkflowConfig,
    pub compiled: CompiledWorkflow,
}

#[derive(Debug, Deserialize, Default)]
struct DatabasesFile {
    #[serde(default)]
    databases: BTreeMap<String, DatabaseEntry>,
}

#[derive(Debug, Deserialize)]
struct DatabaseEntry {
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RateLimitPoolsFile {
    #[serde(default)]
    pools: BTreeMap<String, PoolEntry>,
}

#[derive(Debug, Deserialize)]
struct PoolEntry {
    #[serde(default)]
    requests_per_second: f64,
    #[serde(default)]
    burst: u32,
}

/// Named rate-limit pools resolved at load time so the router can turn
/// a trigger's `RateLimitRef { pool: Some(name), .. }` into a concrete
/// policy without re-reading the pools file per request.
pub type RateLimitPools = BTreeMap<String, flowcore_core::collab::RateLimitPolicy>;

const RESERVED_FILE_NAMES: &[&str] = &["databases.yaml", "databases.yml", "rate_limit_pools.yaml", "rate_limit_pools.yml"];

pub struct LoadResult {
    pub workflows: Vec<LoadedWorkflow>,
    pub rate_limit_pools: RateLimitPools,
}

/// Loads every workflow under `dir`, plus the optional `databases.yaml`
/// and `rate_limit_pools.yaml` sidecar files used to build the
/// validator's `ValidationContext`.
pub fn load_dir(dir: &str) -> std::io::Result<LoadResult> {
    let path = Path::new(dir);
    if !path.exists() {
        warn!(dir = %dir, "workflow directory does not exist; starting with zero workflows");
        return Ok(LoadResult {
            workflows: vec![],
            rate_limit_pools: BTreeMap::new(),
        });
    }

    let databases = read_sidecar::<DatabasesFile>(path, "databases")
        .unwrap_or_default()
        .databases
        .into_iter()
        .map(|(name, entry)| (name, entry.read_only))
        .collect::<BTreeMap<_, _>>();

    let pools_file = read_sidecar::<RateLimitPoolsFile>(path, "rate_limit_pools").unwrap_or_default();
    let rate_limit_pools: RateLimitPools = pools_file
        .pools
        .into_iter()
        .map(|(name, entry)| {
            (
                name.clone(),
                flowcore_core::collab::RateLimitPolicy {
                    key: name,
                    requests_per_second: entry.requests_per_second,
                    burst: entry.burst,
                },
            )
        })
        .collect();

    let pool_names: BTreeSet<String> = rate_limit_pools.keys().cloned().collect();
    let ctx = ValidationContext {
        databases,
        rate_limit_pools: pool_names,
    };

    let mut workflows = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_path = entry.path();
        let Some(name) = file_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if RESERVED_FILE_NAMES.contains(&name) {
            continue;
        }
        let is_yaml = file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        match load_one(&file_path, &ctx) {
            Ok(Some(loaded)) => workflows.push(loaded),
            Ok(None) => {}
            Err(e) => error!(file = %file_path.display(), error = %e, "failed to read workflow file"),
        }
    }

    Ok(LoadResult {
        workflows,
        rate_limit_pools,
    })
}

fn read_sidecar<T: serde::de::DeserializeOwned + Default>(dir: &Path, stem: &str) -> Option<T> {
    for ext in ["yaml", "yml"] {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if candidate.exists() {
            match std::fs::read_to_string(&candidate).ok().and_then(|s| serde_yaml::from_str(&s).ok()) {
                Some(parsed) => return Some(parsed),
                None => warn!(file = %candidate.display(), "failed to parse sidecar config, ignoring"),
            }
        }
    }
    None
}

fn load_one(path: &Path, ctx: &ValidationContext) -> std::io::Result<Option<LoadedWorkflow>> {
    let text = std::fs::read_to_string(path)?;
    let config: WorkflowConfig = match serde_yaml::from_str(&text) {
        Ok(c) => c,
        Err(e) => {
            error!(file = %path.display(), error = %e, "failed to parse workflow yaml");
            return Ok(None);
        }
    };

    let result = validate(&config, ctx);
    for warning in &result.warnings {
        warn!(file = %path.display(), locator = %warning.locator, message = %warning.message, "workflow validation warning");
    }
    if !result.valid() {
        for issue in &result.errors {
            error!(file = %path.display(), locator = %issue.locator, message = %issue.message, "workflow validation error");
        }
        return Ok(None);
    }

    match compile(&config) {
        Ok(compiled) => Ok(Some(LoadedWorkflow { config, compiled })),
        Err(e) => {
            error!(file = %path.display(), error = %e, "failed to compile workflow");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("flowcore-loader-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_directory_yields_no_workflows() {
        let result = load_dir("/nonexistent/flowcore-workflows-dir").unwrap();
        assert!(result.workflows.is_empty());
        assert!(result.rate_limit_pools.is_empty());
    }

    #[test]
    fn loads_a_minimal_valid_workflow() {
        let dir = scratch_dir("minimal");
        std::fs::write(
            dir.join("hello.yaml"),
            r#"
name: hello
triggers:
  - type: http
    path: /hello
    method: GET
steps:
  - type: response
    status: 200
    template: '{"ok": true}'
"#,
        )
        .unwrap();

        let result = load_dir(dir.to_str().unwrap()).unwrap();
        assert_eq!(result.workflows.len(), 1);
        assert_eq!(result.workflows[0].config.name, "hello");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn skips_a_workflow_that_fails_validation() {
        let dir = scratch_dir("invalid");
        std::fs::write(
            dir.join("broken.yaml"),
            r#"
name: broken
triggers:
  - type: http
    path: /broken
    method: GET
steps:
  - type: query
    database: primary
    sql: "SELECT {{ vars.x }}"
"#,
        )
        .unwrap();

        let result = load_dir(dir.to_str().unwrap()).unwrap();
        assert!(result.workflows.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rate_limit_pools_sidecar_is_parsed() {
        let dir = scratch_dir("pools");
        std::fs::write(
            dir.join("rate_limit_pools.yaml"),
            r#"
pools:
  default:
    requests_per_second: 5.0
    burst: 10
"#,
        )
        .unwrap();

        let result = load_dir(dir.to_str().unwrap()).unwrap();
        let pool = result.rate_limit_pools.get("default").unwrap();
        assert_eq!(pool.burst, 10);

        std::fs::remove_dir_all(&dir).ok();
    }
}
