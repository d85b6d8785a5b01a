//! `sqlx::Any`-backed `Db`, grounded on the teacher's pool-per-AppState
//! wiring (`config.rs`'s single shared client handle) generalized to a
//! pool-per-database-name map, since a workflow's `database` field names
//! one of potentially several configured backends.
//!
//! Named `@param` placeholders (rather than positional `$1`/`?`) are
//! rewritten to the driver's positional form before binding, since
//! `sqlx::Any` has no named-parameter support of its own. `@name` is the
//! syntax the validator's SQL-template-interpolation refusal message
//! directs authors to use in place of `{{ }}` template interpolation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use flowcore_core::collab::{CollabError, Db, QueryOpts};
use flowcore_workflow::context::DeadlineCtx;
use flowcore_workflow::value::Value;
use regex::Regex;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Column, Row};

pub struct SqlxDb {
    pools: BTreeMap<String, sqlx::AnyPool>,
}

impl SqlxDb {
    /// Connects a pool for each `(name, url)` pair given. A workflow's
    /// `query` step names a database by key; an unknown name surfaces as
    /// a `CollabError::Other` at execution time rather than at startup,
    /// matching the rest of the executor's "fail the step, not the
    /// process" posture.
    pub async fn connect(databases: &BTreeMap<String, String>) -> Result<Self, anyhow::Error> {
        sqlx::any::install_default_drivers();
        let mut pools = BTreeMap::new();
        for (name, url) in databases {
            let pool = AnyPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect database '{name}': {e}"))?;
            pools.insert(name.clone(), pool);
        }
        Ok(SqlxDb { pools })
    }
}

/// Rewrites `@name` placeholders into `$1`/`$2`/... in first-occurrence
/// order and returns the parameter names in bind order.
fn rewrite_named_params(sql: &str) -> (String, Vec<String>) {
    let re = Regex::new(r"@([a-zA-Z_][a-zA-Z0-9_.]*)").expect("static regex is valid");
    let mut names = Vec::new();
    let rewritten = re.replace_all(sql, |caps: &regex::Captures| {
        let name = caps[1].to_string();
        let position = match names.iter().position(|n| n == &name) {
            Some(i) => i,
            None => {
                names.push(name.clone());
                names.len() - 1
            }
        };
        format!("${}", position + 1)
    });
    (rewritten.into_owned(), names)
}

fn bind_value<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.clone()),
        Value::List(_) | Value::Map(_) => query.bind(value.render()),
        Value::Function(_) => query.bind(None::<String>),
    }
}

/// Decodes a column without knowing its static type ahead of time: try
/// the narrowest types first so an integer column doesn't get widened
/// to a float, falling back to a string and finally to null.
fn decode_column(row: &AnyRow, index: usize, as_json: bool) -> Value {
    if as_json {
        if let Ok(Some(text)) = row.try_get::<Option<String>, _>(index) {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                return Value::from_json(&parsed);
            }
            return Value::String(text);
        }
        return Value::Null;
    }

    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        if let Some(b) = v {
            return Value::Bool(b);
        }
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        if let Some(i) = v {
            return Value::Int(i);
        }
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        if let Some(f) = v {
            return Value::Float(f);
        }
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        if let Some(s) = v {
            return Value::String(s);
        }
    }
    Value::Null
}

fn row_to_map(row: &AnyRow, json_columns: &[String]) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let as_json = json_columns.iter().any(|c| c == &name);
        map.insert(name, decode_column(row, index, as_json));
    }
    map
}

#[async_trait]
impl Db for SqlxDb {
    async fn execute_query(
        &self,
        ctx: &DeadlineCtx,
        database: &str,
        sql: &str,
        params: &BTreeMap<String, Value>,
        opts: &QueryOpts,
    ) -> Result<(Vec<BTreeMap<String, Value>>, u64), CollabError> {
        let pool = self
            .pools
            .get(database)
            .ok_or_else(|| CollabError::Other(format!("unknown database '{database}'")))?;

        let (rewritten, order) = rewrite_named_params(sql);
        let mut query = sqlx::query(&rewritten);
        for name in &order {
            let value = params.get(name).cloned().unwrap_or(Value::Null);
            query = bind_value(query, &value);
        }

        let fetch = query.fetch_all(pool);
        let rows = match ctx.race(fetch).await {
            Some(result) => result.map_err(|e| CollabError::Other(format!("query failed: {e}")))?,
            None => return Err(CollabError::Canceled),
        };

        let rows_affected = rows.len() as u64;
        let mapped = rows.iter().map(|r| row_to_map(r, &opts.json_columns)).collect();
        Ok((mapped, rows_affected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_named_params_reuses_positions_for_repeated_names() {
        let (sql, order) = rewrite_named_params("SELECT * FROM t WHERE a = @id OR b = @id AND c = @other");
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1 OR b = $1 AND c = $2");
        assert_eq!(order, vec!["id".to_string(), "other".to_string()]);
    }

    #[test]
    fn rewrite_named_params_accepts_dotted_computed_param_names() {
        let (sql, order) = rewrite_named_params("SELECT * FROM t WHERE ratio > @params.ratio");
        assert_eq!(sql, "SELECT * FROM t WHERE ratio > $1");
        assert_eq!(order, vec!["params.ratio".to_string()]);
    }
}
