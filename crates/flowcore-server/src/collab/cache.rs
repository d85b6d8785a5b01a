//! `StepCache`/`TriggerCache` backed by an Upstash-style REST Redis
//! endpoint, grounded directly on the teacher's `redis.rs`
//! `RedisClient::execute` (`POST {rest_url}` with a `Bearer {token}`
//! header and a JSON command array, parsing `{"result": ...}` back out).
//! Rows and response bodies are stored JSON-encoded under `SETEX` so the
//! TTL lives in Redis itself rather than needing a background sweep.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use flowcore_core::collab::{CollabError, StepCache, TriggerCache};
use flowcore_workflow::value::Value;
use serde::Deserialize;

pub struct UpstashCache {
    client: reqwest::Client,
    rest_url: String,
    rest_token: String,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    result: serde_json::Value,
}

impl UpstashCache {
    pub fn new(client: reqwest::Client, rest_url: String, rest_token: String) -> Self {
        UpstashCache {
            client,
            rest_url,
            rest_token,
        }
    }

    async fn execute(&self, command: &[&str]) -> Result<serde_json::Value, CollabError> {
        let response = self
            .client
            .post(&self.rest_url)
            .header("Authorization", format!("Bearer {}", self.rest_token))
            .json(command)
            .send()
            .await
            .map_err(|e| CollabError::Other(format!("cache request failed: {e}")))?;

        let parsed: CommandResponse = response
            .json()
            .await
            .map_err(|e| CollabError::Other(format!("failed to parse cache response: {e}")))?;
        Ok(parsed.result)
    }

    fn step_key(workflow: &str, key: &str) -> String {
        format!("flowcore:step:{workflow}:{key}")
    }

    fn trigger_key(workflow: &str, key: &str) -> String {
        format!("flowcore:trigger:{workflow}:{key}")
    }
}

#[derive(Debug, serde::Serialize, Deserialize)]
struct StoredRows {
    rows: Vec<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, serde::Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    body: String,
}

#[async_trait]
impl StepCache for UpstashCache {
    async fn get(&self, workflow: &str, key: &str) -> Result<Option<Vec<BTreeMap<String, Value>>>, CollabError> {
        let raw = self.execute(&["GET", &Self::step_key(workflow, key)]).await?;
        let text = match raw {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => return Ok(None),
            _ => return Ok(None),
        };
        let stored: StoredRows = serde_json::from_str(&text)
            .map_err(|e| CollabError::Other(format!("corrupt step cache entry: {e}")))?;
        let rows = stored
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k, Value::from_json(&v))).collect())
            .collect();
        Ok(Some(rows))
    }

    async fn set(&self, workflow: &str, key: &str, rows: Vec<BTreeMap<String, Value>>, ttl: Duration) -> Result<bool, CollabError> {
        let stored = StoredRows {
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|(k, v)| (k, v.to_json())).collect())
                .collect(),
        };
        let text = serde_json::to_string(&stored)
            .map_err(|e| CollabError::Other(format!("failed to encode step cache entry: {e}")))?;
        let ttl_sec = ttl.as_secs().max(1).to_string();
        self.execute(&["SETEX", &Self::step_key(workflow, key), &ttl_sec, &text])
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl TriggerCache for UpstashCache {
    async fn get(&self, workflow: &str, key: &str) -> Result<Option<(String, u16)>, CollabError> {
        let raw = self.execute(&["GET", &Self::trigger_key(workflow, key)]).await?;
        let text = match raw {
            serde_json::Value::String(s) => s,
            _ => return Ok(None),
        };
        let stored: StoredResponse = serde_json::from_str(&text)
            .map_err(|e| CollabError::Other(format!("corrupt trigger cache entry: {e}")))?;
        Ok(Some((stored.body, stored.status)))
    }

    async fn set(&self, workflow: &str, key: &str, body: String, status: u16, ttl: Duration) -> Result<bool, CollabError> {
        let stored = StoredResponse { status, body };
        let text = serde_json::to_string(&stored)
            .map_err(|e| CollabError::Other(format!("failed to encode trigger cache entry: {e}")))?;
        let ttl_sec = ttl.as_secs().max(1).to_string();
        self.execute(&["SETEX", &Self::trigger_key(workflow, key), &ttl_sec, &text])
            .await?;
        Ok(true)
    }
}
