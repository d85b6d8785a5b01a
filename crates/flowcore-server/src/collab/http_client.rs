//! `reqwest`-backed `HttpClient`, grounded on the teacher's
//! `clients.rs` request shape (`state.http_client.<method>(url)
//! .header(..).body(..).send().await`), generalized from a handful of
//! fixed endpoints to an arbitrary method/url/headers/body per call.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use flowcore_core::collab::{CollabError, HttpClient, HttpRequest, HttpResponse};
use flowcore_workflow::context::DeadlineCtx;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder should not fail with default settings");
        ReqwestHttpClient { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn do_request(&self, ctx: &DeadlineCtx, req: HttpRequest) -> Result<HttpResponse, CollabError> {
        let method = Method::from_str(&req.method.to_uppercase())
            .map_err(|e| CollabError::Other(format!("invalid HTTP method '{}': {e}", req.method)))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in &req.headers {
            let header_name = HeaderName::from_str(name)
                .map_err(|e| CollabError::Other(format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| CollabError::Other(format!("invalid header value for '{name}': {e}")))?;
            header_map.insert(header_name, header_value);
        }

        let mut builder = self.client.request(method, &req.url).headers(header_map);
        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }
        if let Some(remaining) = ctx.remaining() {
            builder = builder.timeout(remaining);
        }

        let send = builder.send();
        let response = match ctx.race(send).await {
            Some(result) => result.map_err(|e| CollabError::Other(format!("request failed: {e}")))?,
            None => return Err(CollabError::Canceled),
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect();
        let body_fut = response.text();
        let body = match ctx.race(body_fut).await {
            Some(result) => result.map_err(|e| CollabError::Other(format!("failed to read response body: {e}")))?,
            None => return Err(CollabError::Canceled),
        };

        Ok(HttpResponse { status, headers, body })
    }
}
