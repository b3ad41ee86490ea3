//! REST backend over reqwest.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tracing::debug;

use crate::cache::{Backend, BackendError, BackendRequest, Method};
use crate::config::ApiSettings;

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
            token: settings.token.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("portal-sync/", env!("CARGO_PKG_VERSION"))
    }

    /// Resolves an endpoint path beneath the base URL, so `/leaves` on
    /// `http://host/api/` becomes `http://host/api/leaves`.
    pub fn url(&self, request: &BackendRequest) -> Result<Url, BackendError> {
        let mut url = self
            .base
            .join(request.path.trim_start_matches('/'))
            .map_err(|err| {
                BackendError::transport(format!("invalid request path `{}`: {err}", request.path))
            })?;
        if !request.query.is_empty() {
            url.set_query(None);
            let mut qp = url.query_pairs_mut();
            for (name, value) in &request.query {
                qp.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn execute(&self, request: BackendRequest) -> Result<Value, BackendError> {
        let url = self.url(&request)?;
        let mut req = self.client.request(reqwest_method(request.method), url);
        if let Some(token) = self.token.as_ref() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = request.body.as_ref() {
            req = req.json(body);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|err| BackendError::transport(err.to_string()))?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = resp.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend request completed"
        );
        handle(resp).await
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Maps a response to the backend contract: 2xx bodies are JSON (empty means
/// `null`); anything else is an error carrying the payload untouched.
async fn handle(resp: Response) -> Result<Value, BackendError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| BackendError::transport(err.to_string()))?;

    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes).trim().to_string();
        let body = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .or_else(|| (!text.is_empty()).then(|| Value::String(text.clone())));
        let message = body
            .as_ref()
            .and_then(|value| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| (!text.is_empty()).then_some(text))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        return Err(BackendError::http(status.as_u16(), message, body));
    }

    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| {
        BackendError::http(
            status.as_u16(),
            format!("failed to parse body: {err}"),
            None,
        )
    })
}
