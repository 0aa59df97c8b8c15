//! reqwest-backed transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{
    Client,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use std::collections::BTreeMap;
use std::time::Duration;

use super::classify::{classify_reqwest, parse_retry_after};
use super::{ErrorClass, Request, Response, Transport, TransportError};
use crate::config::ClientConfig;

/// Longest slice of an error body kept in the error detail.
const ERROR_BODY_LIMIT: usize = 512;

/// HTTP transport over a shared reqwest connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    default_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Creates a transport wrapping the given reqwest Client.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            default_timeout: None,
        }
    }

    /// Builds a transport from configuration, attaching `token` as a bearer token.
    pub fn from_config(config: &ClientConfig, token: Option<&str>) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("No base URL configured. Pass --base-url or set it in the config file.")?;

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("API token contains invalid header characters")?;
            auth_value.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth_value);
            debug!("Using API token for authentication: {}", mask_token(token));
        }

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::new(client, base_url).with_default_timeout(config.request_timeout()))
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a request path against the base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(skip(self, request), fields(request = %request))]
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let url = self.url_for(request.path());
        debug!("{} {}...", request.method(), url);

        let query: Vec<(&str, String)> = request
            .query()
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_string()))
            .collect();

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .query(&query);

        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout().or(self.default_timeout) {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(from_reqwest)?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let body = response.bytes().await.map_err(from_reqwest)?.to_vec();

        if !status.is_success() {
            let retry_after = headers.get("retry-after").and_then(|v| parse_retry_after(v));
            let snippet = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_LIMIT)]);
            let detail = if snippet.trim().is_empty() {
                format!("HTTP {} from {}", status.as_u16(), url)
            } else {
                format!("HTTP {} from {}: {}", status.as_u16(), url, snippet.trim())
            };
            return Err(TransportError::from_status(status.as_u16(), detail)
                .with_retry_after(retry_after));
        }

        Ok(Response::new(status.as_u16(), headers, body))
    }
}

fn from_reqwest(error: reqwest::Error) -> TransportError {
    let classification = classify_reqwest(&error);
    let mut err = TransportError::new(classification, error.to_string());
    err.status = error.status().map(|s| s.as_u16());
    if classification == ErrorClass::Unknown {
        debug!("Unclassified transport error: {:?}", error);
    }
    err
}

/// Shows only the ends of a secret, for logs.
fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}*********{}", head, tail)
}
