//! Request/response model and the single-round-trip transport seam.
//!
//! A [`Transport`] performs exactly one network call and classifies the
//! outcome. Retrying and pagination are layered on top by
//! [`crate::client::ApiClient`].

mod classify;
mod http;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

pub use classify::{ErrorClass, classify_reqwest, classify_status, parse_retry_after};
pub use http::HttpTransport;
pub use reqwest::Method;

/// A query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Str(s) => write!(f, "{}", s),
            QueryValue::Int(i) => write!(f, "{}", i),
            QueryValue::Float(x) => write!(f, "{}", x),
            QueryValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Str(s.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        QueryValue::Str(s)
    }
}

impl From<i64> for QueryValue {
    fn from(i: i64) -> Self {
        QueryValue::Int(i)
    }
}

impl From<f64> for QueryValue {
    fn from(x: f64) -> Self {
        QueryValue::Float(x)
    }
}

impl From<bool> for QueryValue {
    fn from(b: bool) -> Self {
        QueryValue::Bool(b)
    }
}

/// An immutable request template.
///
/// The `with_*` builders consume the request and return a new one, so a value
/// that has been handed to a transport is never changed behind its back.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    path: String,
    query: BTreeMap<String, QueryValue>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Sets (or replaces) a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, QueryValue> {
        &self.query
    }

    pub fn query_value(&self, key: &str) -> Option<&QueryValue> {
        self.query.get(key)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        let mut sep = '?';
        for (k, v) in &self.query {
            write!(f, "{}{}={}", sep, k, v)?;
            sep = '&';
        }
        Ok(())
    }
}

/// The body of a response could not be decoded as JSON.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("response body is not valid JSON: {0}")]
pub struct DecodeError(pub String);

/// A response owned by the call that produced it.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    parsed: OnceLock<Result<Value, DecodeError>>,
}

impl Response {
    /// Header names are stored lower-cased.
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            status,
            headers,
            body,
            parsed: OnceLock::new(),
        }
    }

    /// Convenience constructor for a JSON response.
    pub fn from_json(status: u16, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self::new(status, headers, body.to_string().into_bytes())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decodes the body on first access; later calls return the cached value.
    pub fn json(&self) -> Result<&Value, DecodeError> {
        self.parsed
            .get_or_init(|| {
                serde_json::from_slice(&self.body).map_err(|e| DecodeError(e.to_string()))
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// A classified failure of a single round trip.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{classification}: {detail}")]
pub struct TransportError {
    pub classification: ErrorClass,
    /// HTTP status, when the server answered at all.
    pub status: Option<u16>,
    pub detail: String,
    /// Server-provided `Retry-After` hint.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(classification: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            classification,
            status: None,
            detail: detail.into(),
            retry_after: None,
        }
    }

    /// Builds an error from a non-success HTTP status.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let classification = reqwest::StatusCode::from_u16(status)
            .map(classify_status)
            .unwrap_or(ErrorClass::Unknown);
        Self {
            classification,
            status: Some(status),
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.classification.is_retryable()
    }
}

/// Performs exactly one network round trip. Implementations must not retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders_do_not_touch_the_original() {
        let template = Request::get("/items").with_query("limit", 10i64);
        let next = template.clone().with_query("cursor", "abc");

        assert_eq!(template.query().len(), 1);
        assert_eq!(next.query().len(), 2);
        assert_eq!(next.query_value("cursor"), Some(&QueryValue::from("abc")));
        assert_eq!(next.path(), template.path());
    }

    #[test]
    fn test_request_display() {
        let req = Request::get("/items")
            .with_query("limit", 10i64)
            .with_query("active", true);
        assert_eq!(req.to_string(), "GET /items?active=true&limit=10");
    }

    #[test]
    fn test_query_value_display() {
        assert_eq!(QueryValue::from("x").to_string(), "x");
        assert_eq!(QueryValue::from(-3i64).to_string(), "-3");
        assert_eq!(QueryValue::from(1.5).to_string(), "1.5");
        assert_eq!(QueryValue::from(false).to_string(), "false");
    }

    #[test]
    fn test_response_json_is_cached() {
        let resp = Response::from_json(200, &json!({"data": [1, 2]}));
        let first = resp.json().unwrap() as *const Value;
        let second = resp.json().unwrap() as *const Value;
        assert_eq!(first, second);
        assert_eq!(resp.json().unwrap()["data"][1], 2);
    }

    #[test]
    fn test_response_invalid_json() {
        let resp = Response::new(200, BTreeMap::new(), b"<html>".to_vec());
        assert!(resp.json().is_err());
        // Error is cached too
        assert!(resp.json().unwrap_err().to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_response_headers_are_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("Retry-After".to_string(), "3".to_string());
        let resp = Response::new(429, headers, Vec::new());
        assert_eq!(resp.header("retry-after"), Some("3"));
        assert_eq!(resp.header("RETRY-AFTER"), Some("3"));
    }

    #[test]
    fn test_transport_error_from_status() {
        assert_eq!(
            TransportError::from_status(429, "x").classification,
            ErrorClass::RateLimited
        );
        assert_eq!(
            TransportError::from_status(404, "x").classification,
            ErrorClass::ClientError
        );
        assert_eq!(
            TransportError::from_status(502, "x").classification,
            ErrorClass::ServerError
        );
        let err = TransportError::from_status(503, "busy");
        assert_eq!(err.status, Some(503));
        assert_eq!(err.to_string(), "server_error: busy");
    }
}
