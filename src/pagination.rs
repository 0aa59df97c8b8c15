//! Cursor extraction and next-page request construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::config::ClientConfig;
use crate::transport::{QueryValue, Request, Response};

/// How the server encodes the position of the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    /// Opaque token (`next_cursor`, `next_page_token`, ...)
    #[default]
    Cursor,
    /// Integer offset into the collection
    Offset,
}

const OFFSET_NOT_AN_INTEGER: &str = "offset is not a non-negative integer";

/// Position of the next page, as parsed from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    Token(String),
    /// Always non-negative.
    Offset(i64),
}

impl CursorValue {
    fn to_query_value(&self) -> QueryValue {
        match self {
            CursorValue::Token(s) => QueryValue::Str(s.clone()),
            CursorValue::Offset(n) => QueryValue::from(*n),
        }
    }
}

impl fmt::Display for CursorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorValue::Token(s) => write!(f, "{}", s),
            CursorValue::Offset(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken {
    pub cursor: Option<CursorValue>,
    pub has_more: bool,
}

impl PageToken {
    pub fn is_terminal(&self) -> bool {
        !self.has_more || self.cursor.is_none()
    }
}

/// The response carried pagination fields that could not be understood.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason} (raw value: {raw_value})")]
pub struct PaginationError {
    pub raw_value: String,
    pub reason: String,
}

impl PaginationError {
    fn new(raw_value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw_value: raw_value.into(),
            reason: reason.into(),
        }
    }
}

/// Reads pagination fields out of response bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationCursor {
    cursor_field_path: String,
    has_more_field_path: String,
    items_field_path: String,
    cursor_param: String,
    kind: CursorKind,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl PaginationCursor {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            cursor_field_path: config.cursor_field_path.clone(),
            has_more_field_path: config.has_more_field_path.clone(),
            items_field_path: config.items_field_path.clone(),
            cursor_param: config.cursor_param.clone(),
            kind: config.cursor_kind,
        }
    }

    pub fn cursor_param(&self) -> &str {
        &self.cursor_param
    }

    /// Parses the pagination fields of a decoded body.
    pub fn extract_token(&self, body: &Value) -> Result<PageToken, PaginationError> {
        let has_more = match lookup(body, &self.has_more_field_path) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                return Err(PaginationError::new(
                    other.to_string(),
                    format!("'{}' is not a boolean", self.has_more_field_path),
                ));
            }
        };

        if has_more == Some(false) {
            return Ok(PageToken {
                cursor: None,
                has_more: false,
            });
        }

        let cursor = match lookup(body, &self.cursor_field_path) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(raw) => Some(self.parse_cursor(raw)?),
        };

        if has_more == Some(true) && cursor.is_none() {
            return Err(PaginationError::new(
                "null",
                format!(
                    "'{}' is true but '{}' is missing",
                    self.has_more_field_path, self.cursor_field_path
                ),
            ));
        }

        let has_more = cursor.is_some();
        Ok(PageToken { cursor, has_more })
    }

    fn parse_cursor(&self, raw: &Value) -> Result<CursorValue, PaginationError> {
        match (self.kind, raw) {
            (CursorKind::Cursor, Value::String(s)) => Ok(CursorValue::Token(s.clone())),
            (CursorKind::Cursor, Value::Number(n)) => Ok(CursorValue::Token(n.to_string())),
            (CursorKind::Offset, Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| PaginationError::new(n.to_string(), OFFSET_NOT_AN_INTEGER))
                .and_then(|offset| Self::offset_in_range(offset, n.to_string())),
            (CursorKind::Offset, Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| PaginationError::new(s.clone(), OFFSET_NOT_AN_INTEGER))
                .and_then(|offset| Self::offset_in_range(offset, s.clone())),
            (_, other) => Err(PaginationError::new(
                other.to_string(),
                format!("unsupported type for '{}'", self.cursor_field_path),
            )),
        }
    }

    fn offset_in_range(offset: u64, raw_value: String) -> Result<CursorValue, PaginationError> {
        i64::try_from(offset)
            .map(CursorValue::Offset)
            .map_err(|_| PaginationError::new(raw_value, "offset is too large to send back"))
    }

    /// Builds the follow-up request: `request` with the cursor parameter replaced.
    pub fn apply(&self, request: &Request, cursor: &CursorValue) -> Request {
        request
            .clone()
            .with_query(self.cursor_param.clone(), cursor.to_query_value())
    }

    /// Returns the request for the next page, or `None` when the collection is exhausted.
    pub fn next_request(
        &self,
        current: &Request,
        response: &Response,
    ) -> Result<Option<Request>, PaginationError> {
        let body = response
            .json()
            .map_err(|e| PaginationError::new("<non-JSON body>", e.to_string()))?;

        let token = self.extract_token(body)?;
        let cursor = match token.cursor {
            Some(cursor) if token.has_more => cursor,
            _ => return Ok(None),
        };

        let next_value = cursor.to_query_value();
        if current.query_value(&self.cursor_param) == Some(&next_value) {
            return Err(PaginationError::new(
                cursor.to_string(),
                "cursor did not advance",
            ));
        }

        Ok(Some(self.apply(current, &cursor)))
    }

    /// Extracts the item array of a page. An empty path means the body is the array.
    pub fn items<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>> {
        lookup(body, &self.items_field_path).and_then(Value::as_array)
    }

    pub fn items_field_path(&self) -> &str {
        &self.items_field_path
    }
}

/// Looks up a dot-separated path (`meta.next_cursor`, `pages.0.id`).
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
