//! Request/response types and the transport seam.
//!
//! A [`Transport`] moves one [`ApiRequest`] over the wire and returns the raw
//! [`ApiResponse`] whatever its status. Only failures to obtain a response at
//! all (connect errors, resets, transport timeouts) are errors here; status
//! classification happens in the fetcher.

use crate::config::NetworkConfig;
use crate::error::{AllowanceError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Description of one logical call, before credentials are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    /// Path relative to the client's base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// JSON payload. Object payloads also receive the token as a field.
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the client's retry budget for this call.
    pub max_attempts: Option<u32>,
}

impl RequestSpec {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Key identifying this call in the response cache.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{} {}", self.method, self.path);
        for (k, v) in &self.query {
            key.push_str(&format!("&{}={}", k, v));
        }
        key
    }

    /// Build the wire request, attaching the anti-forgery token if present.
    pub fn to_request(&self, token: Option<&str>, timeout: Duration) -> ApiRequest {
        let mut headers = self.headers.clone();
        let mut body = self.body.clone();

        if let Some(token) = token {
            headers.push((NetworkConfig::CSRF_HEADER.to_string(), token.to_string()));
            if let Some(Value::Object(map)) = body.as_mut() {
                map.insert(
                    NetworkConfig::CSRF_FIELD.to_string(),
                    Value::String(token.to_string()),
                );
            }
        }

        ApiRequest {
            request_id: Uuid::new_v4(),
            method: self.method,
            path: self.path.clone(),
            query: self.query.clone(),
            body,
            headers,
            timeout,
        }
    }
}

/// A fully prepared request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub request_id: Uuid,
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Per-attempt timeout the transport should also honor.
    pub timeout: Duration,
}

impl ApiRequest {
    /// Look up a header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status code plus decoded body.
///
/// Bodies that are not JSON are kept as `Value::String`; empty bodies are
/// `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Shorthand for a 200 response.
    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(AllowanceError::from)
    }

    /// Best-effort error description from ad hoc upstream error shapes.
    pub fn error_message(&self) -> Option<String> {
        match &self.body {
            Value::Object(map) => ["error", "message", "detail", "msg"]
                .iter()
                .find_map(|key| match map.get(*key) {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Object(inner)) => inner
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                }),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Machine-readable error code, if the body carries one.
    pub fn error_code(&self) -> Option<&str> {
        self.body
            .get("code")
            .or_else(|| self.body.get("error_code"))
            .and_then(Value::as_str)
    }
}

/// Moves requests over the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one attempt of a request and return whatever response came back.
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// Shared transport handle.
pub type DynTransport = Arc<dyn Transport>;
