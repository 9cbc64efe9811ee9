//! HTTP transport backed by reqwest.
//!
//! Provides:
//! - Base URL joining for relative request paths
//! - A cookie store so the session cookie travels with the anti-forgery token
//! - Per-request timeouts
//! - User-agent and request-id headers

use crate::config::{ClientConfig, NetworkConfig};
use crate::error::{AllowanceError, Result};
use crate::network::transport::{ApiRequest, ApiResponse, Method, Transport};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// reqwest-based [`Transport`].
pub struct HttpTransport {
    client: Client,
    base_url: String,
    /// Upper bound applied at the client level as a backstop.
    default_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the given client configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Url::parse(&config.base_url).map_err(|e| AllowanceError::Config {
            message: format!("invalid base_url {:?}: {}", config.base_url, e),
        })?;

        let client = Client::builder()
            .timeout(config.attempt_timeout)
            .user_agent(config.user_agent.as_str())
            .cookie_store(true)
            .build()
            .map_err(|e| AllowanceError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_timeout: config.attempt_timeout,
        })
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Resolve a request path against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let joined = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&joined).map_err(|e| AllowanceError::Config {
            message: format!("invalid request URL {:?}: {}", joined, e),
        })
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;
        let timeout = request.timeout.min(self.default_timeout);

        let mut builder = self
            .client
            .request(Self::method(request.method), url.clone())
            .timeout(timeout)
            .header(
                NetworkConfig::REQUEST_ID_HEADER,
                request.request_id.to_string(),
            );
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AllowanceError::Timeout(timeout)
            } else {
                AllowanceError::Transient {
                    message: format!("{} {} failed: {}", request.method, url, e),
                    status: None,
                }
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AllowanceError::Timeout(timeout)
            } else {
                AllowanceError::Transient {
                    message: format!("reading body of {} {} failed: {}", request.method, url, e),
                    status: Some(status),
                }
            }
        })?;

        debug!(
            "{} {} -> {} (request {})",
            request.method, url, status, request.request_id
        );

        Ok(ApiResponse::new(status, decode_body(&text)))
    }
}

/// Decode a response body, keeping non-JSON text as a string.
pub fn decode_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(base: &str) -> HttpTransport {
        HttpTransport::new(&ClientConfig::new(base)).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let t = transport("https://wallet.example.com/");
        assert_eq!(
            t.url_for("/api/csrf-token").unwrap().as_str(),
            "https://wallet.example.com/api/csrf-token"
        );
        assert_eq!(
            t.url_for("api/ads").unwrap().as_str(),
            "https://wallet.example.com/api/ads"
        );
        assert_eq!(
            t.url_for("https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(HttpTransport::new(&ClientConfig::new("::nope::")).is_err());
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(""), Value::Null);
        assert_eq!(decode_body("  {\"a\":1} "), json!({ "a": 1 }));
        assert_eq!(decode_body("<html>oops</html>"), json!("<html>oops</html>"));
    }
}
