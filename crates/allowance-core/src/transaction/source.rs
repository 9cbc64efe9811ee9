//! Where the tracker gets transaction status from.

use crate::api::ResilientApiClient;
use crate::error::{AllowanceError, Result};
use crate::network::RequestSpec;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Status reported by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReport {
    Pending,
    Succeeded,
    Failed { reason: Option<String> },
}

/// Answers "what is the status of transaction X right now".
///
/// Implementations make a single attempt; the tracker's poll timer is the
/// retry loop.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, transaction_id: &str) -> Result<PollReport>;
}

/// [`StatusSource`] backed by the status endpoint of a [`ResilientApiClient`].
pub struct ApiStatusSource {
    client: Arc<ResilientApiClient>,
    path: String,
}

impl ApiStatusSource {
    /// Poll the status path configured on `client`.
    pub fn new(client: Arc<ResilientApiClient>) -> Self {
        let path = client.config().status_path.clone();
        Self { client, path }
    }

    pub fn with_path(client: Arc<ResilientApiClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl StatusSource for ApiStatusSource {
    async fn fetch_status(&self, transaction_id: &str) -> Result<PollReport> {
        let spec = RequestSpec::post(&self.path, json!({ "transaction_id": transaction_id }))
            .with_max_attempts(1);
        let response = self.client.call(&spec).await?;
        parse_status(&response.body)
    }
}

/// Interpret a status response body.
///
/// The body is either an object or an array whose first element is the
/// record. The status is read from `transaction_status`, falling back to
/// `status`. Anything unrecognised is a validation error.
pub fn parse_status(body: &Value) -> Result<PollReport> {
    let record = match body {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| AllowanceError::validation("body", "empty status list"))?,
        Value::Object(_) => body,
        Value::Null => {
            return Err(AllowanceError::validation("body", "empty status response"));
        }
        other => {
            return Err(AllowanceError::validation(
                "body",
                format!("unexpected status response: {}", other),
            ));
        }
    };

    let status = record
        .get("transaction_status")
        .or_else(|| record.get("status"))
        .and_then(Value::as_str)
        .ok_or_else(|| AllowanceError::validation("status", "status field missing"))?;

    match status.trim().to_ascii_lowercase().as_str() {
        "pending" => Ok(PollReport::Pending),
        "success" | "successful" => Ok(PollReport::Succeeded),
        "failed" => {
            let reason = ["reason", "message", "result_desc"]
                .iter()
                .find_map(|key| record.get(*key).and_then(Value::as_str))
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string);
            Ok(PollReport::Failed { reason })
        }
        other => Err(AllowanceError::validation(
            "status",
            format!("unrecognised status '{}'", other),
        )),
    }
}
