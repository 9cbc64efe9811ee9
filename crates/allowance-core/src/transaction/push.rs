//! Server-pushed payment events.
//!
//! A [`PushListener`] holds a websocket to the payment backend and appends
//! each event to a bounded [`PushFeed`]. The feed is for display; trackers
//! subscribed to it treat an event only as a hint to poll now. Polling stays
//! the source of truth.

use crate::cancel::CancellationToken;
use crate::config::TrackerConfig;
use crate::error::{AllowanceError, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// A payment event pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(default)]
    pub phone: String,
    #[serde(deserialize_with = "amount_from_any")]
    pub amount: String,
    pub status: String,
    #[serde(deserialize_with = "timestamp_from_any")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl PushEvent {
    /// Whether this event concerns `transaction_id`.
    ///
    /// Events without an id match every transaction.
    pub fn concerns(&self, transaction_id: &str) -> bool {
        self.transaction_id
            .as_deref()
            .map_or(true, |id| id == transaction_id)
    }

    /// The phone number with all but its last three digits hidden, for logs.
    pub fn masked_phone(&self) -> String {
        let len = self.phone.chars().count();
        let shown = if len > 6 { 3 } else { 0 };
        self.phone
            .chars()
            .enumerate()
            .map(|(i, c)| if i + shown < len { '*' } else { c })
            .collect()
    }
}

fn amount_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid amount: {}", other))),
    }
}

fn timestamp_from_any<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom),
        Value::Number(n) => {
            let raw = n
                .as_i64()
                .ok_or_else(|| D::Error::custom("timestamp out of range"))?;
            // Values past year 2286 in seconds are millisecond epochs.
            let parsed = if raw > 9_999_999_999 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            };
            parsed.ok_or_else(|| D::Error::custom("timestamp out of range"))
        }
        other => Err(D::Error::custom(format!("invalid timestamp: {}", other))),
    }
}

/// Parse one websocket text frame: a single event or an array of them.
pub fn parse_push_message(text: &str) -> Result<Vec<PushEvent>> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(AllowanceError::from))
            .collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

/// Bounded, newest-first list of push events plus a fan-out channel.
pub struct PushFeed {
    events: Mutex<VecDeque<PushEvent>>,
    capacity: usize,
    sender: broadcast::Sender<PushEvent>,
}

impl PushFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
        }
    }

    /// Record an event and notify subscribers.
    pub fn push(&self, event: PushEvent) {
        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.push_front(event.clone());
            events.truncate(self.capacity);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Events currently on display, newest first.
    pub fn snapshot(&self) -> Vec<PushEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.sender.subscribe()
    }
}

impl Default for PushFeed {
    fn default() -> Self {
        Self::new(TrackerConfig::PUSH_FEED_CAPACITY)
    }
}

/// Keeps a websocket open to the push endpoint and feeds a [`PushFeed`].
pub struct PushListener {
    url: String,
    feed: Arc<PushFeed>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

impl PushListener {
    pub fn new(url: impl Into<String>, feed: Arc<PushFeed>) -> Self {
        Self {
            url: url.into(),
            feed,
            connect_timeout: TrackerConfig::PUSH_CONNECT_TIMEOUT,
            reconnect_delay: TrackerConfig::PUSH_RECONNECT_DELAY,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Stop the listener when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, read until the socket drops, wait, reconnect. Stops on cancel.
    pub async fn run(self) {
        info!("Push listener starting for {}", self.url);
        while !self.cancel.is_cancelled() {
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _))) => {
                    info!("Push channel connected to {}", self.url);
                    self.read_until_closed(stream).await;
                }
                Ok(Err(e)) => warn!("Push channel connect failed: {}", e),
                Err(_) => warn!(
                    "Push channel connect timed out after {:?}",
                    self.connect_timeout
                ),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    debug!("Reconnecting push channel to {}", self.url);
                }
            }
        }
        info!("Push listener for {} stopped", self.url);
    }

    async fn read_until_closed<S>(&self, stream: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Push channel closed by server");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        return;
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match parse_push_message(text) {
            Ok(events) => {
                for event in events {
                    debug!(
                        "Push event: {} {} {}",
                        event.masked_phone(),
                        event.amount,
                        event.status
                    );
                    self.feed.push(event);
                }
            }
            Err(e) => warn!("Ignoring malformed push message: {}", e),
        }
    }
}
