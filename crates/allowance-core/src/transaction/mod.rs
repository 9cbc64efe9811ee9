//! Payment transaction tracking.
//!
//! A [`TransactionStatusTracker`] polls a [`StatusSource`] until the payment
//! succeeds, fails, or the countdown runs out, and reports the result once
//! through a completion callback. Server push events, when available, only
//! shorten the wait for the next poll.

pub mod progress;
pub mod push;
pub mod source;
pub mod state;
pub mod tracker;

pub use progress::{ProgressStep, TrackerProgress};
pub use push::{parse_push_message, PushEvent, PushFeed, PushListener};
pub use source::{parse_status, ApiStatusSource, PollReport, StatusSource};
pub use state::{TrackerEvent, TrackerOutcome, TrackerState, Transaction, TransactionStatus};
pub use tracker::{TrackerBuilder, TrackerSettings, TransactionStatusTracker};
