//! Transaction tracking state machine.
//!
//! ```text
//! INITIATED --start--> POLLING --success--> SUCCEEDED
//!     |                   |  \--failed/rejected--> FAILED
//!     |                   \--deadline--> TIMED_OUT
//!     \--empty id--> INVALID_INPUT
//! ```
//!
//! All four right-hand states are terminal. [`TrackerState::next`] is the
//! single source of truth for legal transitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// State of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackerState {
    Initiated,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    InvalidInput,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Tracking started with a usable transaction id.
    Started,
    /// Tracking was requested with an empty transaction id.
    InputRejected,
    /// Poll reported the payment still pending.
    PollPending,
    /// Poll reported the payment completed.
    PollSucceeded,
    /// Poll reported the payment failed.
    PollFailed,
    /// Poll failed with a definitive rejection or a malformed response.
    PollRejected,
    /// Poll failed transiently (network, timeout, 5xx).
    PollErrored,
    /// The countdown reached zero.
    DeadlineReached,
}

impl TrackerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackerState::Succeeded
                | TrackerState::Failed
                | TrackerState::TimedOut
                | TrackerState::InvalidInput
        )
    }

    /// Next state for `event`, or `None` if the event does not apply.
    ///
    /// Terminal states accept no events, so late poll responses are dropped.
    pub fn next(self, event: TrackerEvent) -> Option<TrackerState> {
        use TrackerEvent as E;
        use TrackerState as S;

        match (self, event) {
            (S::Initiated, E::Started) => Some(S::Polling),
            (S::Initiated, E::InputRejected) => Some(S::InvalidInput),
            (S::Initiated, _) => None,

            (S::Polling, E::PollPending) | (S::Polling, E::PollErrored) => Some(S::Polling),
            (S::Polling, E::PollSucceeded) => Some(S::Succeeded),
            (S::Polling, E::PollFailed) | (S::Polling, E::PollRejected) => Some(S::Failed),
            (S::Polling, E::DeadlineReached) => Some(S::TimedOut),
            (S::Polling, E::Started) | (S::Polling, E::InputRejected) => None,

            (S::Succeeded, _) | (S::Failed, _) | (S::TimedOut, _) | (S::InvalidInput, _) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackerState::Initiated => "INITIATED",
            TrackerState::Polling => "POLLING",
            TrackerState::Succeeded => "SUCCEEDED",
            TrackerState::Failed => "FAILED",
            TrackerState::TimedOut => "TIMED_OUT",
            TrackerState::InvalidInput => "INVALID_INPUT",
        }
    }
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status recorded on the transaction itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    TimedOut,
    Invalid,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        self != TransactionStatus::Pending
    }
}

impl From<TrackerState> for TransactionStatus {
    fn from(state: TrackerState) -> Self {
        match state {
            TrackerState::Initiated | TrackerState::Polling => TransactionStatus::Pending,
            TrackerState::Succeeded => TransactionStatus::Success,
            TrackerState::Failed => TransactionStatus::Failed,
            TrackerState::TimedOut => TransactionStatus::TimedOut,
            TrackerState::InvalidInput => TransactionStatus::Invalid,
        }
    }
}

/// A payment transaction being tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque id supplied by the payment processor.
    pub id: String,
    /// Amount in minor currency units.
    pub amount: u64,
    /// Who the money goes to or comes from, for display.
    pub counterparty_label: String,
    pub status: TransactionStatus,
    pub deadline: Duration,
    pub elapsed: Duration,
}

impl Transaction {
    pub fn new(id: impl Into<String>, amount: u64, counterparty_label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            amount,
            counterparty_label: counterparty_label.into(),
            status: TransactionStatus::Pending,
            deadline: Duration::ZERO,
            elapsed: Duration::ZERO,
        }
    }

    pub fn has_valid_id(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

/// How a tracked transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut { reason: String },
    InvalidInput { reason: String },
}

impl TrackerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TrackerOutcome::Succeeded)
    }

    /// Whether the user may start the payment again.
    ///
    /// A timed-out payment may still settle later but is safe to retry after
    /// checking history; a definitively failed one is not.
    pub fn is_retry_advisable(&self) -> bool {
        matches!(self, TrackerOutcome::TimedOut { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TrackerOutcome::Succeeded => None,
            TrackerOutcome::Failed { reason }
            | TrackerOutcome::TimedOut { reason }
            | TrackerOutcome::InvalidInput { reason } => Some(reason),
        }
    }
}
