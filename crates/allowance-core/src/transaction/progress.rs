//! Display-only progress derived from elapsed time.

use crate::transaction::state::TrackerState;
use serde::Serialize;
use std::time::Duration;

/// Coarse step shown to the user while a payment is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStep {
    Processing,
    Verifying,
    Finalizing,
}

impl ProgressStep {
    /// Step for an elapsed time given the two thresholds.
    pub fn for_elapsed(
        elapsed: Duration,
        verifying_after: Duration,
        finalizing_after: Duration,
    ) -> Self {
        if elapsed >= finalizing_after {
            ProgressStep::Finalizing
        } else if elapsed >= verifying_after {
            ProgressStep::Verifying
        } else {
            ProgressStep::Processing
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProgressStep::Processing => "processing",
            ProgressStep::Verifying => "verifying",
            ProgressStep::Finalizing => "finalizing",
        }
    }
}

/// Snapshot of a tracker for UI consumption.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerProgress {
    pub state: TrackerState,
    pub step: ProgressStep,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub polls: u32,
}

impl TrackerProgress {
    /// Fraction of the countdown consumed, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        let total = self.elapsed + self.remaining;
        if total.is_zero() {
            return 1.0;
        }
        (self.elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    }
}
