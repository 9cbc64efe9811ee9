//! Transaction status tracker.
//!
//! One background task owns two independent timers: a countdown that ends
//! tracking at the deadline, and a poll ticker. A tick issues at most one
//! poll; ticks are skipped while a poll is still in flight. Poll results
//! come back over a channel so state only ever changes on the driver task
//! or synchronously in [`TrackerBuilder::start`].

use crate::cancel::CancellationToken;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::transaction::progress::{ProgressStep, TrackerProgress};
use crate::transaction::push::PushEvent;
use crate::transaction::source::{PollReport, StatusSource};
use crate::transaction::state::{
    TrackerEvent, TrackerOutcome, TrackerState, Transaction, TransactionStatus,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const INVALID_INPUT_REASON: &str = "A transaction id is required to track a payment.";
const DECLINED_REASON: &str = "The payment was declined.";

type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Timing of a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub countdown: Duration,
    pub poll_interval: Duration,
    pub verifying_after: Duration,
    pub finalizing_after: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            countdown: TrackerConfig::COUNTDOWN,
            poll_interval: TrackerConfig::POLL_INTERVAL,
            verifying_after: TrackerConfig::VERIFYING_AFTER,
            finalizing_after: TrackerConfig::FINALIZING_AFTER,
        }
    }
}

impl TrackerSettings {
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = countdown;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_steps(mut self, verifying_after: Duration, finalizing_after: Duration) -> Self {
        self.verifying_after = verifying_after;
        self.finalizing_after = finalizing_after;
        self
    }

    fn timeout_reason(&self) -> String {
        format!(
            "The payment was not confirmed within {} seconds. It may still complete; \
             check your transaction history before trying again.",
            self.countdown.as_secs()
        )
    }
}

struct TrackerCore {
    state: TrackerState,
    transaction: Transaction,
    started_at: Instant,
    finished_at: Option<Instant>,
    polls: u32,
    last_error: Option<String>,
    outcome: Option<TrackerOutcome>,
    torn_down: bool,
}

struct TrackerShared {
    core: Mutex<TrackerCore>,
    on_complete: Mutex<Option<CompletionCallback>>,
    outcome_tx: watch::Sender<Option<TrackerOutcome>>,
    settings: TrackerSettings,
}

impl TrackerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> TrackerState {
        self.lock().state
    }

    /// Feed one event through the state machine.
    ///
    /// On entering a terminal state the outcome is published and the
    /// completion callback runs, outside the lock.
    fn apply(&self, event: TrackerEvent, reason: Option<String>) -> TrackerState {
        let outcome = {
            let mut core = self.lock();
            if core.torn_down {
                return core.state;
            }
            let Some(next) = core.state.next(event) else {
                debug!(
                    "Transaction {}: ignoring {:?} in state {}",
                    core.transaction.id, event, core.state
                );
                return core.state;
            };

            let previous = core.state;
            core.state = next;
            if previous != next {
                info!(
                    "Transaction {}: {} -> {}",
                    core.transaction.id, previous, next
                );
            }
            if !next.is_terminal() {
                return next;
            }

            let now = Instant::now();
            core.finished_at = Some(now);
            core.transaction.status = TransactionStatus::from(next);
            core.transaction.elapsed = now.saturating_duration_since(core.started_at);

            let outcome = match next {
                TrackerState::Succeeded => TrackerOutcome::Succeeded,
                TrackerState::Failed => TrackerOutcome::Failed {
                    reason: reason.unwrap_or_else(|| DECLINED_REASON.to_string()),
                },
                TrackerState::TimedOut => TrackerOutcome::TimedOut {
                    reason: reason.unwrap_or_else(|| self.settings.timeout_reason()),
                },
                _ => TrackerOutcome::InvalidInput {
                    reason: reason.unwrap_or_else(|| INVALID_INPUT_REASON.to_string()),
                },
            };
            core.outcome = Some(outcome.clone());
            outcome
        };

        let state = self.state();
        let succeeded = outcome.is_success();
        self.outcome_tx.send_replace(Some(outcome));

        let callback = self
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(succeeded);
        }
        state
    }

    fn handle_poll(&self, result: Result<PollReport>) -> TrackerState {
        let id = {
            let mut core = self.lock();
            core.polls += 1;
            core.transaction.id.clone()
        };

        match result {
            Ok(PollReport::Pending) => {
                debug!("Transaction {} still pending", id);
                self.lock().last_error = None;
                self.apply(TrackerEvent::PollPending, None)
            }
            Ok(PollReport::Succeeded) => self.apply(TrackerEvent::PollSucceeded, None),
            Ok(PollReport::Failed { reason }) => self.apply(TrackerEvent::PollFailed, reason),
            Err(e) if e.is_definitive_rejection() => {
                warn!("Transaction {}: status poll rejected: {}", id, e);
                self.apply(TrackerEvent::PollRejected, Some(e.user_message()))
            }
            Err(e) => {
                warn!("Transaction {}: status poll failed, will retry: {}", id, e);
                self.lock().last_error = Some(e.to_string());
                self.apply(TrackerEvent::PollErrored, None)
            }
        }
    }
}

/// Configures and starts a [`TransactionStatusTracker`].
pub struct TrackerBuilder {
    transaction: Transaction,
    source: Arc<dyn StatusSource>,
    settings: TrackerSettings,
    push: Option<broadcast::Receiver<PushEvent>>,
    on_complete: Option<CompletionCallback>,
}

impl TrackerBuilder {
    pub fn settings(mut self, settings: TrackerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Poll immediately whenever a push event for this transaction arrives.
    pub fn push_events(mut self, events: broadcast::Receiver<PushEvent>) -> Self {
        self.push = Some(events);
        self
    }

    /// Called exactly once with `true` on success, `false` on any other end.
    ///
    /// Not called if the tracker is torn down first.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Start tracking. Must be called inside a tokio runtime unless the
    /// transaction id is empty.
    pub fn start(self) -> TransactionStatusTracker {
        let started_at = Instant::now();
        let mut transaction = self.transaction;
        transaction.deadline = self.settings.countdown;
        transaction.status = TransactionStatus::Pending;
        transaction.elapsed = Duration::ZERO;

        let valid = transaction.has_valid_id();
        let id = transaction.id.clone();
        let (outcome_tx, _) = watch::channel(None);
        let shared = Arc::new(TrackerShared {
            core: Mutex::new(TrackerCore {
                state: TrackerState::Initiated,
                transaction,
                started_at,
                finished_at: None,
                polls: 0,
                last_error: None,
                outcome: None,
                torn_down: false,
            }),
            on_complete: Mutex::new(self.on_complete),
            outcome_tx,
            settings: self.settings,
        });
        let cancel = CancellationToken::new();

        if !valid {
            warn!("Refusing to track a transaction without an id");
            shared.apply(TrackerEvent::InputRejected, None);
            return TransactionStatusTracker {
                shared,
                cancel,
                driver: None,
            };
        }

        shared.apply(TrackerEvent::Started, None);
        info!(
            "Tracking transaction {} for {:?}",
            id, shared.settings.countdown
        );
        let driver = tokio::spawn(drive(
            shared.clone(),
            self.source,
            self.push,
            cancel.clone(),
            id,
            started_at,
        ));

        TransactionStatusTracker {
            shared,
            cancel,
            driver: Some(driver),
        }
    }
}

/// Handle to a running tracker.
///
/// Dropping the handle tears the tracker down.
pub struct TransactionStatusTracker {
    shared: Arc<TrackerShared>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl TransactionStatusTracker {
    pub fn builder(transaction: Transaction, source: Arc<dyn StatusSource>) -> TrackerBuilder {
        TrackerBuilder {
            transaction,
            source,
            settings: TrackerSettings::default(),
            push: None,
            on_complete: None,
        }
    }

    /// Start tracking with default settings.
    pub fn start<F>(transaction: Transaction, source: Arc<dyn StatusSource>, on_complete: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self::builder(transaction, source)
            .on_complete(on_complete)
            .start()
    }

    pub fn state(&self) -> TrackerState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Snapshot of the tracked transaction.
    pub fn transaction(&self) -> Transaction {
        let core = self.shared.lock();
        let mut transaction = core.transaction.clone();
        if core.finished_at.is_none() {
            transaction.elapsed = Instant::now().saturating_duration_since(core.started_at);
        }
        transaction
    }

    pub fn outcome(&self) -> Option<TrackerOutcome> {
        self.shared.lock().outcome.clone()
    }

    /// Reason shown to the user for a non-successful end.
    pub fn failure_reason(&self) -> Option<String> {
        self.outcome()
            .and_then(|outcome| outcome.reason().map(str::to_string))
    }

    /// Most recent transient poll error, cleared by the next good poll.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Number of polls that have completed.
    pub fn polls(&self) -> u32 {
        self.shared.lock().polls
    }

    pub fn progress(&self) -> TrackerProgress {
        let core = self.shared.lock();
        let settings = &self.shared.settings;
        let end = core.finished_at.unwrap_or_else(Instant::now);
        let elapsed = end
            .saturating_duration_since(core.started_at)
            .min(settings.countdown);

        TrackerProgress {
            state: core.state,
            step: ProgressStep::for_elapsed(
                elapsed,
                settings.verifying_after,
                settings.finalizing_after,
            ),
            elapsed,
            remaining: settings.countdown.saturating_sub(elapsed),
            polls: core.polls,
        }
    }

    /// Wait for a terminal outcome. Returns `None` if torn down first.
    pub async fn wait(&self) -> Option<TrackerOutcome> {
        let mut outcome_rx = self.shared.outcome_tx.subscribe();
        let finished = async {
            loop {
                let current = outcome_rx.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
                if outcome_rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        tokio::select! {
            outcome = finished => outcome,
            _ = self.cancel.cancelled() => self.outcome(),
        }
    }

    /// Stop tracking without reporting an outcome.
    ///
    /// The completion callback is dropped uncalled and any in-flight poll
    /// result is discarded. Safe to call more than once.
    pub fn teardown(&self) {
        {
            let mut core = self.shared.lock();
            if core.torn_down {
                return;
            }
            core.torn_down = true;
            debug!("Tearing down tracker for {}", core.transaction.id);
        }
        self.shared
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.cancel();
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

impl Drop for TransactionStatusTracker {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn drive(
    shared: Arc<TrackerShared>,
    source: Arc<dyn StatusSource>,
    mut push: Option<broadcast::Receiver<PushEvent>>,
    cancel: CancellationToken,
    id: String,
    started_at: Instant,
) {
    let settings = shared.settings.clone();
    let deadline = tokio::time::sleep_until(started_at + settings.countdown);
    tokio::pin!(deadline);

    let mut ticker =
        tokio::time::interval_at(started_at + settings.poll_interval, settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (result_tx, mut result_rx) = mpsc::channel::<Result<PollReport>>(1);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Tracker for {} cancelled", id);
                break;
            }
            Some(result) = result_rx.recv() => {
                in_flight = None;
                if shared.handle_poll(result).is_terminal() {
                    break;
                }
            }
            _ = &mut deadline => {
                warn!("Transaction {} not confirmed before the deadline", id);
                shared.apply(TrackerEvent::DeadlineReached, None);
                break;
            }
            _ = ticker.tick() => {
                if in_flight.is_some() {
                    debug!("Poll for {} still in flight; skipping tick", id);
                } else {
                    in_flight = Some(spawn_poll(&source, &id, &result_tx));
                }
            }
            Some(event) = next_push(&mut push, &id) => {
                if in_flight.is_none() {
                    debug!("Push event '{}' for {}; polling now", event.status, id);
                    in_flight = Some(spawn_poll(&source, &id, &result_tx));
                }
            }
        }
    }

    // Late results have nowhere to go once the receiver is dropped.
    if let Some(poll) = in_flight {
        poll.abort();
    }
}

fn spawn_poll(
    source: &Arc<dyn StatusSource>,
    id: &str,
    results: &mpsc::Sender<Result<PollReport>>,
) -> JoinHandle<()> {
    let source = source.clone();
    let id = id.to_string();
    let results = results.clone();
    tokio::spawn(async move {
        let result = source.fetch_status(&id).await;
        let _ = results.send(result).await;
    })
}

/// Next push event concerning `id`. Never resolves without a feed.
async fn next_push(
    push: &mut Option<broadcast::Receiver<PushEvent>>,
    id: &str,
) -> Option<PushEvent> {
    loop {
        let Some(events) = push.as_mut() else {
            return std::future::pending().await;
        };
        match events.recv().await {
            Ok(event) if event.concerns(id) => return Some(event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Tracker for {} skipped {} push events", id, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                *push = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllowanceError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Answers polls from a script; pending once the script runs out.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<PollReport>>>,
        delay: Duration,
        calls: Mutex<Vec<Duration>>,
        started: Instant,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<PollReport>>) -> Arc<Self> {
            Self::delayed(script, Duration::ZERO)
        }

        fn delayed(script: Vec<Result<PollReport>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay,
                calls: Mutex::new(Vec::new()),
                started: Instant::now(),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<Duration> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch_status(&self, transaction_id: &str) -> Result<PollReport> {
            assert_eq!(transaction_id, "tx-1");
            self.calls.lock().unwrap().push(self.started.elapsed());
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollReport::Pending))
        }
    }

    struct Completion {
        calls: Arc<AtomicUsize>,
        success: Arc<AtomicBool>,
    }

    impl Completion {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                success: Arc::new(AtomicBool::new(false)),
            }
        }

        fn callback(&self) -> impl FnOnce(bool) + Send + 'static {
            let calls = self.calls.clone();
            let success = self.success.clone();
            move |ok| {
                calls.fetch_add(1, Ordering::SeqCst);
                success.store(ok, Ordering::SeqCst);
            }
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn succeeded(&self) -> bool {
            self.success.load(Ordering::SeqCst)
        }
    }

    fn tx() -> Transaction {
        Transaction::new("tx-1", 2_500, "Kofi")
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_success() {
        let source = ScriptedSource::new(vec![
            Ok(PollReport::Pending),
            Ok(PollReport::Pending),
            Ok(PollReport::Pending),
            Ok(PollReport::Succeeded),
        ]);
        let done = Completion::new();
        let start = Instant::now();
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), done.callback());
        assert_eq!(tracker.state(), TrackerState::Polling);

        let outcome = tracker.wait().await;
        assert_eq!(outcome, Some(TrackerOutcome::Succeeded));
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(tracker.state(), TrackerState::Succeeded);
        assert_eq!(tracker.transaction().status, TransactionStatus::Success);
        assert_eq!(tracker.transaction().elapsed, Duration::from_secs(20));
        assert_eq!(
            source.calls(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20)
            ]
        );
        assert_eq!(done.count(), 1);
        assert!(done.succeeded());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls().len(), 4);
        assert_eq!(done.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolves_times_out() {
        let source = ScriptedSource::new(vec![]);
        let done = Completion::new();
        let start = Instant::now();
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), done.callback());

        let outcome = tracker.wait().await.unwrap();
        assert!(matches!(outcome, TrackerOutcome::TimedOut { .. }));
        assert!(outcome.is_retry_advisable());
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        assert_eq!(tracker.state(), TrackerState::TimedOut);
        assert!(tracker.failure_reason().unwrap().contains("120 seconds"));
        assert!((23..=24).contains(&source.calls().len()));
        assert_eq!(done.count(), 1);
        assert!(!done.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_fails_with_reason() {
        let source = ScriptedSource::new(vec![Err(AllowanceError::Rejected {
            status: 404,
            message: "no such transaction".into(),
        })]);
        let done = Completion::new();
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), done.callback());

        let outcome = tracker.wait().await.unwrap();
        assert_eq!(
            outcome,
            TrackerOutcome::Failed {
                reason: "The requested record could not be found.".into()
            }
        );
        assert_eq!(source.calls().len(), 1);
        assert_eq!(done.count(), 1);
        assert!(!done.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_payment_uses_server_reason() {
        let source = ScriptedSource::new(vec![Ok(PollReport::Failed {
            reason: Some("Insufficient funds".into()),
        })]);
        let tracker = TransactionStatusTracker::start(tx(), source, |_| {});

        tracker.wait().await;
        assert_eq!(tracker.state(), TrackerState::Failed);
        assert_eq!(tracker.failure_reason().as_deref(), Some("Insufficient funds"));
        assert_eq!(tracker.transaction().status, TransactionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_fails() {
        let source = ScriptedSource::new(vec![Err(AllowanceError::validation(
            "status",
            "unrecognised status 'exploded'",
        ))]);
        let tracker = TransactionStatusTracker::start(tx(), source, |_| {});

        let outcome = tracker.wait().await.unwrap();
        assert!(matches!(outcome, TrackerOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_polling() {
        let source = ScriptedSource::new(vec![
            Err(AllowanceError::transient("HTTP 503")),
            Err(AllowanceError::Timeout(Duration::from_secs(15))),
            Err(AllowanceError::ServiceUnavailable {
                domain: "api.example".into(),
            }),
            Ok(PollReport::Succeeded),
        ]);
        let done = Completion::new();
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), done.callback());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(tracker.state(), TrackerState::Polling);
        assert!(tracker.last_error().is_some());

        assert_eq!(tracker.wait().await, Some(TrackerOutcome::Succeeded));
        assert_eq!(source.calls().len(), 4);
        assert!(done.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_outage_keeps_polling_but_refusal_fails() {
        let source = ScriptedSource::new(vec![
            Err(AllowanceError::AuthenticationUnavailable {
                message: "HTTP 503".into(),
                retryable: true,
            }),
            Ok(PollReport::Succeeded),
        ]);
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), |_| {});
        assert_eq!(tracker.wait().await, Some(TrackerOutcome::Succeeded));
        assert_eq!(source.calls().len(), 2);

        let source = ScriptedSource::new(vec![Err(AllowanceError::AuthenticationUnavailable {
            message: "HTTP 403".into(),
            retryable: false,
        })]);
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), |_| {});
        assert!(matches!(
            tracker.wait().await,
            Some(TrackerOutcome::Failed { .. })
        ));
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_id_is_invalid_without_io() {
        let source = ScriptedSource::new(vec![]);
        let done = Completion::new();
        let tracker = TransactionStatusTracker::start(
            Transaction::new("", 100, "Ama"),
            source.clone(),
            done.callback(),
        );

        assert_eq!(tracker.state(), TrackerState::InvalidInput);
        assert_eq!(done.count(), 1);
        assert!(!done.succeeded());
        assert_eq!(tracker.transaction().status, TransactionStatus::Invalid);
        assert!(matches!(
            tracker.wait().await,
            Some(TrackerOutcome::InvalidInput { .. })
        ));
        assert!(source.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_suppresses_callback() {
        let source = ScriptedSource::delayed(vec![Ok(PollReport::Succeeded)], Duration::from_secs(3));
        let done = Completion::new();
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), done.callback());

        // First poll is in flight between 5s and 8s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.teardown();
        tracker.teardown();
        assert_eq!(tracker.wait().await, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(done.count(), 0);
        assert_eq!(tracker.state(), TrackerState::Polling);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_polls_never_overlap() {
        let source = ScriptedSource::delayed(vec![], Duration::from_secs(12));
        let tracker = TransactionStatusTracker::start(tx(), source.clone(), |_| {});

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
        assert!(source.calls().len() < 12);
        drop(tracker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_after_deadline_is_discarded() {
        let source = ScriptedSource::delayed(vec![Ok(PollReport::Succeeded)], Duration::from_secs(200));
        let done = Completion::new();
        let tracker = TransactionStatusTracker::start(tx(), source, done.callback());

        let outcome = tracker.wait().await.unwrap();
        assert!(matches!(outcome, TrackerOutcome::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(tracker.state(), TrackerState::TimedOut);
        assert_eq!(done.count(), 1);
        assert!(!done.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_event_triggers_immediate_poll() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let source = ScriptedSource::new(vec![Ok(PollReport::Succeeded)]);
        let start = Instant::now();
        let tracker = TransactionStatusTracker::builder(tx(), source.clone())
            .push_events(events_rx)
            .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        events_tx
            .send(PushEvent {
                phone: "0244000000".into(),
                amount: "25.00".into(),
                status: "success".into(),
                timestamp: Utc::now(),
                transaction_id: Some("tx-1".into()),
            })
            .unwrap();

        assert_eq!(tracker.wait().await, Some(TrackerOutcome::Succeeded));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_for_other_transaction_ignored() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let source = ScriptedSource::new(vec![]);
        let _tracker = TransactionStatusTracker::builder(tx(), source.clone())
            .push_events(events_rx)
            .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        events_tx
            .send(PushEvent {
                phone: "0244000000".into(),
                amount: "25.00".into(),
                status: "success".into(),
                timestamp: Utc::now(),
                transaction_id: Some("tx-other".into()),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(source.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_steps() {
        let source = ScriptedSource::new(vec![]);
        let tracker = TransactionStatusTracker::start(tx(), source, |_| {});

        let progress = tracker.progress();
        assert_eq!(progress.step, ProgressStep::Processing);
        assert_eq!(progress.remaining, Duration::from_secs(120));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(tracker.progress().step, ProgressStep::Verifying);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let progress = tracker.progress();
        assert_eq!(progress.step, ProgressStep::Finalizing);
        assert_eq!(progress.remaining, Duration::from_secs(25));
        assert_eq!(progress.state, TrackerState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_settings() {
        let source = ScriptedSource::new(vec![]);
        let start = Instant::now();
        let tracker = TransactionStatusTracker::builder(tx(), source.clone())
            .settings(
                TrackerSettings::default()
                    .with_countdown(Duration::from_secs(10))
                    .with_poll_interval(Duration::from_secs(2)),
            )
            .start();

        assert!(matches!(
            tracker.wait().await,
            Some(TrackerOutcome::TimedOut { .. })
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(tracker.transaction().deadline, Duration::from_secs(10));
        assert!((4..=5).contains(&source.calls().len()));
    }
}
