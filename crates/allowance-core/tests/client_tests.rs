//! Integration tests for the ResilientApiClient public interface.
//!
//! A scripted in-process backend stands in for the HTTP server so retry
//! delays run on a paused clock.

use allowance_core::network::{ApiRequest, DynTransport, Transport};
use allowance_core::{
    speculate, AllowanceError, ApiResponse, ApiStatusSource, CircuitState, ClientConfig, Method,
    RequestSpec, ResilientApiClient, Result, TrackerOutcome, Transaction,
    TransactionStatusTracker,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN_PATH: &str = "/api/csrf-token";

type Handler = Box<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>;

/// Issues tokens "t1", "t2", ... and answers business calls with `handler`.
struct Backend {
    issued: AtomicUsize,
    token_status: u16,
    /// Token requests still to answer with 503 before issuing normally.
    token_outage: AtomicUsize,
    /// Applied to GETs after the handler has produced its answer.
    read_latency: Duration,
    handler: Handler,
    log: Mutex<Vec<(String, Option<String>, Option<Value>)>>,
}

impl Backend {
    fn new(handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static) -> Arc<Self> {
        Self::with_read_latency(handler, Duration::ZERO)
    }

    fn with_read_latency(
        handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
        read_latency: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicUsize::new(0),
            token_status: 200,
            token_outage: AtomicUsize::new(0),
            read_latency,
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    fn without_tokens() -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicUsize::new(0),
            token_status: 500,
            token_outage: AtomicUsize::new(0),
            read_latency: Duration::ZERO,
            handler: Box::new(|_| ApiResponse::ok(json!({}))),
            log: Mutex::new(Vec::new()),
        })
    }

    fn token_fetches(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _, _)| path == TOKEN_PATH)
            .count()
    }

    fn business_calls(&self) -> Vec<(String, Option<String>, Option<Value>)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _, _)| path != TOKEN_PATH)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for Backend {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.log.lock().unwrap().push((
            request.path.clone(),
            request.header("x-csrf-token").map(str::to_string),
            request.body.clone(),
        ));

        if request.path == TOKEN_PATH {
            let outage = self
                .token_outage
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if outage {
                return Ok(ApiResponse::new(503, json!({"error": "maintenance"})));
            }
            if self.token_status != 200 {
                return Ok(ApiResponse::new(self.token_status, json!({"error": "down"})));
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(ApiResponse::ok(json!({ "csrf_token": format!("t{}", n) })));
        }
        let response = (self.handler)(request);
        if request.method == Method::Get && !self.read_latency.is_zero() {
            tokio::time::sleep(self.read_latency).await;
        }
        Ok(response)
    }
}

fn client(backend: &Arc<Backend>) -> ResilientApiClient {
    let transport: DynTransport = backend.clone();
    ResilientApiClient::with_transport(ClientConfig::new("https://api.example.com"), transport)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_token_attached_and_reused() {
    let backend = Backend::new(|_| ApiResponse::ok(json!({"ads": []})));
    let client = client(&backend);

    client.call(&RequestSpec::get("/api/ads")).await.unwrap();
    client.call(&RequestSpec::get("/api/children")).await.unwrap();

    assert_eq!(backend.token_fetches(), 1);
    let calls = backend.business_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, token, _)| token.as_deref() == Some("t1")));
}

#[tokio::test(start_paused = true)]
async fn test_write_body_carries_token_field() {
    let backend = Backend::new(|_| ApiResponse::ok(json!({"ok": true})));
    let client = client(&backend);

    client
        .call(&RequestSpec::post("/api/ads", json!({"title": "Bike"})))
        .await
        .unwrap();

    let (_, _, body) = &backend.business_calls()[0];
    let body = body.as_ref().unwrap();
    assert_eq!(body["title"], "Bike");
    assert_eq!(body["csrf_token"], "t1");
}

#[tokio::test(start_paused = true)]
async fn test_token_rejection_recovered_once() {
    let backend = Backend::new(|request| match request.header("x-csrf-token") {
        Some("t1") => ApiResponse::new(419, json!({"message": "CSRF token mismatch"})),
        _ => ApiResponse::ok(json!({"balance": 40})),
    });
    let client = client(&backend);

    let response = client.call(&RequestSpec::get("/api/balance")).await.unwrap();
    assert_eq!(response.body["balance"], 40);

    let tokens: Vec<_> = backend
        .business_calls()
        .into_iter()
        .map(|(_, token, _)| token)
        .collect();
    assert_eq!(tokens, vec![Some("t1".into()), Some("t2".into())]);
    assert_eq!(backend.token_fetches(), 2);
    assert_eq!(client.session().cached().unwrap().value(), "t2");
}

#[tokio::test(start_paused = true)]
async fn test_second_token_rejection_is_fatal() {
    let backend = Backend::new(|_| ApiResponse::new(419, json!({"message": "CSRF token mismatch"})));
    let client = client(&backend);

    let err = client
        .call(&RequestSpec::get("/api/balance"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllowanceError::AuthenticationFailed { .. }));
    assert_eq!(backend.business_calls().len(), 2);
    assert!(client.session().cached().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_token_unavailable_blocks_call() {
    let backend = Backend::without_tokens();
    let client = client(&backend);

    let err = client
        .call(&RequestSpec::get("/api/ads"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllowanceError::AuthenticationUnavailable { .. }));
    assert!(backend.business_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_token_outage_does_not_fail_payment() {
    let backend = Backend::new(|_| ApiResponse::ok(json!({"transaction_status": "success"})));
    backend.token_outage.store(3, Ordering::SeqCst);
    let client = Arc::new(client(&backend));

    let tracker = TransactionStatusTracker::start(
        Transaction::new("tx-1", 1_000, "Ama"),
        Arc::new(ApiStatusSource::new(client.clone())),
        |_| {},
    );

    assert_eq!(tracker.wait().await, Some(TrackerOutcome::Succeeded));
    assert_eq!(backend.token_fetches(), 4);
    assert_eq!(backend.business_calls().len(), 1);
    assert!(tracker.polls() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_short_circuits_calls() {
    let backend = Backend::new(|_| ApiResponse::new(503, json!({"error": "maintenance"})));
    let client = client(&backend);

    let first = client.call(&RequestSpec::get("/api/ads")).await;
    assert!(first.is_err());
    assert_eq!(backend.business_calls().len(), 3);
    assert_eq!(client.breaker().state(), CircuitState::Open);

    let second = client
        .call(&RequestSpec::get("/api/ads"))
        .await
        .unwrap_err();
    assert!(matches!(second, AllowanceError::ServiceUnavailable { .. }));
    assert!(second.is_retry_advisable());
    assert_eq!(backend.business_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_clients_do_not_share_state() {
    let down = Backend::new(|_| ApiResponse::new(503, json!({})));
    let up = Backend::new(|_| ApiResponse::ok(json!({})));
    let admin = client(&down);
    let parent = client(&up);

    let _ = admin.call(&RequestSpec::get("/api/ads")).await;
    assert_eq!(admin.breaker().state(), CircuitState::Open);

    parent.call(&RequestSpec::get("/api/ads")).await.unwrap();
    assert_eq!(parent.breaker().state(), CircuitState::Closed);
    assert_eq!(up.token_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_speculative_update_rolls_back() {
    let backend = Backend::new(|_| {
        ApiResponse::new(422, json!({"field": "title", "message": "Title is required"}))
    });
    let client = client(&backend);

    let ads = Arc::new(Mutex::new(vec!["Bike".to_string()]));
    let (add, undo) = (ads.clone(), ads.clone());
    let mut update = speculate(
        move || add.lock().unwrap().push(String::new()),
        move |_| {
            undo.lock().unwrap().pop();
        },
    );

    let err = client
        .call_speculative(&RequestSpec::post("/api/ads", json!({"title": ""})), &mut update)
        .await
        .unwrap_err();

    assert!(matches!(err, AllowanceError::Validation { ref field, .. } if field == "title"));
    assert_eq!(*ads.lock().unwrap(), vec!["Bike".to_string()]);
    // Validation errors are not retried.
    assert_eq!(backend.business_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cached_reads_invalidated_by_writes() {
    let backend = Backend::new(|request| match request.method {
        Method::Get => ApiResponse::ok(json!({"ads": ["Bike"]})),
        _ => ApiResponse::ok(json!({"ok": true})),
    });
    let client = client(&backend);
    let list = RequestSpec::get("/api/ads");

    client.get_cached(&list).await.unwrap();
    client.get_cached(&list).await.unwrap();
    assert_eq!(backend.business_calls().len(), 1);

    client
        .call(&RequestSpec::post("/api/ads", json!({"title": "Kite"})))
        .await
        .unwrap();
    client.get_cached(&list).await.unwrap();
    assert_eq!(backend.business_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_read_overlapping_a_write_is_not_cached() {
    let count = Arc::new(AtomicUsize::new(1));
    let ads = count.clone();
    let backend = Backend::with_read_latency(
        move |request| match request.method {
            Method::Get => ApiResponse::ok(json!({ "count": ads.load(Ordering::SeqCst) })),
            _ => {
                ads.fetch_add(1, Ordering::SeqCst);
                ApiResponse::ok(json!({"ok": true}))
            }
        },
        Duration::from_millis(500),
    );
    let client = client(&backend);
    client.session().get_token(false).await.unwrap();
    let list = RequestSpec::get("/api/ads");

    let (read, write) = tokio::join!(client.get_cached(&list), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
            .call(&RequestSpec::post("/api/ads", json!({"title": "Kite"})))
            .await
    });
    assert_eq!(read.unwrap().body["count"], 1);
    write.unwrap();

    let fresh = client.get_cached(&list).await.unwrap();
    assert_eq!(fresh.body["count"], 2);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(backend.business_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_call_json_decodes_body() {
    #[derive(serde::Deserialize)]
    struct Balance {
        balance: u32,
    }

    let backend = Backend::new(|_| ApiResponse::ok(json!({"balance": 75})));
    let client = client(&backend);

    let balance: Balance = client
        .call_json(&RequestSpec::get("/api/balance"))
        .await
        .unwrap();
    assert_eq!(balance.balance, 75);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_token_use() {
    let backend = Backend::new(|_| ApiResponse::ok(json!({})));
    let client = client(&backend);
    client.call(&RequestSpec::get("/api/ads")).await.unwrap();

    client.shutdown();
    let err = client
        .call(&RequestSpec::get("/api/ads"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllowanceError::Cancelled));
}
