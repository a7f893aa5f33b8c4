//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server, backed by the
//! in-memory engine collaborators.
//!
//! ```bash
//! cargo test -p herald-api --test integration
//! ```

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, TimeZone, Utc};
use chrono_tz::UTC;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use herald_api::forwarder::ReceiptForwarder;
use herald_api::middleware::rate_limit::{InMemoryHitCounter, RateLimiter, rate_limit};
use herald_api::routes::create_router;
use herald_api::state::AppState;
use herald_common::clock::ManualClock;
use herald_engine::blackout::BlackoutPolicy;
use herald_engine::pacing::{InMemoryPacingStore, PacingConfig, PacingCoordinator};
use herald_engine::queue::InMemoryDelayedQueue;
use herald_engine::receipts::ReceiptRecorder;
use herald_engine::scheduler::{BatchScheduler, SchedulingPolicy};
use herald_engine::settings::{InMemoryProviderSettings, ProviderSettings};
use herald_engine::store::InMemoryJobStore;

// ============================================================
// Helpers
// ============================================================

async fn build_app(customer: Uuid) -> Router {
    create_router(build_state(customer).await)
}

async fn build_state(customer: Uuid) -> AppState {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 17, 15, 0, 0).unwrap(),
    ));
    let jobs = Arc::new(InMemoryJobStore::new());
    let settings = Arc::new(InMemoryProviderSettings::new());
    settings
        .put(
            customer,
            ProviderSettings::ZApi {
                base_url: "https://api.z-api.io/instances/i/token/t".to_string(),
                client_token: "ct".to_string(),
            },
        )
        .await;

    let scheduler = BatchScheduler::new(
        SchedulingPolicy {
            request_tz: UTC,
            ..SchedulingPolicy::default()
        },
        BlackoutPolicy::unrestricted(UTC),
        Arc::new(PacingCoordinator::new(
            Arc::new(InMemoryPacingStore::new(clock.clone())),
            clock.clone(),
            PacingConfig::default(),
        )),
        jobs.clone(),
        Arc::new(InMemoryDelayedQueue::new(clock.clone(), Duration::minutes(2))),
        settings.clone(),
        clock,
    );

    let receipts = Arc::new(ReceiptRecorder::new(jobs.clone(), settings));
    AppState::new(Arc::new(scheduler), jobs, receipts)
}

/// Local listener that hands every JSON body it receives to the returned channel.
async fn spawn_receipt_listener() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route(
            "/receipts",
            axum::routing::post(
                |State(tx): State<mpsc::UnboundedSender<Value>>, axum::Json(body): axum::Json<Value>| async move {
                    let _ = tx.send(body);
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .with_state(tx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/receipts", addr), rx)
}

fn whatsapp(number: &str) -> Value {
    json!({
        "channel": "whatsapp",
        "country": "+55",
        "dd": "86",
        "number": number,
        "message": "Olá!"
    })
}

fn post(uri: &str, customer: Option<Uuid>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(customer) = customer {
        builder = builder.header("x-customer-id", customer.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, customer: Uuid) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-customer-id", customer.to_string())
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_app(Uuid::new_v4()).await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "herald-api");
}

// ============================================================
// Messages
// ============================================================

#[tokio::test]
async fn test_single_message_scheduled() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;

    let (status, body) = send(&app, post("/api/messages", Some(customer), &whatsapp("994873708"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["channel"], "whatsapp");
    assert!(body["delay_ms"].as_i64().unwrap() >= 1000);
}

#[tokio::test]
async fn test_single_message_validation_error() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;
    let mut input = whatsapp("994873708");
    input["number"] = json!("12");

    let (status, body) = send(&app, post("/api/messages", Some(customer), &input)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("number"));
}

#[tokio::test]
async fn test_missing_customer_header() {
    let app = build_app(Uuid::new_v4()).await;
    let (status, _) = send(&app, post("/api/messages", None, &whatsapp("994873708"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unconfigured_channel_is_unprocessable() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;
    let sms = json!({
        "channel": "sms",
        "country": "+55",
        "dd": "86",
        "number": "994873708",
        "message": "Oi"
    });

    let (status, body) = send(&app, post("/api/messages", Some(customer), &sms)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("sms"));
}

#[tokio::test]
async fn test_bulk_reports_per_item_failures() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;
    let body = json!({
        "data": [
            whatsapp("994873708"),
            { "channel": "whatsapp", "country": "+55", "message": "no number" },
            whatsapp("994873709"),
        ]
    });

    let (status, body) = send(&app, post("/api/messages/bulk", Some(customer), &body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["total"], 3);
    assert_eq!(body["processed"], 2);
    assert_eq!(body["failures"][0]["index"], 1);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_bulk_empty_and_oversized_rejected() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;

    let (status, _) = send(
        &app,
        post("/api/messages/bulk", Some(customer), &json!({ "data": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let data: Vec<Value> = (0..501).map(|_| whatsapp("994873708")).collect();
    let (status, body) = send(
        &app,
        post("/api/messages/bulk", Some(customer), &json!({ "data": data })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("500"));
}

// ============================================================
// Jobs
// ============================================================

#[tokio::test]
async fn test_job_lookup_scoped_to_customer() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;

    let (_, scheduled) = send(&app, post("/api/messages", Some(customer), &whatsapp("994873708"))).await;
    let job_id = scheduled["job_id"].as_str().unwrap().to_string();

    let (status, job) = send(&app, get(&format!("/api/jobs/{}", job_id), customer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "queued");
    assert_eq!(job["attempts"], 0);
    assert_eq!(job["request"]["recipient"]["number"], "994873708");

    let (status, _) = send(&app, get(&format!("/api/jobs/{}", job_id), Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get(&format!("/api/jobs/{}", Uuid::new_v4()), customer)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_jobs_with_limit() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;
    let body = json!({
        "data": [whatsapp("994873708"), whatsapp("994873709"), whatsapp("994873700")]
    });
    send(&app, post("/api/messages/bulk", Some(customer), &body)).await;

    let (status, jobs) = send(&app, get("/api/jobs?limit=2", customer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 2);

    let (_, jobs) = send(&app, get("/api/jobs", Uuid::new_v4())).await;
    assert!(jobs.as_array().unwrap().is_empty());
}

// ============================================================
// Delivery receipts
// ============================================================

#[tokio::test]
async fn test_receipt_attached_to_latest_whatsapp_job() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;

    let (_, scheduled) = send(&app, post("/api/messages", Some(customer), &whatsapp("994873708"))).await;
    let job_id = scheduled["job_id"].as_str().unwrap().to_string();

    let receipt = json!({ "phone": "558694873708", "instanceId": "i", "status": "READ" });
    let (status, body) = send(&app, post("/webhook-received", None, &receipt)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "ok");

    let (_, job) = send(&app, get(&format!("/api/jobs/{}", job_id), customer)).await;
    assert_eq!(job["received"], receipt);
}

#[tokio::test]
async fn test_receipt_for_unknown_instance_is_acknowledged() {
    let customer = Uuid::new_v4();
    let app = build_app(customer).await;

    let (_, scheduled) = send(&app, post("/api/messages", Some(customer), &whatsapp("994873708"))).await;
    let job_id = scheduled["job_id"].as_str().unwrap().to_string();

    let receipt = json!({ "phone": "558694873708", "instanceId": "someone-else" });
    let (status, _) = send(&app, post("/webhook-received", None, &receipt)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, job) = send(&app, get(&format!("/api/jobs/{}", job_id), customer)).await;
    assert!(job["received"].is_null());
}

#[tokio::test]
async fn test_receipt_forwarded_with_customer_context() {
    let customer = Uuid::new_v4();
    let (url, mut forwarded) = spawn_receipt_listener().await;
    let forwarder = ReceiptForwarder::new(url, std::time::Duration::from_secs(5)).unwrap();
    let app = create_router(build_state(customer).await.with_forwarder(forwarder));

    let receipt = json!({ "phone": "558694873708", "instanceId": "i", "status": "RECEIVED" });
    let (status, _) = send(&app, post("/webhook-received", None, &receipt)).await;
    assert_eq!(status, StatusCode::OK);

    let body = tokio::time::timeout(std::time::Duration::from_secs(5), forwarded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["status"], "RECEIVED");
    assert_eq!(body["customer_id"], customer.to_string());
    assert_eq!(body["provider"], "z_api");
    assert!(body.get("client_token").is_none());
}

// ============================================================
// Rate limiting
// ============================================================

#[tokio::test]
async fn test_rate_limit_per_real_ip() {
    let customer = Uuid::new_v4();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 17, 15, 0, 0).unwrap(),
    ));
    let limiter = Arc::new(RateLimiter::per_minute(
        Arc::new(InMemoryHitCounter::new(clock.clone())),
        clock,
        2,
    ));
    let app = build_app(customer)
        .await
        .layer(from_fn_with_state(limiter, rate_limit));

    let health = |ip: &str| {
        Request::builder()
            .uri("/health")
            .header("x-real-ip", ip)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(send(&app, health("203.0.113.7")).await.0, StatusCode::OK);
    assert_eq!(send(&app, health("203.0.113.7")).await.0, StatusCode::OK);

    let (status, body) = send(&app, health("203.0.113.7")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("retry"));

    assert_eq!(send(&app, health("203.0.113.8")).await.0, StatusCode::OK);
}
