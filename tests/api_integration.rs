//! Integration tests for the REST surface.
//!
//! Each test builds the real router over an in-memory database and the mock
//! carrier, then drives it with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use fax_desk::api::{AppState, routes};
use fax_desk::dispatch::{CoverSheetRenderer, DispatchLoop, MockTransport};
use fax_desk::store::{Database, LibSqlBackend};
use fax_desk::triage::{StaticOcrEngine, TriageService};

const REPAIR_TEXT: &str = "修繕依頼\n物件名：サンハイツ 203号室\n症状：エアコン故障\n至急お願いします";

async fn app_with(transport: MockTransport) -> Router {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let dispatch = DispatchLoop::new(
        Arc::clone(&db),
        Arc::new(transport),
        Arc::new(CoverSheetRenderer),
        Duration::from_secs(600),
    );
    let triage = TriageService::new(Arc::clone(&db), Arc::new(StaticOcrEngine::new(REPAIR_TEXT)));
    routes(AppState {
        store: db,
        dispatch: Arc::new(dispatch),
        triage: Arc::new(triage),
        retention_days: 90,
    })
}

async fn app() -> Router {
    app_with(MockTransport::succeeding()).await
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn immediate_outbound_is_sent() {
    let app = app().await;
    let (status, fax) = call(
        &app,
        Method::POST,
        "/api/outbound",
        Some(json!({
            "destination": "03-1234-5678",
            "document": { "title": "ご案内", "body": "資料を送付します", "fields": [] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(fax["status"], "success");

    let id = fax["id"].as_str().unwrap();
    let (status, fetched) = call(&app, Method::GET, &format!("/api/outbound/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["transport_id"], "mock-1");
}

#[tokio::test]
async fn scheduled_outbound_goes_out_on_sweep() {
    let app = app().await;
    let (status, fax) = call(
        &app,
        Method::POST,
        "/api/outbound",
        Some(json!({
            "destination": "0312345678",
            "document": { "title": "契約書送付", "body": "", "fields": [] },
            "scheduled_at": "2020-01-01T00:00:00Z"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(fax["status"], "scheduled");

    let (_, due) = call(&app, Method::GET, "/api/dispatch/due", None).await;
    assert_eq!(due["due"], 1);

    let (status, report) = call(&app, Method::POST, "/api/dispatch/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["considered"], 1);
    assert_eq!(report["outcomes"][0]["outcome"], "success");

    let (_, due) = call(&app, Method::GET, "/api/dispatch/due", None).await;
    assert_eq!(due["due"], 0);
}

#[tokio::test]
async fn failing_carrier_schedules_retry() {
    let app = app_with(MockTransport::failing()).await;
    let (status, fax) = call(
        &app,
        Method::POST,
        "/api/outbound",
        Some(json!({
            "destination": "0312345678",
            "document": { "title": "t", "body": "b", "fields": [] },
            "retry": { "enabled": true, "max_retries": 2, "interval_secs": 300 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(fax["status"], "scheduled");
    assert_eq!(fax["retry_count"], 1);
    assert!(fax["last_error"].as_str().unwrap().contains("simulated"));
}

#[tokio::test]
async fn outbound_errors_map_to_status_codes() {
    let app = app().await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/outbound",
        Some(json!({ "destination": "phone", "document": { "title": "t", "body": "b", "fields": [] } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let missing = uuid::Uuid::new_v4();
    let (status, _) = call(&app, Method::GET, &format!("/api/outbound/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::GET, "/api/outbound/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inbound_triage_end_to_end() {
    let app = app().await;

    let (status, company) = call(
        &app,
        Method::POST,
        "/api/companies",
        Some(json!({ "name": "青葉管理", "fax_number": "03-0000-1111" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, property) = call(
        &app,
        Method::POST,
        "/api/properties",
        Some(json!({ "name": "サンハイツ", "room_number": "203", "company_id": company["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/rules",
        Some(json!({
            "name": "修繕は管理部",
            "priority": 10,
            "conditions": [{ "type": "document_type", "value": "repair_request" }],
            "department": "管理部"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, fax) = call(
        &app,
        Method::POST,
        "/api/inbound",
        Some(json!({ "sender_number": "03-9999-0000" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = fax["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/inbound/{id}/ocr"))
        .header("content-type", "image/tiff")
        .body(Body::from(vec![0x49u8, 0x49, 0x2a, 0x00]))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, state) = call(&app, Method::POST, "/api/triage/run", Some(json!({ "fax_id": id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["fax"]["stage"], "routed");
    assert_eq!(state["fax"]["document_type"], "repair_request");
    assert_eq!(state["fax"]["urgency"], "high");
    assert_eq!(state["record"]["property_match"]["property_id"], property["id"]);
    assert_eq!(state["record"]["routing"]["department"], "管理部");

    let (status, _) = call(
        &app,
        Method::PATCH,
        &format!("/api/inbound/{id}/read"),
        Some(json!({ "read": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, state) = call(&app, Method::GET, &format!("/api/inbound/{id}"), None).await;
    assert_eq!(state["fax"]["read"], true);

    let (_, usage) = call(&app, Method::GET, "/api/usage/2020/1", None).await;
    assert_eq!(usage["received"], 0);
}

#[tokio::test]
async fn stateless_classify_match_and_extract() {
    let app = app().await;

    let (status, classification) = call(
        &app,
        Method::POST,
        "/api/triage/classify",
        Some(json!({ "text": "請求書\n御請求額: ¥132,000\n支払期限: 2024/5/31" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(classification["document_type"], "invoice");

    let (status, _) = call(&app, Method::POST, "/api/triage/classify", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, result) = call(
        &app,
        Method::POST,
        "/api/triage/match",
        Some(json!({ "property_name": "どこにもない" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["confidence"], 0.0);

    let (status, extracted) = call(
        &app,
        Method::POST,
        "/api/extract",
        Some(json!({ "text": "御請求額: ¥132,000", "document_type": "invoice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(extracted["fields"]["invoice_amount"], "132000");
}

#[tokio::test]
async fn rule_lifecycle() {
    let app = app().await;

    let (status, _) = call(&app, Method::POST, "/api/rules", Some(json!({ "name": "no target" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, rule) = call(
        &app,
        Method::POST,
        "/api/rules",
        Some(json!({ "name": "急ぎ", "priority": 5, "conditions": [{ "type": "urgency", "value": "high" }], "user_id": "tanaka" })),
    )
    .await;
    let id = rule["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        Method::PATCH,
        &format!("/api/rules/{id}/active"),
        Some(json!({ "active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, fetched) = call(&app, Method::GET, &format!("/api/rules/{id}"), None).await;
    assert_eq!(fetched["active"], false);

    let (_, rules) = call(&app, Method::GET, "/api/rules", None).await;
    assert_eq!(rules.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, &format!("/api/rules/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::DELETE, &format!("/api/rules/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn usage_and_prune() {
    let app = app().await;
    let (status, _) = call(&app, Method::GET, "/api/usage/2024/13", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, report) = call(&app, Method::POST, "/api/maintenance/prune?keep_days=30", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outbound"], 0);
    assert_eq!(report["inbound"], 0);

    let (status, body) = call(&app, Method::POST, "/api/maintenance/prune?keep_days=4000000000", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("keep_days"));
}

#[tokio::test]
async fn oversized_retry_interval_is_rejected() {
    let app = app().await;
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/outbound",
        Some(json!({
            "destination": "0312345678",
            "document": { "title": "t", "body": "b", "fields": [] },
            "retry": { "enabled": true, "max_retries": 3, "interval_secs": 10_000_000_000_000u64 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
