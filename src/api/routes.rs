//! REST endpoints for dispatch, triage, routing rules and the address book.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::directory::{Company, Property};
use crate::dispatch::DispatchLoop;
use crate::error::{DatabaseError, DispatchError, TriageError};
use crate::fax::model::{NewInboundFax, NewOutboundFax, OutboundPatch};
use crate::store::Database;
use crate::triage::classifier::{ClassifyMetadata, DocumentType};
use crate::triage::matcher::MatchQuery;
use crate::triage::router::{RouteTarget, RoutingRule, RuleCondition};
use crate::triage::service::TriageService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub dispatch: Arc<DispatchLoop>,
    pub triage: Arc<TriageService>,
    /// Default retention for the prune endpoint.
    pub retention_days: u32,
}

type Reply = (StatusCode, Json<Value>);

/// Build the REST router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/dispatch/sweep", post(run_sweep))
        .route("/api/dispatch/due", get(count_due))
        .route("/api/outbound", post(create_outbound))
        .route("/api/outbound/{id}", get(get_outbound).patch(update_outbound))
        .route("/api/outbound/{id}/send", post(send_outbound))
        .route("/api/inbound", post(ingest_inbound))
        .route("/api/inbound/{id}", get(get_inbound))
        .route("/api/inbound/{id}/ocr", post(recognize_inbound))
        .route("/api/inbound/{id}/read", patch(set_inbound_read))
        .route("/api/triage/classify", post(classify))
        .route("/api/triage/match", post(match_property))
        .route("/api/triage/route", post(route_fax))
        .route("/api/triage/run", post(run_triage))
        .route("/api/extract", post(extract))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", get(get_rule).delete(delete_rule))
        .route("/api/rules/{id}/active", patch(set_rule_active))
        .route("/api/companies", get(list_companies).post(create_company))
        .route("/api/properties", get(list_properties).post(create_property))
        .route("/api/usage/{year}/{month}", get(get_usage))
        .route("/api/maintenance/prune", post(prune))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn error_reply(status: StatusCode, message: impl Into<String>) -> Reply {
    (status, Json(json!({ "error": message.into() })))
}

fn parse_id(raw: &str) -> Result<Uuid, Reply> {
    Uuid::parse_str(raw).map_err(|_| error_reply(StatusCode::BAD_REQUEST, "Invalid ID"))
}

fn ok(value: impl Serialize) -> Reply {
    (StatusCode::OK, Json(serde_json::to_value(value).unwrap_or_default()))
}

fn created(value: impl Serialize) -> Reply {
    (StatusCode::CREATED, Json(serde_json::to_value(value).unwrap_or_default()))
}

fn database_reply(e: DatabaseError) -> Reply {
    match e {
        DatabaseError::NotFound { .. } => error_reply(StatusCode::NOT_FOUND, e.to_string()),
        other => {
            error!(error = %other, "Database operation failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn dispatch_reply(e: DispatchError) -> Reply {
    match e {
        DispatchError::NotFound { .. } => error_reply(StatusCode::NOT_FOUND, e.to_string()),
        DispatchError::Validation(_) => error_reply(StatusCode::BAD_REQUEST, e.to_string()),
        DispatchError::NotSendable { .. } | DispatchError::Conflict { .. } => {
            error_reply(StatusCode::CONFLICT, e.to_string())
        }
        DispatchError::Database(db) => database_reply(db),
        DispatchError::DueQuery(_) => {
            error!(error = %e, "Dispatch sweep aborted");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn triage_reply(e: TriageError) -> Reply {
    match e {
        TriageError::NotFound { .. } => error_reply(StatusCode::NOT_FOUND, e.to_string()),
        TriageError::Validation(_) => error_reply(StatusCode::BAD_REQUEST, e.to_string()),
        TriageError::Database(db) => database_reply(db),
        TriageError::Ocr(_) => {
            error!(error = %e, "OCR failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "fax-desk"
    }))
}

// ── Dispatch ────────────────────────────────────────────────────────────

async fn run_sweep(State(state): State<AppState>) -> Reply {
    match state.dispatch.run_sweep(Utc::now()).await {
        Ok(report) => ok(report),
        Err(e) => dispatch_reply(e),
    }
}

async fn count_due(State(state): State<AppState>) -> Reply {
    match state.dispatch.count_due(Utc::now()).await {
        Ok(due) => ok(json!({ "due": due })),
        Err(e) => dispatch_reply(e),
    }
}

async fn create_outbound(
    State(state): State<AppState>,
    Json(body): Json<NewOutboundFax>,
) -> Reply {
    match state.dispatch.create_outbound(body).await {
        Ok(fax) => created(fax),
        Err(e) => dispatch_reply(e),
    }
}

async fn get_outbound(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.dispatch.get_outbound(id).await {
        Ok(fax) => ok(fax),
        Err(e) => dispatch_reply(e),
    }
}

async fn update_outbound(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<OutboundPatch>,
) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.dispatch.update_outbound(id, patch).await {
        Ok(fax) => ok(fax),
        Err(e) => dispatch_reply(e),
    }
}

async fn send_outbound(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.dispatch.send_now(id).await {
        Ok(outcome) => ok(outcome),
        Err(e) => dispatch_reply(e),
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────

async fn ingest_inbound(
    State(state): State<AppState>,
    Json(body): Json<NewInboundFax>,
) -> Reply {
    match state.triage.ingest(body).await {
        Ok(fax) => created(fax),
        Err(e) => triage_reply(e),
    }
}

async fn get_inbound(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.triage.state(id).await {
        Ok(triage) => ok(triage),
        Err(e) => triage_reply(e),
    }
}

/// POST /api/inbound/{id}/ocr with the raw image as the request body.
async fn recognize_inbound(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.triage.recognize(id, &body).await {
        Ok(fax) => ok(fax),
        Err(e) => triage_reply(e),
    }
}

#[derive(Deserialize)]
struct ReadRequest {
    read: bool,
}

async fn set_inbound_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReadRequest>,
) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.triage.set_read(id, body.read).await {
        Ok(()) => ok(json!({ "id": id, "read": body.read })),
        Err(e) => triage_reply(e),
    }
}

// ── Triage ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ClassifyRequest {
    #[serde(default)]
    fax_id: Option<Uuid>,
    #[serde(default)]
    text: Option<String>,
    #[serde(flatten)]
    metadata: ClassifyMetadata,
}

/// Classify a stored fax (`fax_id`) or raw `text` with optional metadata.
async fn classify(State(state): State<AppState>, Json(body): Json<ClassifyRequest>) -> Reply {
    match (body.fax_id, body.text) {
        (Some(id), _) => match state.triage.classify(id).await {
            Ok(classification) => ok(classification),
            Err(e) => triage_reply(e),
        },
        (None, Some(text)) => ok(state.triage.classify_text(&text, &body.metadata)),
        (None, None) => error_reply(StatusCode::BAD_REQUEST, "fax_id or text is required"),
    }
}

#[derive(Deserialize)]
struct MatchRequest {
    #[serde(default)]
    fax_id: Option<Uuid>,
    #[serde(flatten)]
    query: MatchQuery,
}

async fn match_property(State(state): State<AppState>, Json(body): Json<MatchRequest>) -> Reply {
    let result = match body.fax_id {
        Some(id) => state.triage.match_property(id).await,
        None => state.triage.match_query(&body.query).await,
    };
    match result {
        Ok(result) => ok(result),
        Err(e) => triage_reply(e),
    }
}

#[derive(Deserialize)]
struct FaxRequest {
    fax_id: Uuid,
}

async fn route_fax(State(state): State<AppState>, Json(body): Json<FaxRequest>) -> Reply {
    match state.triage.route(body.fax_id).await {
        Ok(decision) => ok(decision),
        Err(e) => triage_reply(e),
    }
}

async fn run_triage(State(state): State<AppState>, Json(body): Json<FaxRequest>) -> Reply {
    match state.triage.run(body.fax_id).await {
        Ok(triage) => ok(triage),
        Err(e) => triage_reply(e),
    }
}

#[derive(Deserialize)]
struct ExtractRequest {
    text: String,
    #[serde(default)]
    document_type: Option<DocumentType>,
}

async fn extract(State(state): State<AppState>, Json(body): Json<ExtractRequest>) -> Reply {
    ok(state.triage.extract(&body.text, body.document_type))
}

// ── Routing rules ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateRuleRequest {
    name: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    conditions: Vec<RuleCondition>,
    #[serde(flatten)]
    target: RouteTarget,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

async fn list_rules(State(state): State<AppState>) -> Reply {
    match state.store.list_rules().await {
        Ok(rules) => ok(rules),
        Err(e) => database_reply(e),
    }
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> Reply {
    let mut rule = RoutingRule::new(body.name.trim(), body.priority, body.conditions, body.target);
    rule.active = body.active;
    if let Err(message) = rule.validate() {
        return error_reply(StatusCode::BAD_REQUEST, message);
    }
    match state.store.insert_rule(&rule).await {
        Ok(()) => created(rule),
        Err(e) => database_reply(e),
    }
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.store.get_rule(id).await {
        Ok(Some(rule)) => ok(rule),
        Ok(None) => error_reply(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => database_reply(e),
    }
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.store.delete_rule(id).await {
        Ok(true) => ok(json!({ "status": "deleted" })),
        Ok(false) => error_reply(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => database_reply(e),
    }
}

#[derive(Deserialize)]
struct ActiveRequest {
    active: bool,
}

async fn set_rule_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActiveRequest>,
) -> Reply {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    match state.store.set_rule_active(id, body.active).await {
        Ok(true) => ok(json!({ "id": id, "active": body.active })),
        Ok(false) => error_reply(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => database_reply(e),
    }
}

// ── Address book ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateCompanyRequest {
    name: String,
    #[serde(default)]
    fax_number: Option<String>,
}

async fn list_companies(State(state): State<AppState>) -> Reply {
    match state.store.list_companies().await {
        Ok(companies) => ok(companies),
        Err(e) => database_reply(e),
    }
}

async fn create_company(
    State(state): State<AppState>,
    Json(body): Json<CreateCompanyRequest>,
) -> Reply {
    if body.name.trim().is_empty() {
        return error_reply(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    let company = Company::new(body.name.trim(), body.fax_number);
    match state.store.insert_company(&company).await {
        Ok(()) => created(company),
        Err(e) => database_reply(e),
    }
}

#[derive(Deserialize)]
struct CreatePropertyRequest {
    name: String,
    #[serde(default)]
    room_number: Option<String>,
    #[serde(default)]
    company_id: Option<Uuid>,
}

async fn list_properties(State(state): State<AppState>) -> Reply {
    match state.store.list_properties().await {
        Ok(properties) => ok(properties),
        Err(e) => database_reply(e),
    }
}

async fn create_property(
    State(state): State<AppState>,
    Json(body): Json<CreatePropertyRequest>,
) -> Reply {
    if body.name.trim().is_empty() {
        return error_reply(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    let property = Property::new(body.name.trim(), body.room_number, body.company_id);
    match state.store.insert_property(&property).await {
        Ok(()) => created(property),
        Err(e) => database_reply(e),
    }
}

// ── Usage & retention ───────────────────────────────────────────────────

async fn get_usage(State(state): State<AppState>, Path((year, month)): Path<(i32, u32)>) -> Reply {
    if !(1..=12).contains(&month) {
        return error_reply(StatusCode::BAD_REQUEST, "month must be 1-12");
    }
    match state.store.get_usage(year, month).await {
        Ok(usage) => ok(usage),
        Err(e) => database_reply(e),
    }
}

#[derive(Deserialize)]
struct PruneParams {
    keep_days: Option<u32>,
}

/// POST /api/maintenance/prune?keep_days=N (defaults to the configured retention).
async fn prune(State(state): State<AppState>, Query(params): Query<PruneParams>) -> Reply {
    let keep_days = params.keep_days.unwrap_or(state.retention_days);
    let Some(cutoff) = chrono::Duration::try_days(i64::from(keep_days))
        .and_then(|keep| Utc::now().checked_sub_signed(keep))
    else {
        return error_reply(
            StatusCode::BAD_REQUEST,
            format!("keep_days {keep_days} reaches before the earliest representable date"),
        );
    };
    match state.store.prune_before(cutoff).await {
        Ok(report) => {
            if report.outbound + report.inbound > 0 {
                info!(keep_days, outbound = report.outbound, inbound = report.inbound, "Pruned old faxes");
            } else {
                debug!(keep_days, "Prune removed nothing");
            }
            ok(report)
        }
        Err(e) => database_reply(e),
    }
}
