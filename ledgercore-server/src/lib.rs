//! External interface glue: translates inbound HTTP requests into
//! [`ledgercore_core::Core`] calls and serializes its responses back out.
//! No auth, no CORS policy beyond permissive defaults, no rate limiting —
//! those stay outside the core — but every handler carries a tracing span
//! as ambient instrumentation.
//!
//! The write/read/verify/replay/proof operations as axum handlers, plus
//! `/health` and `/metrics`.

#![deny(unsafe_code)]

pub mod descriptors;
pub mod metrics;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ledgercore_core::{
    Core, CoreError, ProofRequest, ReadRequest, VerificationRequest, WriteRequest,
};
use ledgercore_journal::JournalOperation;
use ledgercore_ledger::{EventMetadata, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, instrument};
use uuid::Uuid;

/// Shared application state: a single process-wide [`Core`] handle, cloned
/// cheaply per request since every field inside it is already an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

impl AppState {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}

/// GET /health
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn route_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Error-to-HTTP-status mapping, keeping classification next to the error
/// instead of scattered across handlers.
fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
        CoreError::Conflict { .. } => StatusCode::CONFLICT,
        CoreError::Stale { .. } => StatusCode::OK,
        CoreError::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Cryptographic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Programming { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::UnknownEntityType(_) => StatusCode::BAD_REQUEST,
        CoreError::UnknownTenant(_) => StatusCode::NOT_FOUND,
    }
}

fn to_response(err: CoreError) -> (StatusCode, Json<ErrorBody>) {
    error!(error = %err, "request failed");
    let status = status_for(&err);
    let message = match status {
        StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
        _ => err.to_string(),
    };
    (status, Json(ErrorBody { error: message }))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// POST /write — spec §6 Inbound Write request.
#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub tenant: String,
    pub author: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: JournalOperation,
    pub payload: Value,
    #[serde(default)]
    pub vector_clock: ledgercore_clock::VectorClock,
    #[serde(default)]
    pub metadata: EventMetadata,
}

#[derive(Serialize)]
pub struct WriteAckBody {
    pub journal_entry_id: Uuid,
}

#[instrument(skip(state, body), fields(tenant = %body.tenant, entity_type = %body.entity_type))]
async fn route_write(State(state): State<AppState>, Json(body): Json<WriteBody>) -> impl IntoResponse {
    let result = state
        .core
        .write(WriteRequest {
            tenant: TenantId(body.tenant),
            author: body.author,
            entity_type: body.entity_type,
            entity_id: body.entity_id,
            operation: body.operation,
            payload: body.payload,
            vector_clock: body.vector_clock,
            metadata: body.metadata,
        })
        .await;
    match result {
        Ok(ack) => Ok(Json(WriteAckBody { journal_entry_id: ack.journal_entry_id })),
        Err(e) => Err(to_response(e)),
    }
}

/// GET /entities/:tenant/:entity_type — spec §6 Inbound Read request.
#[instrument(skip(state))]
async fn route_read(
    State(state): State<AppState>,
    Path((tenant, entity_type)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.core.read(ReadRequest { tenant: TenantId(tenant), entity_type }).await {
        Ok(rows) => Ok(Json(rows)),
        Err(e) => Err(to_response(e)),
    }
}

/// Query-string-free verification body (spec §6 Inbound Verification
/// request); both bounds default to the tenant's full range.
#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub tenant: String,
    #[serde(default)]
    pub start_seq: Option<u64>,
    #[serde(default)]
    pub end_seq: Option<u64>,
}

#[derive(Serialize)]
struct VerifyResponseBody {
    valid: bool,
    first_corruption: Option<u64>,
}

#[instrument(skip(state, body), fields(tenant = %body.tenant))]
async fn route_verify(State(state): State<AppState>, Json(body): Json<VerifyBody>) -> impl IntoResponse {
    let tenant = body.tenant.clone();
    let result = state
        .core
        .verify(VerificationRequest { tenant: TenantId(body.tenant), start_seq: body.start_seq, end_seq: body.end_seq })
        .await;
    match result {
        Ok(v) => {
            if !v.valid {
                metrics::INTEGRITY_ALERTS.with_label_values(&[&tenant, "chain_break"]).inc();
            }
            Ok(Json(VerifyResponseBody { valid: v.valid, first_corruption: v.first_corruption }))
        }
        Err(e) => Err(to_response(e)),
    }
}

/// GET /replay/:tenant/:entity_id — spec §6 Inbound Replay request.
#[derive(Serialize)]
struct ReplayResponseBody {
    state: Value,
    history: Vec<ledgercore_ledger::LedgerEvent>,
}

#[instrument(skip(state))]
async fn route_replay(State(state): State<AppState>, Path((tenant, entity_id)): Path<(String, String)>) -> impl IntoResponse {
    match state.core.replay(&TenantId(tenant), &entity_id).await {
        Ok(r) => Ok(Json(ReplayResponseBody { state: r.state, history: r.history })),
        Err(e) => Err(to_response(e)),
    }
}

/// GET /proof/:tenant/:event_id — spec §6 Inbound Proof request.
#[derive(Serialize)]
struct ProofResponseBody {
    root_hash: String,
    proof: Vec<ProofStepBody>,
    anchor_start: u64,
    anchor_end: u64,
}

#[derive(Serialize)]
struct ProofStepBody {
    sibling: String,
    sibling_is_left: bool,
}

#[instrument(skip(state))]
async fn route_proof(State(state): State<AppState>, Path((tenant, event_id)): Path<(String, Uuid)>) -> impl IntoResponse {
    match state.core.proof(ProofRequest { tenant: TenantId(tenant), event_id }).await {
        Ok(p) => Ok(Json(ProofResponseBody {
            root_hash: p.root_hash,
            proof: p
                .proof
                .into_iter()
                .map(|s| ProofStepBody { sibling: hex::encode(s.sibling), sibling_is_left: s.sibling_is_left })
                .collect(),
            anchor_start: p.containing_anchor.start_sequence,
            anchor_end: p.containing_anchor.end_sequence,
        })),
        Err(e) => Err(to_response(e)),
    }
}

/// Build the router exposing `/health`, `/metrics`, and the five inbound
/// operations of spec §6, all bound to `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/health", get(route_health))
        .route("/write", post(route_write))
        .route("/entities/:tenant/:entity_type", get(route_read))
        .route("/verify", post(route_verify))
        .route("/replay/:tenant/:entity_id", get(route_replay))
        .route("/proof/:tenant/:event_id", get(route_proof))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state)
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ledgercore_core::Config;
    use serde_json::json;
    use tower::ServiceExt;

    struct TxDescriptor;
    impl ledgercore_entity::EntityDescriptor for TxDescriptor {
        fn entity_type(&self) -> &'static str {
            "transaction"
        }
        fn validate(&self, value: &Value) -> ledgercore_entity::Result<()> {
            if value.get("amount").and_then(Value::as_f64).is_none() {
                return Err(ledgercore_entity::EntityError::Validation {
                    entity_type: "transaction".to_string(),
                    field: "amount".to_string(),
                    reason: "missing".to_string(),
                });
            }
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            journal_drain_interval: std::time::Duration::from_millis(30_000),
            journal_batch_size: 50,
            journal_max_retries: 5,
            anchor_interval: std::time::Duration::from_secs(86_400),
            vault_sweep_interval: std::time::Duration::from_secs(86_400),
            vault_master_secret: b"test-secret".to_vec(),
            tenant_parallelism: 4,
            quarantine_on_corruption: true,
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let core = Arc::new(Core::in_memory(vec![Box::new(TxDescriptor)], test_config()));
        let app = router(AppState::new(core));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn write_against_unknown_tenant_returns_404() {
        let core = Arc::new(Core::in_memory(vec![Box::new(TxDescriptor)], test_config()));
        let app = router(AppState::new(core));
        let body = json!({
            "tenant": "ghost",
            "author": "alice:dev1",
            "entity_type": "transaction",
            "entity_id": "tx1",
            "operation": "CREATE",
            "payload": {"amount": 100},
            "vector_clock": {"alice:dev1": 1}
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
