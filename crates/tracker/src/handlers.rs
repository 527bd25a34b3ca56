//! HTTP surface of the tracker
//!
//! Thin JSON wrappers over [`Tracker`](tracker_core::Tracker). Every handler
//! builds a [`RequestContext`] with the configured deadline, calls one
//! tracker operation and maps the result.
//!
//! ## Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/providers` | GET | List registered providers |
//! | `/providers` | POST | Register a provider |
//! | `/providers/choose` | GET | Choose `?num=` providers |
//! | `/providers/:id` | GET | Provider lookup |
//! | `/providers/:id` | DELETE | Mark provider removed |
//! | `/providers/:id/capacity` | POST | Add a capacity grant |
//! | `/placement/decide` | POST | Upload negotiation |
//! | `/placement/finalize` | POST | Record realized block layout |
//! | `/files/:id/release` | POST | Drop one reference to a file |
//! | `/folders` | POST | Create a folder |
//! | `/versions/:owner` | GET | Version history of a file entry |
//! | `/integrity/miss` | POST | Block loss report |
//! | `/integrity/action-log` | POST | Transfer receipts |
//! | `/tasks/:provider` | GET | Pending tasks of a provider |
//! | `/tasks/:provider/:task/finish` | POST | Complete a task |
//! | `/availability/sample` | POST | Probe result |
//! | `/availability/sweep` | POST | Run the window sweep now |
//! | `/availability/:provider/:day` | GET | Stored downtime windows |
//!
//! Outcome endpoints always answer `200` with `{ "code": .., "outcome": .. }`.
//! Only infrastructure failures map to error statuses.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use tracker_common::{unix_now, Day, FileId, NodeId, OwnerId, TaskId, Timestamp};
use tracker_core::model::{AvailabilitySample, BlockMiss};
use tracker_core::{ActionLogEntry, FinalizeRequest, PlacementRequest, Tracker, TrackerError};

// AppState is defined in main.rs
use super::AppState;

type Reply = (StatusCode, Json<Value>);

// ════════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct RegisterProviderReq {
    /// Hex-encoded public key.
    pub public_key: String,
    pub addr: String,
    #[serde(default)]
    pub capacity: u64,
}

#[derive(Debug, Deserialize)]
pub struct CapacityReq {
    pub bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChooseQuery {
    pub num: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FolderReq {
    pub client: NodeId,
    #[serde(default)]
    pub path: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MissReq {
    pub provider: NodeId,
    pub blocks: Vec<BlockMiss>,
    pub reported_at: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
pub struct ActionLogReq {
    pub reporter: NodeId,
    pub entries: Vec<ActionLogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FinishTaskReq {
    pub success: bool,
    #[serde(default)]
    pub remark: Option<String>,
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn ok(value: Value) -> Reply {
    (StatusCode::OK, Json(value))
}

fn bad_request(msg: impl std::fmt::Display) -> Reply {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.to_string() })))
}

fn not_found(what: &str) -> Reply {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{} not found", what) })))
}

fn internal(msg: impl std::fmt::Display) -> Reply {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg.to_string() })))
}

fn error_reply(e: TrackerError) -> Reply {
    let status = match &e {
        TrackerError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        TrackerError::UnknownProvider(_) | TrackerError::UnknownTask(_) => StatusCode::NOT_FOUND,
        TrackerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        TrackerError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn parse_node(raw: &str) -> Result<NodeId, Reply> {
    raw.parse::<NodeId>().map_err(bad_request)
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!({}))
}

/// Runs one tracker operation on the blocking pool.
///
/// Tracker calls hold the repository lock for a whole transaction, so they
/// never run on the async workers.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, Reply>
where
    F: FnOnce(&Tracker) -> tracker_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let tracker = state.tracker.clone();
    match tokio::task::spawn_blocking(move || op(tracker.as_ref())).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_reply(e)),
        Err(e) => Err(internal(e)),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PROVIDERS
// ════════════════════════════════════════════════════════════════════════════

async fn list_providers(State(state): State<Arc<AppState>>) -> Reply {
    match blocking(&state, |t| t.list_providers()).await {
        Ok(providers) => ok(to_json(&providers)),
        Err(r) => r,
    }
}

async fn register_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterProviderReq>,
) -> Reply {
    let key = match hex::decode(&req.public_key) {
        Ok(k) if !k.is_empty() => k,
        _ => return bad_request("public_key must be non-empty hex"),
    };
    let ctx = state.tracker.context();
    let op =
        move |t: &Tracker| t.register_provider(&ctx, &key, &req.addr, req.capacity, unix_now());
    match blocking(&state, op).await {
        Ok(p) => ok(to_json(&p)),
        Err(r) => r,
    }
}

async fn choose_providers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ChooseQuery>,
) -> Reply {
    let num = q.num.unwrap_or(state.tracker.config().replica_count);
    match blocking(&state, move |t| t.choose_providers(num)).await {
        Ok(providers) => ok(to_json(&providers)),
        Err(r) => r,
    }
}

async fn get_provider(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Reply {
    let id = match parse_node(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state, move |t| t.get_provider(&id)).await {
        Ok(Some(p)) => ok(to_json(&p)),
        Ok(None) => not_found("provider"),
        Err(r) => r,
    }
}

async fn remove_provider(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Reply {
    let id = match parse_node(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.remove_provider(&ctx, &id)).await {
        Ok(()) => ok(json!({ "ok": true })),
        Err(r) => r,
    }
}

async fn add_capacity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CapacityReq>,
) -> Reply {
    let id = match parse_node(&id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.add_capacity(&ctx, &id, req.bytes, unix_now())).await {
        Ok(()) => ok(json!({ "ok": true })),
        Err(r) => r,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PLACEMENT
// ════════════════════════════════════════════════════════════════════════════

async fn decide_placement(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlacementRequest>,
) -> Reply {
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.decide_placement(&ctx, &req)).await {
        Ok(outcome) => ok(json!({ "code": outcome.code(), "outcome": to_json(&outcome) })),
        Err(r) => r,
    }
}

async fn finalize_placement(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinalizeRequest>,
) -> Reply {
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.finalize_placement(&ctx, &req)).await {
        Ok(outcome) => ok(json!({ "code": outcome.code(), "outcome": to_json(&outcome) })),
        Err(r) => r,
    }
}

async fn release_file(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Reply {
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.release_file(&ctx, FileId(id))).await {
        Ok(outcome) => ok(json!({ "code": outcome.code(), "outcome": to_json(&outcome) })),
        Err(r) => r,
    }
}

async fn make_folder(State(state): State<Arc<AppState>>, Json(req): Json<FolderReq>) -> Reply {
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.make_folder(&ctx, &req.client, &req.path, &req.name)).await {
        Ok(outcome) => ok(to_json(&outcome)),
        Err(r) => r,
    }
}

async fn list_versions(State(state): State<Arc<AppState>>, Path(owner): Path<u64>) -> Reply {
    match blocking(&state, move |t| t.list_versions(OwnerId(owner))).await {
        Ok(versions) => ok(to_json(&versions)),
        Err(r) => r,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// INTEGRITY
// ════════════════════════════════════════════════════════════════════════════

async fn report_miss(State(state): State<Arc<AppState>>, Json(req): Json<MissReq>) -> Reply {
    let ctx = state.tracker.context();
    let at = req.reported_at.unwrap_or_else(unix_now);
    let op = move |t: &Tracker| t.report_block_miss(&ctx, &req.provider, &req.blocks, at);
    match blocking(&state, op).await {
        Ok(summary) => ok(to_json(&summary)),
        Err(r) => r,
    }
}

async fn ingest_action_log(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActionLogReq>,
) -> Reply {
    let ctx = state.tracker.context();
    let op = move |t: &Tracker| t.ingest_action_log(&ctx, &req.reporter, &req.entries, unix_now());
    match blocking(&state, op).await {
        Ok(summary) => ok(to_json(&summary)),
        Err(r) => r,
    }
}

async fn pending_tasks(State(state): State<Arc<AppState>>, Path(provider): Path<String>) -> Reply {
    let provider = match parse_node(&provider) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state, move |t| t.pending_tasks(&provider, unix_now())).await {
        Ok(tasks) => ok(to_json(&tasks)),
        Err(r) => r,
    }
}

async fn finish_task(
    State(state): State<Arc<AppState>>,
    Path((provider, task)): Path<(String, u64)>,
    Json(req): Json<FinishTaskReq>,
) -> Reply {
    let provider = match parse_node(&provider) {
        Ok(id) => id,
        Err(r) => return r,
    };
    let ctx = state.tracker.context();
    let op =
        move |t: &Tracker| t.finish_task(&ctx, TaskId(task), &provider, req.success, req.remark);
    match blocking(&state, op).await {
        Ok(true) => ok(json!({ "ok": true })),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "task not assigned to provider or already finished" })),
        ),
        Err(r) => r,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// AVAILABILITY
// ════════════════════════════════════════════════════════════════════════════

async fn record_sample(
    State(state): State<Arc<AppState>>,
    Json(sample): Json<AvailabilitySample>,
) -> Reply {
    let ctx = state.tracker.context();
    match blocking(&state, move |t| t.record_sample(&ctx, sample)).await {
        Ok(()) => ok(json!({ "ok": true })),
        Err(r) => r,
    }
}

async fn run_sweep(State(state): State<Arc<AppState>>) -> Reply {
    match blocking(&state, |t| t.run_sweep(unix_now())).await {
        Ok(report) => ok(to_json(&report)),
        Err(r) => r,
    }
}

async fn na_windows(
    State(state): State<Arc<AppState>>,
    Path((provider, day)): Path<(String, Day)>,
) -> Reply {
    let provider = match parse_node(&provider) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match blocking(&state, move |t| t.get_na_windows(&provider, day)).await {
        Ok(Some(windows)) => ok(to_json(&windows)),
        Ok(None) => not_found("swept day"),
        Err(r) => r,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ROUTER
// ════════════════════════════════════════════════════════════════════════════

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/providers", get(list_providers).post(register_provider))
        .route("/providers/choose", get(choose_providers))
        .route("/providers/:id", get(get_provider).delete(remove_provider))
        .route("/providers/:id/capacity", post(add_capacity))
        .route("/placement/decide", post(decide_placement))
        .route("/placement/finalize", post(finalize_placement))
        .route("/files/:id/release", post(release_file))
        .route("/folders", post(make_folder))
        .route("/versions/:owner", get(list_versions))
        .route("/integrity/miss", post(report_miss))
        .route("/integrity/action-log", post(ingest_action_log))
        .route("/tasks/:provider", get(pending_tasks))
        .route("/tasks/:provider/:task/finish", post(finish_task))
        .route("/availability/sample", post(record_sample))
        .route("/availability/sweep", post(run_sweep))
        .route("/availability/:provider/:day", get(na_windows))
        .with_state(state)
}
