//! HTTP Surface handlers (spec.md §4.8, §6.3) plus the read-only additions
//! from `SPEC_FULL.md` §4.9 (`/health`, `/peers`).
//!
//! Every endpoint except `/health` is leader-only: a non-leader node still
//! runs this router (so `/health` always answers), but every other handler
//! returns `403` with the last-known leader identifier rather than
//! processing the request, per spec.md §4.8.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use catalog_core::{CatalogEntry, NodeContext, NodeState};
use catalog_search::{PollOutcome, SearchBroker};
use catalog_storage::StorageClient;
use catalog_voting::VotingCore;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<NodeContext>,
    pub voting: Arc<VotingCore>,
    pub search: Arc<SearchBroker>,
    pub storage: StorageClient,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/upload", post(upload))
        .route("/search", post(search_init))
        .route("/search/:id", get(search_poll))
        .route("/status", get(status))
        .route("/documents", get(documents))
        .route("/download/:cid", get(download))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    node_state: NodeState,
    term: u64,
}

/// `GET /health` — unauthenticated liveness probe, answered by every node
/// regardless of leadership (`SPEC_FULL.md` §4.9).
async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        node_state: state.ctx.state(),
        term: state.ctx.term(),
    })
}

#[derive(Serialize)]
struct NotLeaderBody {
    error: &'static str,
    leader_id: Option<String>,
}

/// `403` with the last-known leader, the uniform response for every
/// leader-only endpoint reached on a non-leader node (spec.md §4.8).
fn not_leader(ctx: &NodeContext) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(NotLeaderBody { error: "not leader".into(), leader_id: ctx.leader_id() }),
    )
        .into_response()
}

#[derive(Serialize)]
struct PeerRow {
    peer_id: String,
}

/// `GET /peers` — leader-only live peer listing (`SPEC_FULL.md` §4.9).
async fn peers(State(state): State<AppState>) -> Response {
    if !state.ctx.is_leader() {
        return not_leader(&state.ctx);
    }
    let rows: Vec<PeerRow> = state.ctx.peers.peer_ids().into_iter().map(|peer_id| PeerRow { peer_id }).collect();
    Json(rows).into_response()
}

#[derive(Serialize)]
struct UploadBody {
    status: &'static str,
    doc_id: Uuid,
    filename: String,
    required_votes: usize,
    total_peers: usize,
}

/// `POST /upload` — multipart file upload, accepted only on the leader.
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    if !state.ctx.is_leader() {
        return not_leader(&state.ctx);
    }

    let mut filename = None;
    let mut bytes = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "malformed multipart upload");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        filename = field.file_name().map(|s| s.to_string()).or(filename);
        match field.bytes().await {
            Ok(data) => bytes = Some(data.to_vec()),
            Err(err) => {
                warn!(error = %err, "failed to read multipart upload body");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let (Some(filename), Some(bytes)) = (filename, bytes) else {
        return (StatusCode::BAD_REQUEST, "missing file field").into_response();
    };

    match state.voting.submit_upload(filename, bytes).await {
        Ok(ack) => Json(UploadBody {
            status: "pending_approval",
            doc_id: ack.doc_id,
            filename: ack.filename,
            required_votes: ack.required_votes,
            total_peers: ack.total_peers,
        })
        .into_response(),
        Err(catalog_core::CatalogError::PolicyFailure(_)) => not_leader(&state.ctx),
        Err(err) => {
            warn!(error = %err, "upload failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct SearchInitRequest {
    prompt: String,
    top_k: usize,
}

#[derive(Serialize)]
struct SearchInitBody {
    id: Uuid,
    token: Uuid,
}

/// `POST /search` — dispatch a similarity search, leader-only.
async fn search_init(State(state): State<AppState>, Json(req): Json<SearchInitRequest>) -> Response {
    if !state.ctx.is_leader() {
        return not_leader(&state.ctx);
    }
    let ack = state.search.init_search(req.prompt, req.top_k).await;
    Json(SearchInitBody { id: ack.search_id, token: ack.token }).into_response()
}

#[derive(Deserialize)]
struct SearchPollQuery {
    token: Uuid,
}

#[derive(Serialize)]
struct SearchPollBody {
    id: Uuid,
    results: Vec<catalog_core::SearchHit>,
}

#[derive(Serialize)]
struct SearchProcessingBody {
    status: &'static str,
}

/// `GET /search/{id}?token=...` — poll for a search's result, leader-only.
async fn search_poll(State(state): State<AppState>, Path(id): Path<Uuid>, Query(query): Query<SearchPollQuery>) -> Response {
    if !state.ctx.is_leader() {
        return not_leader(&state.ctx);
    }
    match state.search.poll(id, query.token).await {
        PollOutcome::Ready(hits) => Json(SearchPollBody { id, results: hits }).into_response(),
        PollOutcome::Processing => (StatusCode::ACCEPTED, Json(SearchProcessingBody { status: "processing" })).into_response(),
        PollOutcome::BadToken => StatusCode::FORBIDDEN.into_response(),
        PollOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Serialize)]
struct StatusBody {
    peer_id: String,
    node_state: NodeState,
    term: u64,
    leader_id: Option<String>,
    total_peers: usize,
    version_confirmed: u64,
    total_confirmed: usize,
    uptime_secs: u64,
}

/// `GET /status` — answered on every node, not just the leader: it is how a
/// client discovers who the leader currently is.
async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let (term, leader_id, version_confirmed, total_confirmed) = state.ctx.with_lock(|inner| {
        (inner.term, inner.leader_id.clone(), inner.catalog.version_confirmed, inner.catalog.documents_confirmed.len())
    });
    Json(StatusBody {
        peer_id: state.ctx.self_id.clone(),
        node_state: state.ctx.state(),
        term,
        leader_id,
        total_peers: state.ctx.peers.size(),
        version_confirmed,
        total_confirmed,
        uptime_secs: state.ctx.started_at.elapsed().as_secs(),
    })
}

/// `GET /documents` — the confirmed catalog listing.
async fn documents(State(state): State<AppState>) -> Json<Vec<CatalogEntry>> {
    Json(state.ctx.with_lock(|inner| inner.catalog.documents_confirmed.clone()))
}

/// `GET /download/{cid}` — proxy a confirmed document's bytes out of the
/// content-addressed storage layer.
async fn download(State(state): State<AppState>, Path(cid): Path<String>) -> Response {
    let known = state.ctx.with_lock(|inner| inner.catalog.contains_cid(&cid));
    if !known {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.storage.cat(&cid).await {
        Ok(bytes) => bytes.into_response(),
        Err(err) => {
            warn!(cid, error = %err, "download failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_bus::BusGateway;
    use catalog_core::{Catalog, HashingEmbedder};
    use catalog_storage::StorageClientConfig;
    use std::time::Duration;

    fn test_state() -> AppState {
        let storage = StorageClient::new(StorageClientConfig {
            base_url: "http://127.0.0.1:1/api/v0".to_string(),
            request_timeout: Duration::from_millis(50),
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(1),
        });
        let ctx = Arc::new(NodeContext::new("self".into(), Catalog::default(), Arc::new(HashingEmbedder::default())));
        let bus = Arc::new(BusGateway::new(storage.clone(), "test-topic"));
        let commit = Arc::new(catalog_commit_for_tests(Arc::clone(&ctx), Arc::clone(&bus), storage.clone()));
        let voting = Arc::new(VotingCore::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            commit,
            catalog_core::CatalogConfig::default().timing,
            "/tmp/catalog-api-tests-pending".into(),
        ));
        let search = Arc::new(SearchBroker::new(Arc::clone(&ctx), bus, catalog_core::CatalogConfig::default().timing));
        AppState { ctx, voting, search, storage }
    }

    fn catalog_commit_for_tests(
        ctx: Arc<NodeContext>,
        bus: Arc<BusGateway>,
        storage: StorageClient,
    ) -> catalog_commit::CommitCore {
        catalog_commit::CommitCore::new(
            ctx,
            bus,
            storage,
            catalog_commit::CommitPaths {
                catalog_path: "/tmp/catalog-api-tests/catalog.json".into(),
                embeddings_dir: "/tmp/catalog-api-tests/embeddings".into(),
                temp_embeddings_dir: "/tmp/catalog-api-tests/temp_embeddings".into(),
                index_path: "/tmp/catalog-api-tests/index.json".into(),
            },
        )
    }

    #[tokio::test]
    async fn non_leader_rejects_upload_style_endpoints() {
        let state = test_state();
        let response = search_init(State(state.clone()), Json(SearchInitRequest { prompt: "x".into(), top_k: 1 })).await;
        assert_eq!(response.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_answers_on_a_follower() {
        let state = test_state();
        let body = health(State(state)).await;
        assert_eq!(body.0.node_state, NodeState::Follower);
    }

    #[tokio::test]
    async fn status_reports_self_and_term() {
        let state = test_state();
        let body = status(State(state.clone())).await;
        assert_eq!(body.0.peer_id, "self");
        assert_eq!(body.0.total_peers, 1);
    }

    #[tokio::test]
    async fn download_of_unknown_cid_is_not_found() {
        let state = test_state();
        let response = download(State(state), Path("unknown".into())).await;
        assert_eq!(response.into_response().status(), StatusCode::NOT_FOUND);
    }
}
