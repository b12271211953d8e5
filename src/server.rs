//! HTTP surface: one-off slang lookups, stored slang queries and discovery
//! sessions driven over REST, plus an SSE feed of bucket events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::MetricsRegistry;
use crate::session::{DiscoverySession, SessionError, SessionRegistry, SessionSnapshot};
use crate::slang::{FetchError, SlangEntry, SlangSource, SourceMode, TermQuery};
use crate::stack::{RiskFilter, StackError};
use crate::store::{PersistenceError, SlangStore};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub slang: Arc<dyn SlangSource>,
    pub store: Arc<SlangStore>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unknown discovery session {0}")]
    UnknownSession(Uuid),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) | ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ApiError::Fetch(FetchError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Fetch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Session(SessionError::InvalidTransition { .. })
            | ApiError::Session(SessionError::NothingShown) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::Stack(StackError::Disposed)) => StatusCode::GONE,
            ApiError::Session(_) | ApiError::Persistence(_) | ApiError::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, status = status.as_u16(), "request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/slang/fetch", get(fetch_slang))
        .route("/api/slang", get(query_slang).post(save_slang))
        .route("/api/discovery", post(create_discovery))
        .route("/api/discovery/:id", get(get_discovery).delete(delete_discovery))
        .route("/api/discovery/:id/next", post(next_entry))
        .route("/api/discovery/:id/filter", post(set_filter))
        .route("/api/discovery/:id/source", post(set_source))
        .route("/api/discovery/:id/save", post(save_current))
        .route("/api/discovery/:id/events", get(discovery_events))
        .route("/api/metrics", get(metrics_summary))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

fn parse_source(raw: Option<&str>) -> Result<SourceMode, ApiError> {
    match raw {
        None => Ok(SourceMode::default()),
        Some(raw) => SourceMode::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown source {raw:?}"))),
    }
}

fn lookup_session(ctx: &AppContext, id: Uuid) -> Result<Arc<DiscoverySession>, ApiError> {
    ctx.sessions.get(&id).ok_or(ApiError::UnknownSession(id))
}

/// SQLite calls run on the blocking pool, off the runtime workers.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

// --- slang ---

#[derive(Debug, Deserialize)]
struct FetchParams {
    term: Option<String>,
    source: Option<String>,
}

async fn fetch_slang(
    State(ctx): State<AppContext>,
    Query(params): Query<FetchParams>,
) -> Result<Json<Value>, ApiError> {
    let mode = parse_source(params.source.as_deref())?;
    let term = TermQuery::from_param(params.term.as_deref());
    let entry = ctx.slang.fetch_one(&term, mode).await?;
    Ok(Json(json!({ "slang": entry })))
}

async fn save_slang(
    State(ctx): State<AppContext>,
    Json(entry): Json<SlangEntry>,
) -> Result<Json<Value>, ApiError> {
    entry
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let store = Arc::clone(&ctx.store);
    let stored = blocking(move || Ok(store.upsert_now(&entry)?)).await?;
    Ok(Json(json!({ "slang": stored, "saved": true })))
}

#[derive(Debug, Deserialize)]
struct SlangQuery {
    mode: Option<String>,
    id: Option<String>,
    limit: Option<usize>,
}

async fn query_slang(
    State(ctx): State<AppContext>,
    Query(params): Query<SlangQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&ctx.store);
    blocking(move || query_store(&store, params)).await.map(Json)
}

fn query_store(store: &SlangStore, params: SlangQuery) -> Result<Value, ApiError> {
    if let Some(id) = params.id {
        let stored = store
            .select_by_id(&id)?
            .ok_or_else(|| ApiError::NotFound(format!("no slang with id {id}")))?;
        return Ok(json!({ "slang": stored }));
    }

    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    match params.mode.as_deref().unwrap_or("random") {
        "random" => {
            let stored = store
                .select_random()?
                .ok_or_else(|| ApiError::NotFound("no stored slang yet".into()))?;
            Ok(json!({ "slang": stored }))
        }
        "trending" => Ok(json!({ "items": store.select_trending(limit)? })),
        "recent" => Ok(json!({ "items": store.select_recent(limit)? })),
        other => Err(ApiError::BadRequest(format!("unknown mode {other:?}"))),
    }
}

// --- discovery sessions ---

#[derive(Debug, Serialize)]
struct SessionBody {
    session_id: Uuid,
    #[serde(flatten)]
    snapshot: SessionSnapshot,
}

#[derive(Debug, Deserialize)]
struct SourceParams {
    source: Option<String>,
}

async fn create_discovery(
    State(ctx): State<AppContext>,
    Query(params): Query<SourceParams>,
) -> Result<Json<SessionBody>, ApiError> {
    let source = parse_source(params.source.as_deref())?;
    let (id, session) = ctx.sessions.create();
    match session.start(source).await {
        Ok(snapshot) => Ok(Json(SessionBody {
            session_id: id,
            snapshot,
        })),
        Err(e) => {
            ctx.sessions.remove(&id);
            Err(e.into())
        }
    }
}

async fn get_discovery(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(lookup_session(&ctx, id)?.snapshot()))
}

async fn next_entry(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(lookup_session(&ctx, id)?.next()))
}

#[derive(Debug, Deserialize)]
struct FilterBody {
    filter: String,
}

async fn set_filter(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<FilterBody>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let filter = RiskFilter::parse(&body.filter)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown filter {:?}", body.filter)))?;
    Ok(Json(lookup_session(&ctx, id)?.set_filter(filter)))
}

#[derive(Debug, Deserialize)]
struct SourceBody {
    source: String,
}

async fn set_source(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<SourceBody>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let source = parse_source(Some(&body.source))?;
    let session = lookup_session(&ctx, id)?;
    Ok(Json(session.set_source(source).await?))
}

async fn save_current(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let session = lookup_session(&ctx, id)?;
    let saved = blocking(move || Ok(session.save_current()?)).await?;
    Ok(Json(json!({ "phrase": saved })))
}

async fn delete_discovery(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if ctx.sessions.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::UnknownSession(id))
    }
}

async fn discovery_events(
    State(ctx): State<AppContext>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let rx = lookup_session(&ctx, id)?.manager().subscribe_events();
    debug!(session = %id, "event stream subscribed");

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => match Event::default().event(event.kind()).json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    warn!(error = %e, "failed to encode stack event");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "event stream lagged");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn metrics_summary(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.metrics.summary())
}
