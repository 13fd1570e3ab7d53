use crate::connector::WireResponder;
use crate::http::client::PEER_HEADER;
use crate::error::{Error, Result};
use crate::storage::{ChangeFeed, GraphAdapter};
use crate::types::{GetOpts, GraphData, Message, Node};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

#[derive(Clone)]
pub struct AppState {
    adapter: Arc<dyn GraphAdapter>,
    /// Answers reads from peers. Serving those through a federated adapter
    /// would pull back from the asking peer.
    local: Option<Arc<dyn GraphAdapter>>,
    responder: WireResponder,
    keepalive: Duration,
}

impl AppState {
    pub fn new(adapter: Arc<dyn GraphAdapter>, keepalive: Duration) -> Self {
        Self {
            responder: WireResponder::new(Arc::clone(&adapter)),
            adapter,
            local: None,
            keepalive,
        }
    }

    pub fn with_local(mut self, local: Arc<dyn GraphAdapter>) -> Self {
        self.local = Some(local);
        self
    }

    fn reader(&self, headers: &HeaderMap) -> &Arc<dyn GraphAdapter> {
        match &self.local {
            Some(local) if headers.contains_key(PEER_HEADER) => local,
            _ => &self.adapter,
        }
    }
}

/// Error surfaced by a handler, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Protocol(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Rejected(_) => StatusCode::FORBIDDEN,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Remote { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request refused: {}", self.0);
        }

        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/nodes", put(put_nodes))
        .route("/nodes/{*soul}", get(get_node))
        .route("/key/{key}/from_node/{*soul}", get(get_key))
        .route("/keys/from/{from}/to/{to}/from_node/{*soul}", get(get_range))
        .route("/keys/from/{from}/from_node/{*soul}", get(get_from))
        .route("/keys/to/{to}/from_node/{*soul}", get(get_to))
        .route("/changelog", get(changelog))
        .route("/wire", post(wire))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Serving HTTP");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn node_response(node: Option<Node>) -> Response {
    match node {
        Some(node) => Json(node).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::Value::Null)).into_response(),
    }
}

async fn read(
    state: &AppState,
    headers: &HeaderMap,
    soul: &str,
    opts: Option<GetOpts>,
) -> std::result::Result<Response, ApiError> {
    if let Some(peer) = headers.get(PEER_HEADER).and_then(|v| v.to_str().ok()) {
        trace!(peer = %peer, soul = %soul, "Peer read");
    }
    let node = state.reader(headers).get(soul, opts.as_ref()).await?;
    Ok(node_response(node))
}

async fn get_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(soul): Path<String>,
) -> std::result::Result<Response, ApiError> {
    read(&state, &headers, &soul, None).await
}

async fn get_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((key, soul)): Path<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    read(&state, &headers, &soul, Some(GetOpts::single(key))).await
}

async fn get_range(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((from, to, soul)): Path<(String, String, String)>,
) -> std::result::Result<Response, ApiError> {
    read(&state, &headers, &soul, Some(GetOpts::range(Some(from), Some(to)))).await
}

async fn get_from(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((from, soul)): Path<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    read(&state, &headers, &soul, Some(GetOpts::range(Some(from), None))).await
}

async fn get_to(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((to, soul)): Path<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    read(&state, &headers, &soul, Some(GetOpts::range(None, Some(to)))).await
}

async fn put_nodes(
    State(state): State<AppState>,
    Json(graph): Json<GraphData>,
) -> std::result::Result<Json<GraphData>, ApiError> {
    let diff = state.adapter.put(&graph).await?;
    Ok(Json(diff.unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct ChangelogQuery {
    #[serde(rename = "lastId")]
    last_id: Option<String>,
}

async fn changelog(
    State(state): State<AppState>,
    Query(query): Query<ChangelogQuery>,
    headers: HeaderMap,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>, ApiError> {
    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_id)
        .filter(|key| !key.is_empty());

    let feed = state.adapter.on_change(resume.as_deref())?;
    debug!(from = ?resume, "Streaming changelog");

    let events = stream::unfold(feed, |mut feed: ChangeFeed| async move {
        let entry = feed.recv().await?;
        let event = Event::default().id(entry.key).json_data(&entry.diff);
        Some((event, feed))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keepalive).text("ping")))
}

async fn wire(State(state): State<AppState>, body: String) -> Json<Vec<Message>> {
    Json(state.responder.handle_frame(&body).await)
}
