//! HTTP front-end decoding remote calls into executor operations.
//!
//! Deliberately thin: every route unwraps the JSON body and the
//! `CallbackUri` header and delegates to [`RemoteExecutor`]. All behavior
//! lives in the executor.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::executor::{
    EndJobArgs, EndTaskArgs, PeekTaskOutputArgs, RemoteExecutor, StartJobAndTaskArgs,
    StartTaskArgs,
};
use crate::monitor::MetricCountersConfig;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<RemoteExecutor>,
}

pub fn router(executor: Arc<RemoteExecutor>) -> Router {
    Router::new()
        .route("/api/:node/startjobandtask", post(start_job_and_task))
        .route("/api/:node/starttask", post(start_task))
        .route("/api/:node/endjob", post(end_job))
        .route("/api/:node/endtask", post(end_task))
        .route("/api/:node/ping", post(ping))
        .route("/api/:node/metric", post(metric))
        .route("/api/:node/metricconfig", post(metric_config))
        .route("/api/:node/peekoutput", post(peek_output))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { executor })
}

/// Serve remote calls until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    executor: Arc<RemoteExecutor>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(executor);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Agent front-end listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn callback_uri(headers: &HeaderMap) -> String {
    headers
        .get("CallbackUri")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn respond(result: Result<serde_json::Value>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Remote call failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn start_job_and_task(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
    Json(args): Json<StartJobAndTaskArgs>,
) -> Response {
    respond(
        state
            .executor
            .start_job_and_task(args, callback_uri(&headers))
            .await,
    )
}

async fn start_task(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
    Json(args): Json<StartTaskArgs>,
) -> Response {
    respond(state.executor.start_task(args, callback_uri(&headers)).await)
}

async fn end_job(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    Json(args): Json<EndJobArgs>,
) -> Response {
    respond(state.executor.end_job(args).await)
}

async fn end_task(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
    Json(args): Json<EndTaskArgs>,
) -> Response {
    respond(state.executor.end_task(args, callback_uri(&headers)).await)
}

async fn ping(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
) -> Response {
    respond(state.executor.ping(callback_uri(&headers)).await)
}

async fn metric(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
) -> Response {
    respond(state.executor.metric(callback_uri(&headers)).await)
}

async fn metric_config(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    headers: HeaderMap,
    Json(config): Json<MetricCountersConfig>,
) -> Response {
    respond(
        state
            .executor
            .metric_config(config, callback_uri(&headers))
            .await,
    )
}

async fn peek_output(
    State(state): State<AppState>,
    Path(_node): Path<String>,
    Json(args): Json<PeekTaskOutputArgs>,
) -> Response {
    respond(state.executor.peek_task_output(args).await)
}
