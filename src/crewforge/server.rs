//! HTTP surface of the workflow engine.
//!
//! Four endpoints mirror the engine contract:
//!
//! - `POST /workflows` — validate and schedule a workflow (optionally
//!   blocking until it finishes).
//! - `GET /workflows/{id}` — bounded status snapshot.
//! - `GET /workflows/{id}/events` — server-sent event stream, optionally
//!   filtered with `?kind=agent_message,warning`.  The stream closes after
//!   the final `workflow_status` event.
//! - `POST /workflows/{id}/publish` — upload a completed project.
//!
//! Plus a read-only `GET /models` listing the registered model ids.
//! Validation failures come back as `422` with a structured
//! `{ code, field, message }` body.

use crate::crewforge::engine::{Engine, EngineError};
use crate::crewforge::event::WorkflowEvent;
use crate::crewforge::publisher::Visibility;
use crate::crewforge::workflow::WorkflowRequest;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;

/// Build the engine's router.  The engine handle is the shared state.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/workflows", post(submit_workflow))
        .route("/workflows/{id}", get(workflow_status))
        .route("/workflows/{id}/events", get(workflow_events))
        .route("/workflows/{id}/publish", post(publish_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/models", get(list_models))
        .with_state(engine)
}

/// Bind and serve until the process is stopped.
pub async fn serve(engine: Engine, addr: SocketAddr) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    log::info!("crewforge::server: listening on {}", local);
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

async fn submit_workflow(
    State(engine): State<Engine>,
    Json(request): Json<WorkflowRequest>,
) -> impl IntoResponse {
    match engine.submit(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => (StatusCode::UNPROCESSABLE_ENTITY, Json(err)).into_response(),
    }
}

async fn workflow_status(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.status(&id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => not_found(&id),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    /// Comma-separated event kinds to keep, e.g. `agent_message,warning`.
    kind: Option<String>,
}

async fn workflow_events(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> axum::response::Response {
    let kinds: Option<HashSet<String>> = query.kind.map(|raw| {
        raw.split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    });

    let stream = match engine.subscribe(&id, kinds).await {
        Some(stream) => stream,
        None => return not_found(&id),
    };

    let sse_stream = stream.map(|event: WorkflowEvent| {
        let sse = Event::default().event(event.kind());
        Ok::<Event, Infallible>(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(e) => Event::default()
                .event("warning")
                .data(format!("serialization failure: {}", e)),
        })
    });

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Deserialize)]
struct PublishBody {
    visibility: Visibility,
}

async fn publish_workflow(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(body): Json<PublishBody>,
) -> impl IntoResponse {
    match engine.publish(&id, body.visibility).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            let status = match &err {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::NotCompleted { .. } => StatusCode::CONFLICT,
                EngineError::PublisherUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::NoProject(_) => StatusCode::CONFLICT,
                EngineError::Publish(_) | EngineError::Store(_) => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({ "code": err.code(), "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn cancel_workflow(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if engine.cancel(&id).await {
        (StatusCode::ACCEPTED, Json(json!({ "cancelling": true }))).into_response()
    } else {
        not_found(&id)
    }
}

async fn list_models(State(engine): State<Engine>) -> impl IntoResponse {
    let models = engine.client_factory().model_ids();
    (StatusCode::OK, Json(json!({ "models": models }))).into_response()
}

fn not_found(id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "code": "not_found",
            "message": format!("workflow '{}' not found", id),
        })),
    )
        .into_response()
}
