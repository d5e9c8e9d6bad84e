use crate::pipeline::{PipelineServices, StateMachine};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tokio::{signal, sync::mpsc};

/// Frames buffered between the pipeline thread and the response body.
const FRAME_BUFFER: usize = 16;

#[derive(Clone)]
struct SharedState {
    services: PipelineServices,
    machine: Arc<StateMachine>,
}

/// One server-sent event frame.
pub fn frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// Frame closing every stream.
pub fn end_frame() -> String {
    frame(&json!({"type": "end"}))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down, waiting for open streams to finish");
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/workflow/stream", post(workflow_stream))
        .route("/api/health", get(health))
        .layer(tower_http::set_header::SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn start_app(services: PipelineServices, listen: String) -> anyhow::Result<()> {
    let state = SharedState {
        services,
        machine: Arc::new(StateMachine::default()),
    };

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(services: PipelineServices, listen: String) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(services, listen))
}

#[derive(Debug, thiserror::Error)]
enum HttpError {
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": self.to_string()})),
            ),
        }
        .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    pub question: String,
}

async fn workflow_stream(
    State(state): State<SharedState>,
    Json(payload): Json<WorkflowRequest>,
) -> Result<Response, HttpError> {
    let question = payload.question.trim().to_string();
    if question.is_empty() {
        return Err(HttpError::BadRequest("question must not be empty".to_string()));
    }
    log::info!("workflow request: {question:?}");

    let (tx, rx) = mpsc::channel::<String>(FRAME_BUFFER);

    // each run gets its own blocking thread and browser session
    tokio::task::spawn_blocking(move || {
        let ctx = state.machine.run(&state.services, &question, |event| {
            if tx.blocking_send(frame(&event.to_json())).is_err() {
                log::debug!("client went away during {}", event.stage.name());
            }
        });
        if tx.blocking_send(end_frame()).is_err() {
            log::debug!("client went away before the end frame");
        }
        log::info!(
            "workflow finished with {} messages",
            ctx.messages.len()
        );
    });

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|f| (Ok::<_, Infallible>(f), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    let retrieval = &state.services.retrieval;
    Json(json!({
        "status": "ok",
        "index_ready": retrieval.is_ready(),
        "indexed_chunks": retrieval.indexed_count(),
    }))
}
