use std::convert::Infallible;

use axum::{
    Form, Json, Router,
    body::Body,
    extract::State,
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use panel_process::ServerStatus;
use panel_supervisor::{CommandInvocation, OutputStream, SpawnSpec, StartOutcome, StopOutcome};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::security;
use crate::start_args::StartServerForm;
use crate::state::AppState;

pub const ALREADY_RUNNING: &str = "sorry, server is already running";
pub const NOT_RUNNING: &str = "sorry, server is not running";
const SAVE_NAME_REQUIRED: &str = "You must specify a save name";

fn stream_response(output: OutputStream) -> Response {
    let body = Body::from_stream(output.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            // Keeps browsers from buffering the stream to sniff it.
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

fn run_command(state: &AppState, args: Vec<String>) -> Result<Response, ApiError> {
    let output = CommandInvocation::new(state.config.executable.clone(), args)
        .with_timeout(state.config.command_timeout)
        .run()?;
    Ok(stream_response(output))
}

async fn version(State(state): State<AppState>) -> Result<Response, ApiError> {
    run_command(&state, vec!["--version".to_string()])
}

async fn start_server(
    State(state): State<AppState>,
    Form(form): Form<StartServerForm>,
) -> Result<Response, ApiError> {
    let args = form.translate()?;
    let port = args.port.unwrap_or(state.config.default_game_port);
    let spec = SpawnSpec::new(state.config.executable.clone(), args.argv);

    match state.slot.start(&spec, port).await? {
        StartOutcome::Started { status, output } => {
            tracing::info!(save = %args.save_name, port, process_id = %status.id, "server start requested");
            Ok(stream_response(output))
        }
        StartOutcome::AlreadyRunning(_) => Ok(ALREADY_RUNNING.into_response()),
    }
}

async fn stop_server(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.slot.stop().await? {
        StopOutcome::Stopping { output, .. } => Ok(stream_response(output)),
        StopOutcome::NotRunning => Ok(NOT_RUNNING.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSaveForm {
    #[serde(rename = "saveName")]
    save_name: Option<String>,
}

async fn create_save(
    State(state): State<AppState>,
    Form(form): Form<CreateSaveForm>,
) -> Result<Response, ApiError> {
    let save_name = form
        .save_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('-'))
        .ok_or_else(|| ApiError::BadRequest(SAVE_NAME_REQUIRED.to_string()))?;

    run_command(&state, vec!["--create".to_string(), save_name.to_string()])
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    server: Option<ServerStatus>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let server = state.slot.status().await;
    Json(StatusResponse {
        running: server.is_some(),
        server,
    })
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/version", get(version))
        .route("/status", get(status))
        .route("/start-server", post(start_server))
        .route("/stop-server", post(stop_server))
        .route("/create-save", post(create_save))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::admin_gate,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(admin)
        .layer(middleware::from_fn(security::access_log))
        .with_state(state)
}
