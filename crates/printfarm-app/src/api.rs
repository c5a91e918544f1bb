// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dashboard HTTP API.
//
// | Method | Path                          | Result              |
// |--------|-------------------------------|---------------------|
// | GET    | /printFarm/queue              | 200 jobs (JSON)     |
// | GET    | /printFarm/printers           | 200 printers (JSON) |
// | PUT    | /printFarm/job?filename=      | 201 / 400           |
// | DELETE | /printFarm/job?index=         | 204 / 400           |
// | POST   | /printFarm/{pause,resume,cancel,repeat}?index= | 204 / 400 |
// | POST   | /printFarm/cleanUp            | 204                 |
// | PUT    | /printFarm/printer?hostname=  | 204 / 400           |
// | DELETE | /printFarm/printer?hostname=  | 204 / 400           |
// | POST   | /printFarm/{suspend,resume}Printer?hostname= | 204 / 400 |
// | GET    | /machine/file/{path}          | 200 / 404           |
// | PUT    | /machine/file/{path}          | 201                 |
//
// Unexpected failures answer 500 with the error message as the body.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, warn};

use printfarm_core::error::FarmError;
use printfarm_core::types::{Job, Printer};
use tokio::sync::oneshot;

use crate::services::app_services::AppServices;

/// Build the API router.
pub fn router(services: AppServices) -> Router {
    Router::new()
        .route("/printFarm/queue", get(queue))
        .route("/printFarm/printers", get(printers))
        .route("/printFarm/job", put(add_job).delete(remove_job))
        .route("/printFarm/pause", post(pause_job))
        .route("/printFarm/resume", post(resume_job))
        .route("/printFarm/cancel", post(cancel_job))
        .route("/printFarm/repeat", post(repeat_job))
        .route("/printFarm/cleanUp", post(clean_up))
        .route("/printFarm/printer", put(add_printer).delete(remove_printer))
        .route("/printFarm/suspendPrinter", post(suspend_printer))
        .route("/printFarm/resumePrinter", post(resume_printer))
        .route("/machine/file/{*path}", get(download_file).put(upload_file))
        .layer(DefaultBodyLimit::disable())
        .with_state(services)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError(FarmError);

impl From<FarmError> for ApiError {
    fn from(err: FarmError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FarmError::Rejected(_) | FarmError::Config(_) => StatusCode::BAD_REQUEST,
            FarmError::JobFileMissing(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T = StatusCode> = Result<T, ApiError>;

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError(FarmError::Rejected(format!("{name} is required"))))
}

/// 201 with a `Location` header naming `path`.
fn created(path: &str) -> Response {
    let location = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FilenameParams {
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndexParams {
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RemoveJobParams {
    filename: Option<String>,
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HostnameParams {
    hostname: Option<String>,
}

impl IndexParams {
    fn index(&self) -> Result<usize, ApiError> {
        self.index
            .ok_or_else(|| ApiError(FarmError::Rejected("index is required".into())))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

async fn queue(State(services): State<AppServices>) -> Json<Vec<Job>> {
    Json(services.queue().snapshot())
}

async fn printers(State(services): State<AppServices>) -> Json<Vec<Printer>> {
    Json(services.registry().snapshot())
}

async fn add_job(
    State(services): State<AppServices>,
    Query(params): Query<FilenameParams>,
    body: Bytes,
) -> ApiResult<Response> {
    let filename = required(params.filename, "filename")?;
    let path = services.upload_path(&filename)?;
    services.store_job(&path, &body).await?;
    Ok(created(&filename))
}

async fn remove_job(
    State(services): State<AppServices>,
    Query(params): Query<RemoveJobParams>,
) -> ApiResult {
    match (params.filename.filter(|f| !f.trim().is_empty()), params.index) {
        (Some(filename), _) => services.queue().remove_by_filename(filename.trim())?,
        (None, Some(index)) => services.queue().remove(index)?,
        (None, None) => {
            return Err(ApiError(FarmError::Rejected(
                "filename or index is required".into(),
            )));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Log the printer's answer to a job command once it arrives.
fn report_outcome(action: &'static str, index: usize, reply: oneshot::Receiver<bool>) {
    tokio::spawn(async move {
        match reply.await {
            Ok(true) => info!(index, action, "printer accepted job command"),
            Ok(false) => warn!(index, action, "printer refused job command"),
            Err(_) => warn!(index, action, "job command dropped"),
        }
    });
}

async fn pause_job(
    State(services): State<AppServices>,
    Query(params): Query<IndexParams>,
) -> ApiResult {
    let index = params.index()?;
    report_outcome("pause", index, services.queue().pause(index)?);
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_job(
    State(services): State<AppServices>,
    Query(params): Query<IndexParams>,
) -> ApiResult {
    let index = params.index()?;
    report_outcome("resume", index, services.queue().resume(index)?);
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_job(
    State(services): State<AppServices>,
    Query(params): Query<IndexParams>,
) -> ApiResult {
    let index = params.index()?;
    report_outcome("cancel", index, services.queue().cancel(index)?);
    Ok(StatusCode::NO_CONTENT)
}

async fn repeat_job(
    State(services): State<AppServices>,
    Query(params): Query<IndexParams>,
) -> ApiResult {
    services.queue().repeat(params.index()?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clean_up(State(services): State<AppServices>) -> StatusCode {
    services.queue().clean();
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

async fn add_printer(
    State(services): State<AppServices>,
    Query(params): Query<HostnameParams>,
) -> ApiResult {
    services
        .registry()
        .add(&required(params.hostname, "hostname")?);
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_printer(
    State(services): State<AppServices>,
    Query(params): Query<HostnameParams>,
) -> ApiResult {
    services
        .registry()
        .remove(&required(params.hostname, "hostname")?);
    Ok(StatusCode::NO_CONTENT)
}

async fn suspend_printer(
    State(services): State<AppServices>,
    Query(params): Query<HostnameParams>,
) -> ApiResult {
    services
        .registry()
        .suspend(&required(params.hostname, "hostname")?);
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_printer(
    State(services): State<AppServices>,
    Query(params): Query<HostnameParams>,
) -> ApiResult {
    services
        .registry()
        .resume(&required(params.hostname, "hostname")?);
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Machine files
// ---------------------------------------------------------------------------

async fn download_file(
    State(services): State<AppServices>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let resolved = services.resolve_firmware_path(&path)?;
    match tokio::fs::read(&resolved).await {
        Ok(contents) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            contents,
        )
            .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(%path, resolved = %resolved.display(), "could not find file");
            Err(ApiError(FarmError::JobFileMissing(resolved)))
        }
        Err(e) => Err(FarmError::Io(e).into()),
    }
}

async fn upload_file(
    State(services): State<AppServices>,
    Path(path): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let resolved = services.resolve_firmware_path(&path)?;
    services.store_job(&resolved, &body).await?;
    Ok(created(&path))
}
