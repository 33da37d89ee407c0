//! `POST /upload`: authenticate, store the image, run the worker, answer.
//!
//! Each request walks `received -> authenticating -> authenticated ->
//! artifact_stored -> worker_invoked -> responded`. Any failure goes straight
//! to a response; nothing is retried. Status codes:
//! - 400 when no `image` file is present or the multipart body is unreadable
//! - 401 when credentials are missing (and required) or wrong
//! - 500 when the artifact cannot be written or the worker cannot start
//! - 200 otherwise, with `success: false` if the worker timed out or failed

use crate::{
    errors::AppError,
    models::{
        artifact::UploadedArtifact,
        job::{JobErrorKind, JobResult},
        user::User,
    },
    services::{artifact_store::ArtifactError, credentials::CredentialError},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
    http::{HeaderMap, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose};
use futures::TryStreamExt;
use serde::Serialize;
use std::io;
use tracing::{debug, error, info};

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

pub const PROCESSED: &str = "Image processed successfully.";
pub const NO_FILE: &str = "No file uploaded.";
pub const TIMED_OUT: &str = "Image processing timed out.";
pub const PROCESSING_FAILED: &str = "Error processing image.";
const WORKER_UNAVAILABLE: &str = "Image processing could not be started.";
const STORAGE_FAILED: &str = "Could not store the uploaded file.";
const MALFORMED: &str = "Malformed upload.";
const AUTH_REQUIRED: &str = "Authentication required.";
const BAD_CREDENTIALS: &str = "Invalid username or password.";
const AUTH_UNAVAILABLE: &str = "Authentication is temporarily unavailable.";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "solverOutput", skip_serializing_if = "Option::is_none")]
    pub solver_output: Option<String>,
}

/// `POST /upload`: multipart form with one file field named `image`.
pub async fn upload_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    debug!("upload received");

    let user = authenticate(&state, &headers).await?;
    debug!(user = ?user.as_ref().map(|u| u.username.as_str()), "upload authenticated");

    // A request that is not multipart at all simply carries no file.
    let multipart = multipart.map_err(|rejection| {
        debug!("upload without multipart body: {}", rejection);
        AppError::bad_request(NO_FILE)
    })?;
    let artifact = receive_artifact(&state, multipart).await?;
    info!(
        artifact = %artifact.generated_name,
        original = %artifact.original_filename,
        size = artifact.size_bytes,
        received_at = %artifact.received_at,
        "artifact stored"
    );

    let job = state.worker.run(&artifact.storage_path).await.map_err(|err| {
        error!(artifact = %artifact.generated_name, "{}", err);
        AppError::internal(WORKER_UNAVAILABLE)
    })?;
    debug!(artifact = %artifact.generated_name, success = job.is_success(), "worker invoked");

    respond(&artifact, job)
}

/// Verify HTTP Basic credentials when present.
///
/// Returns `None` for anonymous requests, which are allowed unless the
/// service requires upload authentication.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Option<User>, AppError> {
    let Some((username, password)) = basic_credentials(headers)? else {
        if state.require_upload_auth {
            return Err(AppError::unauthorized(AUTH_REQUIRED));
        }
        return Ok(None);
    };

    match state.credentials.verify(&username, &password).await {
        Ok(user) => Ok(Some(user)),
        Err(CredentialError::UserNotFound(_) | CredentialError::InvalidCredentials) => {
            debug!(username = %username, "upload with bad credentials");
            Err(AppError::unauthorized(BAD_CREDENTIALS))
        }
        Err(err) => {
            error!("upload authentication failed: {}", err);
            Err(AppError::new(StatusCode::SERVICE_UNAVAILABLE, AUTH_UNAVAILABLE))
        }
    }
}

/// Parse an `Authorization: Basic` header into `(username, password)`.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, AppError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let invalid = || AppError::unauthorized(BAD_CREDENTIALS);

    let value = value.to_str().map_err(|_| invalid())?;
    let (scheme, encoded) = value.split_once(' ').ok_or_else(invalid)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(invalid());
    }
    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;

    Ok(Some((username.to_string(), password.to_string())))
}

/// Stream the first `image` file field to the artifact store.
///
/// Other fields, and any further `image` fields, are skipped. Nothing is
/// written when no `image` file field is present.
async fn receive_artifact(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<UploadedArtifact, AppError> {
    let mut artifact = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        debug!("multipart read failed: {}", err);
        AppError::bad_request(MALFORMED)
    })? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            debug!("`{}` field without a filename, ignoring", IMAGE_FIELD);
            continue;
        };
        if artifact.is_some() {
            debug!("ignoring additional `{}` field {}", IMAGE_FIELD, filename);
            continue;
        }

        let stream = field.map_err(io::Error::other);
        let saved = state
            .artifacts
            .save(stream, &filename)
            .await
            .map_err(|err| match err {
                ArtifactError::Stream(err) => {
                    debug!("upload body failed: {}", err);
                    AppError::bad_request(MALFORMED)
                }
                ArtifactError::Write(err) => {
                    error!("failed to store upload {}: {}", filename, err);
                    AppError::internal(STORAGE_FAILED)
                }
            })?;
        artifact = Some(saved);
    }

    artifact.ok_or_else(|| AppError::bad_request(NO_FILE))
}

fn respond(artifact: &UploadedArtifact, job: JobResult) -> Result<Json<UploadResponse>, AppError> {
    match job.error_kind {
        None => {
            info!(
                artifact = %artifact.generated_name,
                elapsed = ?job.elapsed,
                "image processed"
            );
            Ok(Json(UploadResponse {
                success: true,
                message: PROCESSED.into(),
                solver_output: Some(job.raw_output),
            }))
        }
        Some(JobErrorKind::Timeout) => {
            info!(artifact = %artifact.generated_name, elapsed = ?job.elapsed, "worker timed out");
            Err(AppError::rejected(TIMED_OUT))
        }
        Some(JobErrorKind::WorkerError) => {
            info!(
                artifact = %artifact.generated_name,
                status = ?job.exit_status,
                stderr = %job.stderr.trim_end(),
                "worker reported failure"
            );
            Err(AppError::rejected(PROCESSING_FAILED))
        }
    }
}
