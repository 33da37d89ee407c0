//! Signup and login.
//!
//! Both endpoints always answer HTTP 200; the outcome is carried in the body.

use crate::{errors::AppError, services::credentials::CredentialError, state::AppState};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub const LOGIN_OK: &str = "Login successful. You can now upload an image.";
pub const INVALID_PASSWORD: &str = "Invalid password.";
pub const USER_NOT_FOUND: &str = "User not found.";
const USERNAME_TAKEN: &str = "Username already exists.";
const MISSING_FIELDS: &str = "Username and password are required.";
const BAD_BODY: &str = "Invalid request body.";
const STORE_DOWN: &str = "Service temporarily unavailable. Please try again later.";

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignupResponse {
    fn failed(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            error: Some(msg.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
}

/// `POST /signup`
pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Json<SignupResponse> {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!("signup rejected: {}", rejection);
            return SignupResponse::failed(BAD_BODY);
        }
    };
    if req.username.is_empty() || req.password.is_empty() {
        return SignupResponse::failed(MISSING_FIELDS);
    }

    match state
        .credentials
        .create(&req.username, &req.email, &req.password)
        .await
    {
        Ok(_) => Json(SignupResponse {
            success: true,
            error: None,
        }),
        Err(CredentialError::DuplicateUsername(name)) => {
            debug!(username = %name, "signup with taken username");
            SignupResponse::failed(USERNAME_TAKEN)
        }
        Err(err) => {
            error!("signup failed: {}", err);
            SignupResponse::failed(STORE_DOWN)
        }
    }
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(req) = payload.map_err(|rejection| {
        debug!("login rejected: {}", rejection);
        AppError::rejected(BAD_BODY)
    })?;

    state
        .credentials
        .verify(&req.username, &req.password)
        .await
        .map_err(login_error)?;

    debug!(username = %req.username, "login succeeded");
    Ok(Json(LoginResponse {
        success: true,
        message: LOGIN_OK.into(),
    }))
}

fn login_error(err: CredentialError) -> AppError {
    match err {
        CredentialError::UserNotFound(_) => AppError::rejected(USER_NOT_FOUND),
        CredentialError::InvalidCredentials => AppError::rejected(INVALID_PASSWORD),
        other => {
            error!("login failed: {}", other);
            AppError::rejected(STORE_DOWN)
        }
    }
}
