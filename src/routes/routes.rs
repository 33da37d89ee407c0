//! Route table for the upload-and-solve service.
//!
//! ## Structure
//! - **Accounts**
//!   - `POST /signup`: create a user
//!   - `POST /login` : check a username/password pair
//!
//! - **Pipeline**
//!   - `POST /upload`: multipart `image` upload, runs the worker, returns its output
//!
//! - **Probes**
//!   - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        auth_handlers::{login, signup},
        health_handlers::{healthz, readyz},
        upload_handlers::upload_image,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Shared `AppState` is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/upload", post(upload_image))
}
