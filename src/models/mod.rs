//! Core data models for the upload-and-solve pipeline.
//!
//! `User` maps to the `users` table via `sqlx::FromRow`; the artifact and job
//! types live only for the duration of a single upload request.

pub mod artifact;
pub mod job;
pub mod user;
