//! Represents an uploaded image persisted to the upload directory.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// A file written by `ArtifactStore::save`.
///
/// The bytes on disk are owned by the artifact store once written; this
/// struct is only a handle to them for the lifetime of one request.
#[derive(Clone, Debug)]
pub struct UploadedArtifact {
    /// Unique file name inside the upload directory.
    pub generated_name: String,

    /// Full path handed to the worker.
    pub storage_path: PathBuf,

    /// When the upload finished writing.
    pub received_at: DateTime<Utc>,

    /// File name as sent by the client, before sanitizing.
    pub original_filename: String,

    /// Number of bytes written.
    pub size_bytes: u64,

    /// MD5 of the written bytes, lowercase hex.
    pub checksum: String,
}
