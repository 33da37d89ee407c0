//! ArtifactStore: writes uploaded images into a single flat directory.
//!
//! Every upload gets a fresh name of the form
//! `{unix micros}-{sequence}-{sanitized original name}` and is opened with
//! create-new semantics, so concurrent uploads can never share a path or
//! overwrite each other's bytes. Files are never removed once complete;
//! only partially written files from a failed upload are cleaned up.

use crate::models::artifact::UploadedArtifact;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;

const MAX_NAME_ATTEMPTS: usize = 16;
const MAX_SANITIZED_LEN: usize = 128;
const FALLBACK_NAME: &str = "upload";

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Disk-side failure: directory creation, open, write, or sync.
    #[error("failed to write artifact: {0}")]
    Write(#[source] io::Error),
    /// The incoming body failed before it was fully received.
    #[error("upload stream failed: {0}")]
    Stream(#[source] io::Error),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    base_path: PathBuf,
    sequence: Arc<AtomicU64>,
}

impl ArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the upload directory. Safe to call concurrently and repeatedly.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    /// Stream an upload to disk and return its handle.
    ///
    /// Computes size and MD5 while writing and fsyncs before returning. On any
    /// error the partially written file is removed.
    pub async fn save<S>(&self, stream: S, original_filename: &str) -> ArtifactResult<UploadedArtifact>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.ensure_dir().await.map_err(ArtifactError::Write)?;

        let sanitized = sanitize_filename(original_filename);
        let (generated_name, storage_path, mut file) = self.create_unique(&sanitized).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    discard(&storage_path).await;
                    return Err(ArtifactError::Stream(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                discard(&storage_path).await;
                return Err(ArtifactError::Write(err));
            }
        }
        if let Err(err) = file.flush().await {
            discard(&storage_path).await;
            return Err(ArtifactError::Write(err));
        }
        if let Err(err) = file.sync_all().await {
            discard(&storage_path).await;
            return Err(ArtifactError::Write(err));
        }

        let artifact = UploadedArtifact {
            generated_name,
            storage_path,
            received_at: Utc::now(),
            original_filename: original_filename.to_string(),
            size_bytes,
            checksum: format!("{:x}", digest.compute()),
        };
        debug!(
            path = %artifact.storage_path.display(),
            size = artifact.size_bytes,
            checksum = %artifact.checksum,
            "artifact stored"
        );
        Ok(artifact)
    }

    /// Draw names until one can be created exclusively.
    async fn create_unique(&self, sanitized: &str) -> ArtifactResult<(String, PathBuf, File)> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = self.next_name(sanitized);
            let path = self.base_path.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((name, path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!("artifact name {} taken, retrying", name);
                }
                Err(err) => return Err(ArtifactError::Write(err)),
            }
        }
        Err(ArtifactError::Write(io::Error::new(
            ErrorKind::AlreadyExists,
            "could not allocate a unique artifact name",
        )))
    }

    fn next_name(&self, sanitized: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", Utc::now().timestamp_micros(), seq, sanitized)
    }
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            debug!("failed to remove partial artifact {}: {}", path.display(), err);
        }
    }
}

/// Reduce a client-supplied file name to a safe single path component.
///
/// Keeps only the last `/` or `\` separated segment, replaces anything
/// outside `[A-Za-z0-9._-]` with `_`, strips leading dots and caps the length.
pub fn sanitize_filename(original: &str) -> String {
    let last = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);

    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // Keep the tail so the extension survives truncation.
    let skip = cleaned.len().saturating_sub(MAX_SANITIZED_LEN);
    cleaned[skip..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(*p)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_filename("puzzle.png"), "puzzle.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\grid 1.jpg"), "grid_1.jpg");
        assert_eq!(sanitize_filename("sudoku (final)!.jpeg"), "sudoku__final__.jpeg");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/"), "upload");
        assert_eq!(sanitize_filename("ünïcode.png"), "_n_code.png");
    }

    #[test]
    fn sanitize_caps_length_keeping_extension() {
        let long = format!("{}.png", "a".repeat(500));
        let out = sanitize_filename(&long);
        assert_eq!(out.len(), MAX_SANITIZED_LEN);
        assert!(out.ends_with(".png"));
    }

    #[tokio::test]
    async fn save_creates_missing_directory_and_writes_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("nested").join("imgs"));

        let artifact = store
            .save(chunks(&[b"hello ", b"world"]), "grid.png")
            .await
            .unwrap();

        assert!(artifact.generated_name.ends_with("-grid.png"));
        assert_eq!(artifact.original_filename, "grid.png");
        assert_eq!(artifact.size_bytes, 11);
        assert_eq!(artifact.checksum, format!("{:x}", md5::compute(b"hello world")));
        assert_eq!(artifact.storage_path.parent(), Some(store.base_path()));
        assert_eq!(fs::read(&artifact.storage_path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn concurrent_saves_with_same_name_never_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("imgs"));

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let body = vec![i; 4096];
                let stream = stream::iter(
                    body.chunks(512)
                        .map(|c| Ok(Bytes::copy_from_slice(c)))
                        .collect::<Vec<_>>(),
                );
                let artifact = store.save(stream, "same.png").await.unwrap();
                (i, artifact)
            }));
        }

        let mut paths = std::collections::HashSet::new();
        for handle in handles {
            let (i, artifact) = handle.await.unwrap();
            assert!(paths.insert(artifact.storage_path.clone()));
            let bytes = fs::read(&artifact.storage_path).await.unwrap();
            assert_eq!(bytes, vec![i; 4096]);
        }
        assert_eq!(paths.len(), 16);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());

        let stream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);
        let err = store.save(stream, "grid.png").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Stream(_)));

        let mut entries = fs::read_dir(tmp.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_write_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"x").await.unwrap();

        let store = ArtifactStore::new(blocker.join("imgs"));
        let err = store.save(chunks(&[b"data"]), "grid.png").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Write(_)));
    }
}
