//! Shared state handed to every handler.

use crate::services::{
    artifact_store::ArtifactStore, credentials::CredentialStore, worker_invoker::WorkerInvoker,
};

/// Handles to the three pipeline components.
///
/// Cloned per request; every field is cheap to clone and shares its
/// underlying pool, directory counter, or admission semaphore.
#[derive(Clone)]
pub struct AppState {
    pub credentials: CredentialStore,
    pub artifacts: ArtifactStore,
    pub worker: WorkerInvoker,
    /// Reject uploads that carry no credentials.
    pub require_upload_auth: bool,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::credentials::tests::memory_store;
    use std::{path::Path, time::Duration};

    /// State over an in-memory credential store, uploading into `upload_dir`
    /// and running `script` through `/bin/sh` as the worker.
    pub(crate) async fn test_state(upload_dir: &Path, script: &str, timeout: Duration) -> AppState {
        AppState {
            credentials: memory_store().await,
            artifacts: ArtifactStore::new(upload_dir),
            worker: WorkerInvoker::new(
                "/bin/sh",
                vec!["-c".into(), script.into(), "worker".into()],
                timeout,
            ),
            require_upload_auth: false,
        }
    }
}
