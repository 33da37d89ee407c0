//! Pipeline components: credential store, artifact store, worker invoker.

pub mod artifact_store;
pub mod credentials;
pub mod worker_invoker;
