use async_trait::async_trait;
use thiserror::Error;

use crate::resources::{CiJob, Pod};

/// Error taxonomy shared by every orchestrator operation.
///
/// Unprocessable is a semantic rejection and terminal for the record that
/// provoked it; Conflict is an optimistic-concurrency collision and
/// Transport covers everything else, both retried on the next tick.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unprocessable entity: {0}")]
    Unprocessable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl OrchestratorError {
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, OrchestratorError::Unprocessable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict(_))
    }
}

/// The capability set the controller consumes from the cluster orchestrator.
/// The orchestrator exclusively owns both record collections; the controller
/// holds only per-tick snapshots obtained through the list operations.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_job(&self, job: CiJob) -> Result<CiJob, OrchestratorError>;

    /// List job records matching a label selector; empty selects all.
    async fn list_jobs(&self, selector: &str) -> Result<Vec<CiJob>, OrchestratorError>;

    async fn replace_job(&self, name: &str, job: CiJob) -> Result<CiJob, OrchestratorError>;

    async fn create_pod(&self, pod: Pod) -> Result<Pod, OrchestratorError>;

    /// List pods matching a label selector; empty selects all.
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, OrchestratorError>;

    async fn delete_pod(&self, name: &str) -> Result<(), OrchestratorError>;
}
