//! Boundary to the external planner that proposes structural edits.
//!
//! Only the data contract lives here: a snapshot goes out, a list of
//! proposed operations comes back. The call is bounded by a timeout and can
//! be cancelled; applying the result is not.

use crate::operations::{self, ApplyReport, ProposedOperation};
use crate::service::{ServiceError, TreeService};
use crate::snapshot::Snapshot;
use crate::storage::WorkspaceConfig;
use crate::types::DocumentInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("planner did not answer within {0:?}")]
    Timeout(Duration),
    #[error("planner request cancelled")]
    Cancelled,
    #[error("no planner endpoint configured (set planner.endpoint or ISSUETREE_PLANNER_URL)")]
    NotConfigured,
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRequest {
    pub instruction: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlannerResponse {
    pub operations: Vec<ProposedOperation>,
}

impl PlannerResponse {
    /// Lenient parse; malformed entries are dropped.
    pub fn from_text(text: &str) -> Self {
        PlannerResponse {
            operations: operations::parse_operations_str(text),
        }
    }
}

/// Receiving half of a cancellation flag. Sending `true` cancels.
pub type CancelSignal = watch::Receiver<bool>;

pub fn cancel_channel() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn propose(
        &self,
        request: &PlannerRequest,
        cancel: CancelSignal,
    ) -> Result<PlannerResponse, PlannerError>;
}

async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            // Sender gone without cancelling: never fires.
            std::future::pending::<()>().await;
        }
    }
}

/// Run `call` under a timeout, racing it against `cancel`.
pub async fn guarded<T, F>(call: F, limit: Duration, mut cancel: CancelSignal) -> Result<T, PlannerError>
where
    F: Future<Output = Result<T, PlannerError>>,
{
    if *cancel.borrow() {
        return Err(PlannerError::Cancelled);
    }
    tokio::select! {
        result = tokio::time::timeout(limit, call) => {
            result.map_err(|_| PlannerError::Timeout(limit))?
        }
        _ = cancelled(&mut cancel) => Err(PlannerError::Cancelled),
    }
}

/// Planner reached over HTTP: the request is POSTed as JSON and the body is
/// parsed as `{"operations": [...]}` or a bare array.
#[derive(Debug, Clone)]
pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpPlanner {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PlannerError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("issuetree/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpPlanner {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn from_config(config: &WorkspaceConfig) -> Result<Self, PlannerError> {
        let endpoint = config
            .planner_endpoint()
            .ok_or(PlannerError::NotConfigured)?;
        Self::new(endpoint, Duration::from_secs(config.planner.timeout_secs))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn propose(
        &self,
        request: &PlannerRequest,
        cancel: CancelSignal,
    ) -> Result<PlannerResponse, PlannerError> {
        let call = async {
            tracing::debug!(endpoint = %self.endpoint, nodes = request.snapshot.nodes.len(), "calling planner");
            let resp = self
                .client
                .post(&self.endpoint)
                .json(request)
                .send()
                .await?
                .error_for_status()?;
            let body = resp.text().await?;
            Ok(PlannerResponse::from_text(&body))
        };
        guarded(call, self.timeout, cancel).await
    }
}

/// What a planning round produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    pub snapshot_nodes: usize,
    pub operations: Vec<ProposedOperation>,
    pub report: ApplyReport,
    pub dry_run: bool,
}

/// Snapshot the tree, ask the planner, and apply what comes back.
///
/// With `dry_run` the proposals are validated against a copy and nothing is saved.
pub async fn plan_and_apply(
    service: &mut TreeService,
    planner: &dyn Planner,
    instruction: &str,
    documents: &[DocumentInfo],
    byte_budget: usize,
    cancel: CancelSignal,
    dry_run: bool,
) -> Result<PlanOutcome, PlanError> {
    let snapshot = service.snapshot(instruction, documents, byte_budget);
    let snapshot_nodes = snapshot.nodes.len();
    let request = PlannerRequest {
        instruction: instruction.to_string(),
        snapshot,
    };

    let response = planner.propose(&request, cancel).await?;
    tracing::info!(proposed = response.operations.len(), "planner responded");

    let report = if dry_run {
        operations::dry_run(&service.tree(), &response.operations)
    } else {
        service.apply_batch(&response.operations)?
    };

    Ok(PlanOutcome {
        snapshot_nodes,
        operations: response.operations,
        report,
        dry_run,
    })
}
