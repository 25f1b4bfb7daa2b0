//! Pull channel: authoritative snapshots over HTTP.

mod poller;

pub use poller::{PollState, PollingFallback};

use crate::connection::Credential;
use crate::error::{SyncError, SyncResult};
use crate::snapshot::{ProjectId, WorkflowSnapshot};
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_project(&self, id: ProjectId) -> SyncResult<WorkflowSnapshot>;
    async fn list_projects(&self) -> SyncResult<Vec<WorkflowSnapshot>>;
}

/// What the poller is refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Project(ProjectId),
    /// The user's project list.
    Overview,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    Project(WorkflowSnapshot),
    Overview(Vec<WorkflowSnapshot>),
}

impl Pulled {
    pub fn target(&self) -> PollTarget {
        match self {
            Self::Project(snapshot) => PollTarget::Project(snapshot.id),
            Self::Overview(_) => PollTarget::Overview,
        }
    }
}

pub async fn fetch(source: &dyn SnapshotSource, target: PollTarget) -> SyncResult<Pulled> {
    match target {
        PollTarget::Project(id) => source.fetch_project(id).await.map(Pulled::Project),
        PollTarget::Overview => source.list_projects().await.map(Pulled::Overview),
    }
}

/// Blocking `ureq` client run on the blocking pool.
pub struct HttpSnapshotSource {
    api_url: String,
    credential: Option<Credential>,
    agent: ureq::Agent,
}

impl HttpSnapshotSource {
    pub fn new(api_url: &str, credential: Option<Credential>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            credential,
            agent,
        }
    }

    async fn get(&self, path: String) -> SyncResult<String> {
        let url = format!("{}{}", self.api_url, path);
        let agent = self.agent.clone();
        let auth = self
            .credential
            .as_ref()
            .map(|c| format!("Bearer {}", c.expose()));

        tokio::task::spawn_blocking(move || {
            let mut request = agent.get(&url).header("Accept", "application/json");
            if let Some(auth) = &auth {
                request = request.header("Authorization", auth);
            }
            request
                .call()
                .map_err(|e| SyncError::Pull(format!("GET {} failed: {}", url, e)))?
                .body_mut()
                .read_to_string()
                .map_err(|e| SyncError::Pull(format!("reading {} failed: {}", url, e)))
        })
        .await
        .map_err(|e| SyncError::Pull(format!("pull task failed: {}", e)))?
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_project(&self, id: ProjectId) -> SyncResult<WorkflowSnapshot> {
        let body = self.get(format!("/api/projects/{}", id)).await?;
        WorkflowSnapshot::from_json(&body)
    }

    async fn list_projects(&self) -> SyncResult<Vec<WorkflowSnapshot>> {
        let body = self.get("/api/projects".to_string()).await?;
        WorkflowSnapshot::list_from_json(&body)
    }
}
