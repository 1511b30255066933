use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::{Octocrab, models::IssueState};
use pushbuild_core::{config::IncidentConfig, models::TimeStamp};

/// Sink for failures that terminate the process.
#[async_trait]
pub trait IncidentReporter: Send + Sync {
    async fn report(&self, timestamp: TimeStamp, detail: &str) -> Result<()>;
}

/// Reports incidents by reopening a tracking issue and commenting on it.
pub struct GitHubIncidentReporter {
    client: Octocrab,
    owner: String,
    repo: String,
    issue: u64,
}

impl GitHubIncidentReporter {
    pub fn new(config: &IncidentConfig) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self {
            client,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            issue: config.issue,
        })
    }
}

#[async_trait]
impl IncidentReporter for GitHubIncidentReporter {
    async fn report(&self, timestamp: TimeStamp, detail: &str) -> Result<()> {
        let issues = self.client.issues(&self.owner, &self.repo);
        issues
            .update(self.issue)
            .state(IssueState::Open)
            .send()
            .await
            .with_context(|| {
                format!("Failed to reopen {}/{}#{}", self.owner, self.repo, self.issue)
            })?;
        issues
            .create_comment(self.issue, incident_comment(timestamp, detail))
            .await
            .with_context(|| {
                format!("Failed to comment on {}/{}#{}", self.owner, self.repo, self.issue)
            })?;
        tracing::info!(
            "Reported incident {} on {}/{}#{}",
            timestamp,
            self.owner,
            self.repo,
            self.issue
        );
        Ok(())
    }
}

fn incident_comment(timestamp: TimeStamp, detail: &str) -> String {
    format!(
        "Rebuild failed for event `{timestamp}` ({}).\n\n```\n{}\n```\n",
        timestamp.to_datetime(),
        detail.trim_end()
    )
}
