use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub log: LogConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub incident: IncidentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Shared secret used to sign webhook deliveries.
    pub secret: String,
    /// Branch whose pushes trigger a rebuild.
    pub branch: String,
}

impl WebhookConfig {
    /// The fully qualified ref pushes must target, e.g. `refs/heads/main`.
    pub fn target_ref(&self) -> String { format!("refs/heads/{}", self.branch) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub url: String,
    /// Number of runs kept in the rolling log before the oldest are pruned.
    #[serde(default = "default_retain_runs")]
    pub retain_runs: u32,
}

fn default_retain_runs() -> u32 { 200 }

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineStep {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IncidentConfig {
    /// Access token used to reopen and comment on the tracking issue.
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub issue: u64,
}
