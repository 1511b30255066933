use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pushbuild_core::{
    config::{PipelineConfig, PipelineStep},
    models::{RunLog, TimeStamp},
};
use tokio::process::Command;

use crate::Job;

/// Job body that rebuilds and publishes the package.
///
/// Runs each configured step in order. Output is copied into the run log, and
/// the first step that cannot be spawned or exits unsuccessfully fails the run.
pub struct RebuildPipeline {
    steps: Vec<PipelineStep>,
}

impl RebuildPipeline {
    pub fn new(config: &PipelineConfig) -> Self { Self { steps: config.steps.clone() } }
}

#[async_trait]
impl Job for RebuildPipeline {
    async fn run(&self, log: &RunLog, timestamp: TimeStamp) -> Result<()> {
        if self.steps.is_empty() {
            log.info("No pipeline steps configured");
            return Ok(());
        }
        for step in &self.steps {
            run_step(step, log).await.with_context(|| format!("Pipeline step `{step}` failed"))?;
        }
        log.info(format!("Rebuild for event {timestamp} completed"));
        Ok(())
    }
}

async fn run_step(step: &PipelineStep, log: &RunLog) -> Result<()> {
    log.info(format!("$ {step}"));
    let mut command = Command::new(&step.program);
    command.args(&step.args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(cwd) = &step.cwd {
        command.current_dir(cwd);
    }
    let output =
        command.output().await.with_context(|| format!("Failed to spawn {}", step.program))?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log.info(line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        log.info(line);
    }
    if !output.status.success() {
        bail!("{} exited with {}", step.program, output.status);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use pushbuild_core::models::LogLevel;

    use super::*;

    fn step(program: &str, args: &[&str]) -> PipelineStep {
        PipelineStep {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }

    fn messages(log: &RunLog) -> Vec<String> {
        log.entries().into_iter().map(|e| e.message).collect()
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let pipeline = RebuildPipeline::new(&PipelineConfig {
            steps: vec![
                step("sh", &["-c", "echo building"]),
                step("sh", &["-c", "echo publishing >&2"]),
            ],
        });
        let log = RunLog::new();
        pipeline.run(&log, TimeStamp::from_millis(7)).await.unwrap();
        assert_eq!(messages(&log), vec![
            "$ sh -c echo building",
            "building",
            "$ sh -c echo publishing >&2",
            "publishing",
            "Rebuild for event 7 completed",
        ]);
        assert!(log.entries().iter().all(|e| e.level == LogLevel::Info));
    }

    #[tokio::test]
    async fn test_failing_step_stops_pipeline() {
        let pipeline = RebuildPipeline::new(&PipelineConfig {
            steps: vec![step("sh", &["-c", "exit 3"]), step("sh", &["-c", "echo unreachable"])],
        });
        let log = RunLog::new();
        let err = pipeline.run(&log, TimeStamp::from_millis(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Pipeline step `sh -c exit 3` failed");
        assert!(format!("{err:#}").contains("exited with"));
        assert_eq!(messages(&log), vec!["$ sh -c exit 3"]);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let pipeline = RebuildPipeline::new(&PipelineConfig {
            steps: vec![step("/nonexistent/pushbuild-step", &[])],
        });
        let err = pipeline.run(&RunLog::new(), TimeStamp::from_millis(1)).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to spawn /nonexistent/pushbuild-step"));
    }

    #[tokio::test]
    async fn test_no_steps() {
        let pipeline = RebuildPipeline::new(&PipelineConfig::default());
        let log = RunLog::new();
        pipeline.run(&log, TimeStamp::from_millis(1)).await.unwrap();
        assert_eq!(messages(&log), vec!["No pipeline steps configured"]);
    }
}
