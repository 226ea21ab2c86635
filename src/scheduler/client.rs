//! Scheduler clients: where dispatched jobs go.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::DispatchError;

use super::job::Job;

/// Consumes fully rendered job commands.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Dispatches one job. `command` is the final command line, including any
    /// submission header.
    async fn dispatch(&self, job: &Job, command: &str) -> Result<(), DispatchError>;
}

async fn run_shell(job: &Job, command: &str, inherit_output: bool) -> Result<(), DispatchError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdin(Stdio::null());
    if !inherit_output {
        cmd.stdout(Stdio::null());
    }

    debug!(job_id = %job.id, "sh -c {}", command);

    let status = cmd.status().await.map_err(|source| DispatchError::Spawn {
        job_id: job.id.clone(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(DispatchError::NonZeroExit {
            job_id: job.id.clone(),
            code: status.code(),
        })
    }
}

/// Hands jobs to a cluster submission command such as `sbatch`.
///
/// Only the submission itself is awaited; the job runs on the cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterClient;

#[async_trait]
impl SchedulerClient for ClusterClient {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn dispatch(&self, job: &Job, command: &str) -> Result<(), DispatchError> {
        run_shell(job, command, false).await
    }
}

/// Runs each job in this session and waits for it to finish.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait]
impl SchedulerClient for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, job: &Job, command: &str) -> Result<(), DispatchError> {
        run_shell(job, command, true).await
    }
}
