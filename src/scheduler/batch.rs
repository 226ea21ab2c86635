//! The batch scheduler: a job queue with print and submit cycles.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;

use super::client::{ClusterClient, LocalExecutor, SchedulerClient};
use super::header::{compose_header, render_job, BatchSystemConfig, HeaderContext};
use super::job::{Job, Resources};

/// Number of jobs shown by [`BatchScheduler::print_jobs`] outside debug mode.
pub const MAX_JOB_DISPLAY: usize = 5;

/// Lifecycle of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Idle,
    Queuing,
    Printed,
    LocallyExecuted,
    Submitted,
}

impl SchedulerState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SchedulerState::Printed | SchedulerState::LocallyExecuted | SchedulerState::Submitted
        )
    }
}

/// Result of dispatching one job.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub job_id: String,
    pub result: Result<(), DispatchError>,
}

/// Per-job results of one `submit_jobs` call.
#[derive(Debug)]
pub struct DispatchReport {
    pub cycle_id: Uuid,
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            outcomes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Queues jobs and dispatches them to a [`SchedulerClient`].
///
/// With a batch-system configuration every job is wrapped in a submission
/// header and handed to the cluster. Without one, jobs run one at a time in
/// this session.
pub struct BatchScheduler {
    batch: Option<BatchSystemConfig>,
    client: Box<dyn SchedulerClient>,
    log_dir: PathBuf,
    email: Option<String>,
    debug: bool,
    queue: Vec<Job>,
    state: SchedulerState,
}

impl BatchScheduler {
    /// Creates a scheduler; `None` selects local execution.
    pub fn new(batch: Option<BatchSystemConfig>, log_dir: impl Into<PathBuf>) -> Self {
        let client: Box<dyn SchedulerClient> = match batch {
            Some(_) => Box::new(ClusterClient),
            None => Box::new(LocalExecutor),
        };
        Self {
            batch,
            client,
            log_dir: log_dir.into(),
            email: None,
            debug: false,
            queue: Vec::new(),
            state: SchedulerState::Idle,
        }
    }

    /// Creates a scheduler that runs jobs locally.
    pub fn local(log_dir: impl Into<PathBuf>) -> Self {
        Self::new(None, log_dir)
    }

    /// Replaces the scheduler client.
    pub fn with_client(mut self, client: impl SchedulerClient + 'static) -> Self {
        self.client = Box::new(client);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        let email = email.into();
        self.email = (!email.is_empty()).then_some(email);
        self
    }

    /// In debug mode `print_jobs` lists every job.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn is_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn jobs(&self) -> &[Job] {
        &self.queue
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Resources used for jobs that do not set their own.
    pub fn default_resources(&self) -> Resources {
        self.batch
            .as_ref()
            .map(BatchSystemConfig::default_resources)
            .unwrap_or_default()
    }

    /// Appends a job. Adding after a print or submit starts a new cycle.
    pub fn add_job(&mut self, job: Job) {
        if self.state.is_terminal() || self.state == SchedulerState::Idle {
            self.state = SchedulerState::Queuing;
        }
        debug!(job_id = %job.id, "Queued job");
        self.queue.push(job);
    }

    /// The submission header for the given resources, in batch mode.
    pub fn compose_header(&self, resources: &Resources) -> Option<String> {
        self.batch.as_ref().map(|config| {
            compose_header(
                config,
                &HeaderContext {
                    resources,
                    log_dir: &self.log_dir,
                    email: self.email.as_deref(),
                },
            )
        })
    }

    /// The command line that dispatching `job` runs.
    pub fn rendered_command(&self, job: &Job) -> String {
        match self.compose_header(&job.resources) {
            Some(header) => render_job(&header, &job.id, &job.command),
            None => job.command.clone(),
        }
    }

    /// Lists queued commands for preview and returns the text.
    ///
    /// At most [`MAX_JOB_DISPLAY`] jobs are shown unless debug mode is on.
    /// The queue is left untouched, so repeated calls return the same text.
    pub fn print_jobs(&mut self) -> String {
        let mut output = String::new();
        let count = self.queue.len();

        if count == 0 {
            output.push_str("No jobs to run.");
        } else {
            output.push_str("Jobs to run:\n\n");
            for (index, job) in self.queue.iter().enumerate() {
                let _ = write!(output, "\t{}\n\n", self.rendered_command(job));
                if index + 1 == MAX_JOB_DISPLAY && count > MAX_JOB_DISPLAY && !self.debug {
                    let _ = writeln!(output, "\t...and {} more job(s).", count - MAX_JOB_DISPLAY);
                    break;
                }
            }
            output.push_str("Re-run with the '-submit' flag to launch these jobs.");
        }

        info!("{}", output);
        if count > 0 {
            self.state = SchedulerState::Printed;
        }
        output
    }

    /// Dispatches every queued job and clears the queue.
    ///
    /// A failed dispatch is recorded and the remaining jobs are still
    /// attempted.
    pub async fn submit_jobs(&mut self) -> DispatchReport {
        let mut report = DispatchReport::new();
        let jobs = std::mem::take(&mut self.queue);

        info!(
            cycle = %report.cycle_id,
            "Submitting {} job(s) {}.",
            jobs.len(),
            if self.is_batch() { "in batch" } else { "locally" }
        );

        if self.is_batch() {
            if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
                warn!("Could not create log directory {}: {}", self.log_dir.display(), e);
            }
        }

        for job in jobs {
            let command = self.rendered_command(&job);
            debug!(
                cycle = %report.cycle_id,
                job_id = %job.id,
                memory = %job.resources.memory,
                walltime = %job.resources.walltime,
                threads = job.resources.threads,
                "Dispatching via {}",
                self.client.name()
            );

            let result = self.client.dispatch(&job, &command).await;
            if let Err(ref e) = result {
                warn!(cycle = %report.cycle_id, "Dispatch failed: {}", e);
            }
            report.outcomes.push(DispatchOutcome {
                job_id: job.id,
                result,
            });
        }

        self.state = if self.is_batch() {
            SchedulerState::Submitted
        } else {
            SchedulerState::LocallyExecuted
        };

        info!(
            cycle = %report.cycle_id,
            "Dispatched {}/{} job(s)",
            report.succeeded(),
            report.len()
        );
        report
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("client", &self.client.name())
            .field("log_dir", &self.log_dir)
            .field("queued", &self.queue.len())
            .field("state", &self.state)
            .finish()
    }
}
