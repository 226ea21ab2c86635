//! Job scheduling for cluster and local execution.
//!
//! This module provides the infrastructure for dispatching postprocessing
//! work:
//!
//! - **Job**: One independently submittable command with resource requests
//! - **Header**: Batch-system directives rendered in front of each command
//! - **BatchScheduler**: Job queue with preview (`print_jobs`) and dispatch
//!   (`submit_jobs`) cycles
//! - **SchedulerClient**: Pluggable consumer of rendered commands, either a
//!   cluster submission command or local sequential execution
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Distributor  │
//!                      └──────┬───────┘
//!                             │ add_job
//!                      ┌──────▼───────┐
//!                      │BatchScheduler│  header + {jobid} + {cmdwrap}
//!                      └──────┬───────┘
//!                             │ dispatch
//!                 ┌───────────┴───────────┐
//!                 ▼                       ▼
//!          ┌─────────────┐         ┌─────────────┐
//!          │ClusterClient│         │LocalExecutor│
//!          │  (sbatch)   │         │ (sequential)│
//!          └─────────────┘         └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fmri_postproc::scheduler::{BatchScheduler, BatchSystemConfig, Job};
//!
//! let mut scheduler = BatchScheduler::new(Some(BatchSystemConfig::slurm()), "logs/postproc_logs");
//! scheduler.add_job(Job::new("Postprocessing_sub-01", "fmri-postproc subject 01 ..."));
//!
//! // Preview, then dispatch
//! scheduler.print_jobs();
//! let report = scheduler.submit_jobs().await;
//! for failure in report.failures() {
//!     eprintln!("{}: {:?}", failure.job_id, failure.result);
//! }
//! ```

pub mod batch;
pub mod client;
pub mod header;
pub mod job;

// Re-export main types for convenience
pub use batch::{BatchScheduler, DispatchOutcome, DispatchReport, SchedulerState, MAX_JOB_DISPLAY};
pub use client::{ClusterClient, LocalExecutor, SchedulerClient};
pub use header::{compose_header, render_job, BatchSystemConfig, HeaderContext, SubmissionOption};
pub use job::{Job, Resources};
