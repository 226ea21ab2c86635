//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: One independently submittable unit of work
//! - `Resources`: Memory, walltime and thread requests for a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default memory request, in megabytes.
pub const DEFAULT_MEMORY: &str = "5000";

/// Default walltime request.
pub const DEFAULT_WALLTIME: &str = "2:0:0";

/// Default thread count.
pub const DEFAULT_THREADS: u32 = 1;

/// Resource requests rendered into the scheduler header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory request in the scheduler's own unit (e.g. `5000` or `5G`).
    pub memory: String,
    /// Walltime request, e.g. `2:0:0`.
    pub walltime: String,
    /// Number of threads.
    pub threads: u32,
}

impl Resources {
    pub fn new(memory: impl Into<String>, walltime: impl Into<String>, threads: u32) -> Self {
        Self {
            memory: memory.into(),
            walltime: walltime.into(),
            threads,
        }
    }

    /// Requests for jobs that only plan and submit further work.
    pub fn non_processing() -> Self {
        Self::new("2000", "0:30:0", 1)
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY, DEFAULT_WALLTIME, DEFAULT_THREADS)
    }
}

/// A job representing a unit of work to be executed.
///
/// Jobs are created by the distributor and owned by the batch scheduler
/// until they are dispatched. Nothing about a job is kept after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic identifier, e.g. `Postprocessing_sub-01`.
    pub id: String,
    /// The command line the job runs.
    pub command: String,
    /// Resources requested from the scheduler.
    pub resources: Resources,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job with default resources.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            resources: Resources::default(),
            created_at: Utc::now(),
        }
    }

    /// Sets the resource requests.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}
