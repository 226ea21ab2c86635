//! Postprocessing entry flows.
//!
//! Work fans out over three levels, each of which may run as its own
//! process on the cluster:
//!
//! 1. [`postprocess_subjects`] queues one job per subject.
//! 2. [`postprocess_subject`] resolves the processing stream and queues one
//!    job per image of the subject.
//! 3. [`postprocess_image`] composes and runs the stage graphs of one image.

mod image;

pub use image::{
    build_export_path, pipeline_name, postprocess_image, postprocess_image_with, ImageOutcome,
    ImageRequest, PROCESSING_GRAPH_FILE_NAME,
};

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::{subject_working_dir, ProjectConfig, DEFAULT_PROCESSING_STREAM};
use crate::distributor::{Distributor, Granularity, SubjectTargets};
use crate::layout::{DatasetLayout, FsLayout, ImageQuery};
use crate::scheduler::{BatchScheduler, Resources};
use crate::template::{JobTemplate, TemplateBag};

/// Program name used in submission strings when the running executable
/// cannot be determined.
pub const PROGRAM_NAME: &str = "fmri-postproc";

/// Subdirectory of the log directory used by subject-level jobs.
pub const DISTRIBUTOR_LOG_DIR: &str = "distributor";

/// The command that submission strings invoke.
pub fn current_program() -> String {
    std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| PROGRAM_NAME.to_string())
}

/// Shared run flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFlags {
    /// Use the configured batch system instead of running locally.
    pub batch: bool,
    /// Dispatch jobs instead of printing them.
    pub submit: bool,
    pub debug: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            batch: true,
            submit: false,
            debug: false,
        }
    }
}

impl RunFlags {
    fn bind(&self, bag: TemplateBag) -> TemplateBag {
        bag.with_flag("batch", !self.batch, "-no-batch")
            .with_flag("submit", self.submit, "-submit")
            .with_flag("debug", self.debug, "-debug")
    }
}

/// Inputs of [`postprocess_subjects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectsRequest {
    pub config_file: PathBuf,
    /// Subjects to process; empty processes every subject.
    pub subjects: Vec<String>,
    pub processing_stream: String,
    pub fmriprep_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub flags: RunFlags,
    pub program: String,
}

impl SubjectsRequest {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            subjects: Vec::new(),
            processing_stream: DEFAULT_PROCESSING_STREAM.to_string(),
            fmriprep_dir: None,
            output_dir: None,
            log_dir: None,
            flags: RunFlags::default(),
            program: PROGRAM_NAME.to_string(),
        }
    }
}

/// Inputs of [`postprocess_subject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRequest {
    pub subject_id: String,
    pub bids_dir: PathBuf,
    pub fmriprep_dir: PathBuf,
    pub output_dir: PathBuf,
    pub processing_stream: String,
    pub config_file: PathBuf,
    pub index_dir: PathBuf,
    pub log_dir: PathBuf,
    pub flags: RunFlags,
    pub program: String,
}

pub(crate) fn load_config(path: &Path) -> Result<ProjectConfig> {
    let config = ProjectConfig::load(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn build_scheduler(
    config: &ProjectConfig,
    flags: &RunFlags,
    log_dir: PathBuf,
) -> Result<BatchScheduler> {
    let batch = if flags.batch {
        config.batch_system()?
    } else {
        None
    };
    if flags.batch && batch.is_none() {
        info!("No batch configuration set, running locally");
    }

    let mut scheduler = BatchScheduler::new(batch, log_dir).with_debug(flags.debug);
    if let Some(email) = config.email() {
        scheduler = scheduler.with_email(email);
    }
    Ok(scheduler)
}

async fn print_or_submit(scheduler: &mut BatchScheduler, submit: bool) -> Result<()> {
    if !submit {
        scheduler.print_jobs();
        return Ok(());
    }

    let report = scheduler.submit_jobs().await;
    let failed = report.len() - report.succeeded();
    if failed > 0 {
        for failure in report.failures() {
            if let Err(e) = &failure.result {
                warn!(job_id = %failure.job_id, "{}", e);
            }
        }
        bail!("{} of {} job(s) failed to dispatch", failed, report.len());
    }
    Ok(())
}

/// Queues one subject-level job per selected subject.
pub async fn postprocess_subjects(request: SubjectsRequest) -> Result<()> {
    let config = load_config(&request.config_file)?;
    let stream = &request.processing_stream;
    config.stream_options(stream)?;

    let fmriprep_dir = request.fmriprep_dir.clone().unwrap_or_else(|| config.fmriprep_dir());
    let output_dir = request.output_dir.clone().unwrap_or_else(|| config.output_dir());
    let log_dir = request.log_dir.clone().unwrap_or_else(|| config.log_dir());
    info!("Distributing subjects from {}", fmriprep_dir.display());

    let layout = FsLayout::open(&fmriprep_dir)?;
    let subjects = layout.select_subjects(&request.subjects)?;
    info!("Processing requested for {} subject(s)", subjects.len());

    let mut scheduler = build_scheduler(&config, &request.flags, log_dir.join(DISTRIBUTOR_LOG_DIR))?;

    let shared = request.flags.bind(
        TemplateBag::new()
            .with("program", &request.program)
            .with("bids_dir", config.bids_dir().display())
            .with("fmriprep_dir", fmriprep_dir.display())
            .with("output_dir", output_dir.display())
            .with("processing_stream", stream)
            .with("config_file", request.config_file.display())
            .with("index_dir", config.index_dir().display())
            .with("log_dir", log_dir.display()),
    );

    let listing: Vec<SubjectTargets> = subjects.into_iter().map(SubjectTargets::new).collect();
    let distributor = Distributor::new(JobTemplate::subject(), shared, Resources::non_processing());
    distributor.distribute(Distributor::enumerate(&listing, Granularity::Subject), &mut scheduler);

    print_or_submit(&mut scheduler, request.flags.submit).await
}

/// Queues one image-level job per image of a subject.
pub async fn postprocess_subject(request: SubjectRequest) -> Result<()> {
    let subject_id = request
        .subject_id
        .strip_prefix("sub-")
        .unwrap_or(&request.subject_id)
        .to_string();
    info!("Processing subject: {}", subject_id);

    let log_dir = request.log_dir.join(format!("sub-{subject_id}"));
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let config = load_config(&request.config_file)?;
    let stream = &request.processing_stream;
    let stream_dir = request.output_dir.join(stream);
    let options = config.stream_options(stream)?;
    options.write_processing_description(&stream_dir)?;

    let layout = FsLayout::open(&request.fmriprep_dir)?;
    layout.select_subjects(std::slice::from_ref(&subject_id))?;

    if options.target_tasks.is_empty() {
        warn!("'TargetTasks' not set, defaulting to all tasks");
    }
    if options.target_acquisitions.is_empty() {
        warn!("'TargetAcquisitions' not set, defaulting to all acquisitions");
    }
    let query = ImageQuery::new(&options.target_image_space)
        .with_tasks(options.target_tasks.clone())
        .with_acquisitions(options.target_acquisitions.clone());
    let images = layout.images(&subject_id, &query);
    if images.is_empty() {
        warn!(
            "No images found for sub-{} in space {}",
            subject_id, options.target_image_space
        );
    }

    let working_dir = Some(options.working_directory.trim())
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from);
    let subject_out_dir = stream_dir.join(format!("sub-{subject_id}"));
    let subject_working_dir =
        subject_working_dir(working_dir.as_deref(), &request.output_dir, &subject_id, stream);

    let mut scheduler = build_scheduler(&config, &request.flags, log_dir.clone())?;
    let resources = options.batch_options.resources(scheduler.default_resources());

    let shared = TemplateBag::new()
        .with("program", &request.program)
        .with("config_file", request.config_file.display())
        .with("bids_dir", request.bids_dir.display())
        .with("fmriprep_dir", request.fmriprep_dir.display())
        .with("pybids_db_path", request.index_dir.display())
        .with("out_dir", request.output_dir.display())
        .with("processing_stream", stream)
        .with("log_dir", log_dir.display())
        .with_flag("debug", request.flags.debug, "-debug");

    let listing = [SubjectTargets::new(&subject_id)
        .with_images(images)
        .with_out_dir(subject_out_dir)
        .with_working_dir(subject_working_dir)];
    let distributor = Distributor::new(JobTemplate::image(), shared, resources);
    distributor.distribute(Distributor::enumerate(&listing, Granularity::Image), &mut scheduler);

    print_or_submit(&mut scheduler, request.flags.submit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_flags_render_legacy_spellings() {
        let flags = RunFlags {
            batch: false,
            submit: true,
            debug: false,
        };
        let bag = flags.bind(TemplateBag::new());
        assert_eq!(bag.get("batch"), Some("-no-batch"));
        assert_eq!(bag.get("submit"), Some("-submit"));
        assert_eq!(bag.get("debug"), Some(""));

        let bag = RunFlags::default().bind(TemplateBag::new());
        assert_eq!(bag.get("batch"), Some(""));
    }

    #[tokio::test]
    async fn test_print_or_submit_reports_failures() {
        let mut scheduler = BatchScheduler::local("/tmp/logs");
        scheduler.add_job(crate::scheduler::Job::new("ok", "true"));
        scheduler.add_job(crate::scheduler::Job::new("bad", "exit 1"));

        let err = print_or_submit(&mut scheduler, true).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert!(scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let request = SubjectsRequest::new(dir.path().join("missing.json"));
        let err = postprocess_subjects(request).await.unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
