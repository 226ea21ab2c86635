//! Turns processing targets into scheduled jobs.
//!
//! A [`Distributor`] owns a submission template, the values shared by every
//! job (program, directories, flags) and the resources to request. For each
//! target it binds the target's own values, renders the command, and hands a
//! [`Job`] to the [`BatchScheduler`]. A target that cannot be rendered or
//! prepared is logged and skipped; the rest are still queued.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::scheduler::{BatchScheduler, Job, Resources};
use crate::template::{JobTemplate, TemplateBag};

/// Prefix of subject-level job ids.
pub const SUBJECT_JOB_PREFIX: &str = "Postprocessing_sub-";

/// What one job processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One job per subject.
    Subject,
    /// One job per image.
    Image,
}

/// A subject and, for image-level work, its images plus the directories
/// their jobs write into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectTargets {
    pub subject_id: String,
    pub images: Vec<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl SubjectTargets {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }
}

/// One unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDescriptor<'a> {
    Subject(&'a SubjectTargets),
    Image {
        subject: &'a SubjectTargets,
        image: &'a Path,
    },
}

impl<'a> TargetDescriptor<'a> {
    pub fn subject(&self) -> &'a SubjectTargets {
        match *self {
            Self::Subject(subject) | Self::Image { subject, .. } => subject,
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Subject(_) => Granularity::Subject,
            Self::Image { .. } => Granularity::Image,
        }
    }

    /// Deterministic job id: `Postprocessing_sub-<id>` for subjects, the
    /// image file name without any extension for images.
    pub fn job_id(&self) -> String {
        match self {
            Self::Subject(subject) => format!("{SUBJECT_JOB_PREFIX}{}", subject.subject_id),
            Self::Image { image, .. } => image_job_id(image),
        }
    }

    fn bind(&self, bag: &mut TemplateBag) {
        let subject = self.subject();
        bag.insert("subject_id", &subject.subject_id);

        if let Self::Image { image, .. } = self {
            bag.insert("image_path", image.display());
            if let Some(dir) = &subject.out_dir {
                bag.insert("subject_out_dir", dir.display());
            }
            if let Some(dir) = &subject.working_dir {
                bag.insert("subject_working_dir", dir.display());
            }
        }
    }

    fn prepare(&self) -> std::io::Result<()> {
        if let Self::Image { subject, .. } = self {
            for dir in [&subject.out_dir, &subject.working_dir].into_iter().flatten() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// The file name of `image` with every extension removed.
pub fn image_job_id(image: &Path) -> String {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name,
    }
}

/// Lazy iterator over the targets of a listing. A clone continues from the
/// same position independently of the iterator it was cloned from.
#[derive(Debug, Clone)]
pub struct Targets<'a> {
    listing: &'a [SubjectTargets],
    granularity: Granularity,
    subject: usize,
    image: usize,
}

impl<'a> Iterator for Targets<'a> {
    type Item = TargetDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let subject = self.listing.get(self.subject)?;
            match self.granularity {
                Granularity::Subject => {
                    self.subject += 1;
                    return Some(TargetDescriptor::Subject(subject));
                }
                Granularity::Image => {
                    if let Some(image) = subject.images.get(self.image) {
                        self.image += 1;
                        return Some(TargetDescriptor::Image { subject, image });
                    }
                    self.subject += 1;
                    self.image = 0;
                }
            }
        }
    }
}

/// What a distribution pass queued and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionSummary {
    pub queued: Vec<String>,
    pub skipped: Vec<String>,
}

/// Renders targets into jobs.
#[derive(Debug, Clone)]
pub struct Distributor {
    template: JobTemplate,
    shared: TemplateBag,
    resources: Resources,
}

impl Distributor {
    pub fn new(template: JobTemplate, shared: TemplateBag, resources: Resources) -> Self {
        Self {
            template,
            shared,
            resources,
        }
    }

    /// Walks `listing` at the given granularity.
    pub fn enumerate(listing: &[SubjectTargets], granularity: Granularity) -> Targets<'_> {
        Targets {
            listing,
            granularity,
            subject: 0,
            image: 0,
        }
    }

    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    /// Renders the command for one target.
    pub fn render(&self, target: &TargetDescriptor<'_>) -> Result<String, crate::error::TemplateError> {
        let mut bag = self.shared.clone();
        target.bind(&mut bag);
        self.template.render(&bag)
    }

    /// Renders every target and queues the resulting jobs on `scheduler`.
    ///
    /// Image targets get their output and working directories created
    /// before their job is queued.
    pub fn distribute<'a>(
        &self,
        targets: impl IntoIterator<Item = TargetDescriptor<'a>>,
        scheduler: &mut BatchScheduler,
    ) -> DistributionSummary {
        let mut summary = DistributionSummary::default();

        for target in targets {
            let job_id = target.job_id();

            let command = match self.render(&target) {
                Ok(command) => command,
                Err(e) => {
                    warn!(job_id = %job_id, "Skipping target: {}", e);
                    summary.skipped.push(job_id);
                    continue;
                }
            };

            if let Err(e) = target.prepare() {
                warn!(job_id = %job_id, "Skipping target, could not create directories: {}", e);
                summary.skipped.push(job_id);
                continue;
            }

            debug!(job_id = %job_id, "{}", command);
            scheduler.add_job(Job::new(job_id.clone(), command).with_resources(self.resources.clone()));
            summary.queued.push(job_id);
        }

        info!(
            "Queued {} job(s), skipped {}",
            summary.queued.len(),
            summary.skipped.len()
        );
        summary
    }
}
