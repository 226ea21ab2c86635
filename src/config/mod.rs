//! Project configuration.
//!
//! The project configuration file is JSON or YAML, chosen by extension, with
//! PascalCase keys:
//!
//! ```json
//! {
//!   "ProjectDirectory": "/proj/study",
//!   "EmailAddress": "me@example.org",
//!   "BatchConfig": "slurmUNCConfig.json",
//!   "FMRIPrepOptions": {"BIDSDirectory": "...", "OutputDirectory": "..."},
//!   "PostProcessingOptions": {"ProcessingSteps": ["TemporalFiltering"], "...": "..."},
//!   "ProcessingStreams": [{"ProcessingStream": "smooth", "PostProcessingOptions": {}}]
//! }
//! ```
//!
//! Unknown keys are ignored and missing keys take their defaults.

pub mod postprocessing;

pub use postprocessing::{
    resolve_stream, BatchOptions, ConfoundOptions, MotionOutliers, PostProcessingOptions,
    ProcessingStream, DEFAULT_PROCESSING_STREAM, PROCESSING_DESCRIPTION_FILE_NAME,
};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::scheduler::BatchSystemConfig;

/// Default postprocessing output directory, relative to the project.
pub const DEFAULT_OUTPUT_DIR: &str = "data_postproc";
/// Default log directory, relative to the project.
pub const DEFAULT_LOG_DIR: &str = "logs/postproc_logs";
/// Default dataset index directory, relative to the project.
pub const DEFAULT_INDEX_DIR: &str = "bids_index";

/// Where fMRIPrep inputs and outputs live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmriprepOptions {
    #[serde(rename = "BIDSDirectory")]
    pub bids_directory: String,
    #[serde(rename = "OutputDirectory")]
    pub output_directory: String,
}

/// The project configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProjectConfig {
    pub project_directory: String,
    pub email_address: String,
    /// Batch-system configuration: a JSON file, the name `slurm`, or empty
    /// for local execution.
    pub batch_config: String,
    #[serde(rename = "FMRIPrepOptions")]
    pub fmriprep_options: FmriprepOptions,
    pub post_processing_options: PostProcessingOptions,
    pub processing_streams: Vec<ProcessingStream>,
}

impl ProjectConfig {
    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let config = match extension.as_deref() {
            Some("json") => serde_json::from_str(&contents)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`ProjectConfig::load`], failing when no path is given.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(path.ok_or(ConfigError::MissingConfigFile)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_directory.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "ProjectDirectory cannot be empty".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for stream in &self.processing_streams {
            if stream.processing_stream == DEFAULT_PROCESSING_STREAM {
                return Err(ConfigError::ValidationFailed(format!(
                    "processing stream name '{DEFAULT_PROCESSING_STREAM}' is reserved"
                )));
            }
            if !names.insert(stream.processing_stream.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "processing stream '{}' is defined more than once",
                    stream.processing_stream
                )));
            }
        }

        Ok(())
    }

    pub fn project_dir(&self) -> PathBuf {
        PathBuf::from(&self.project_directory)
    }

    /// Resolves the postprocessing options for a processing stream.
    pub fn stream_options(&self, stream: &str) -> Result<PostProcessingOptions, ConfigError> {
        resolve_stream(&self.post_processing_options, &self.processing_streams, stream)
    }

    /// The fMRIPrep derivatives to process: `TargetDirectory`, else the
    /// fMRIPrep output directory (or its `fmriprep/` subdirectory when the
    /// older layout is used).
    pub fn fmriprep_dir(&self) -> PathBuf {
        let target = self.post_processing_options.target_directory.trim();
        if !target.is_empty() {
            return PathBuf::from(target);
        }

        let output = PathBuf::from(&self.fmriprep_options.output_directory);
        let nested = output.join("fmriprep");
        if nested.is_dir() {
            nested
        } else {
            output
        }
    }

    pub fn bids_dir(&self) -> PathBuf {
        PathBuf::from(&self.fmriprep_options.bids_directory)
    }

    /// `OutputDirectory`, else `<project>/data_postproc`.
    pub fn output_dir(&self) -> PathBuf {
        non_empty(&self.post_processing_options.output_directory)
            .unwrap_or_else(|| self.project_dir().join(DEFAULT_OUTPUT_DIR))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.project_dir().join(DEFAULT_LOG_DIR)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.project_dir().join(DEFAULT_INDEX_DIR)
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        non_empty(&self.post_processing_options.working_directory)
    }

    /// The email address, if one is set.
    pub fn email(&self) -> Option<&str> {
        let email = self.email_address.trim();
        (!email.is_empty()).then_some(email)
    }

    /// Loads the batch-system configuration; `None` means local execution.
    ///
    /// Relative paths are resolved against the project directory. A name
    /// starting with `slurm` that does not exist on disk selects the
    /// built-in SLURM preset.
    pub fn batch_system(&self) -> Result<Option<BatchSystemConfig>, ConfigError> {
        let name = self.batch_config.trim();
        if name.is_empty() {
            return Ok(None);
        }

        let path = Path::new(name);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir().join(path)
        };

        if path.is_file() {
            return BatchSystemConfig::load(&path).map(Some);
        }

        if name.to_ascii_lowercase().starts_with("slurm") {
            info!("Using built-in SLURM batch configuration");
            return Ok(Some(BatchSystemConfig::slurm()));
        }

        Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("batch configuration not found: {}", path.display()),
        )))
    }
}

fn non_empty(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// Working directory for one subject within a stream:
/// `<working>/<stream>/sub-<id>`, or `<output>/working/<stream>/sub-<id>` when
/// no working directory is configured.
pub fn subject_working_dir(
    working_dir: Option<&Path>,
    output_dir: &Path,
    subject_id: &str,
    stream: &str,
) -> PathBuf {
    let base = match working_dir {
        Some(dir) => dir.to_path_buf(),
        None => output_dir.join("working"),
    };
    base.join(stream).join(format!("sub-{subject_id}"))
}
