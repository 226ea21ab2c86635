//! Error types for fmri-postproc operations.
//!
//! Defines error types for each subsystem:
//! - Pipeline composition (registry lookup, preconditions, graph validation)
//! - Submission-string templating
//! - Job dispatch to a scheduler or local executor
//! - Project and batch-system configuration
//! - Dataset layout queries
//! - Stage execution

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while composing a pipeline graph.
///
/// Every variant is fatal for the single target being composed; sibling
/// targets run as separate jobs and are unaffected.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("The postprocessing pipeline requires at least 1 processing step")]
    EmptyPipeline,

    #[error("Unknown processing step '{0}'")]
    UnknownStep(String),

    #[error("Algorithm '{algorithm}' is not available for step '{step}'")]
    UnknownAlgorithm { step: String, algorithm: String },

    #[error("Processing step '{0}' appears more than once")]
    DuplicateStep(String),

    #[error("Missing TR corresponding to image: {}", .0.display())]
    MissingTr(PathBuf),

    #[error("No reference image provided for Resample; set 'ReferenceImage' in the configuration")]
    MissingReferenceImage,

    #[error("Step '{step}' requires a {input} file, but none was found")]
    MissingInput { step: String, input: String },

    #[error("Invalid value for '{key}' in step '{step}': {reason}")]
    InvalidParameter {
        step: String,
        key: String,
        reason: String,
    },

    #[error("Composed graph is invalid: {0}")]
    InvalidGraph(String),
}

/// Errors that can occur while rendering a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template field '{field}' has no value bound")]
    MissingTemplateField { field: String },
}

/// Errors that can occur while dispatching a single job.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn command for job '{job_id}': {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job '{job_id}' exited with status {code:?}")]
    NonZeroExit { job_id: String, code: Option<i32> },
}

/// Errors that can occur while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No config file provided")]
    MissingConfigFile,

    #[error("Unsupported config file extension for '{}': expected .json, .yaml or .yml", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("No stream found in configuration with name: {0}")]
    UnknownStream(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while querying the dataset layout.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("Dataset directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("No subjects found to process")]
    NoSubjectsFound,

    #[error("Requested subject not found: {0}")]
    SubjectNotFound(String),

    #[error("Image is not part of the dataset: {}", .0.display())]
    UnknownImage(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while executing a composed graph.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage '{stage}' failed: '{program}' exited with status {code:?}")]
    StageFailed {
        stage: String,
        program: String,
        code: Option<i32>,
    },

    #[error("Stage '{stage}' has no {port} input bound")]
    MissingBinding { stage: String, port: &'static str },

    #[error("Column '{column}' not found in {}", .path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("Empty confounds file: {}", .0.display())]
    EmptyConfounds(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
