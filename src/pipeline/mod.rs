//! Pipeline composition and execution for fMRI postprocessing.
//!
//! This module turns an ordered list of processing-step names into a
//! validated stage graph and runs it.
//!
//! # Architecture
//!
//! - **Registry**: Closed table of processing steps and their algorithms
//! - **Composer**: Checks preconditions and wires stages into a linear graph
//! - **Graph**: Ordered stages plus source, internal and sink edges
//! - **Runner**: Executes each stage's external tools in its own directory
//!
//! # Channels
//!
//! A pipeline is composed for one channel. The image channel runs every
//! configured step on the BOLD image. The confounds channel runs only the
//! time-domain steps (temporal filtering, AROMA regression, timepoint
//! trimming) on the confounds series, so that regressors stay aligned with
//! the processed image.
//!
//! # Example
//!
//! ```rust,ignore
//! use fmri_postproc::pipeline::{
//!     ExecutionContext, GraphRunner, PipelineComposer, PipelineConfig, ProcessingStepSpec,
//! };
//!
//! let config = PipelineConfig::new(vec![
//!     ProcessingStepSpec::new("TemporalFiltering", "Butterworth")
//!         .with_parameter("FilteringHighPass", 0.008),
//!     ProcessingStepSpec::new("SpatialSmoothing", "SUSAN").with_parameter("FWHM", 6),
//! ]);
//!
//! let context = ExecutionContext::new("sub-01_task-rest_desc-preproc_bold.nii.gz")
//!     .with_tr(2.0)
//!     .with_image_export("out/sub-01_task-rest_desc-postproc_bold.nii.gz");
//!
//! let graph = PipelineComposer::new().compose(&config, &context)?;
//! GraphRunner::new("working").run(&graph).await?;
//! ```

pub mod composer;
pub mod config;
pub mod context;
pub mod graph;
pub mod registry;
pub mod runner;
pub mod stage;

// Re-export main types for convenience
pub use composer::{compose_confounds, has_preparation_steps, PipelineComposer};
pub use config::{PipelineConfig, ProcessingStepSpec};
pub use context::{Channel, ExecutionContext};
pub use graph::{ConfoundWiring, Edge, Endpoint, PipelineGraph};
pub use registry::{AlgorithmKind, StageFactory, StageRegistry, StepKind};
pub use runner::{select_confound_columns, GraphRunner, ProcessRunner, ToolOutput, ToolRunner};
pub use stage::{Port, Stage, StageParams, ToolArg, ToolInvocation};
