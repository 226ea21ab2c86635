//! fmri-postproc: postprocessing of fMRIPrep derivatives.
//!
//! This library composes per-image stage graphs from a declarative step list
//! and distributes subject- and image-level jobs to a batch scheduler or the
//! local session.

pub mod cli;
pub mod config;
pub mod distributor;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod postprocess;
pub mod scheduler;
pub mod template;

// Re-export commonly used error types
pub use error::{
    CompositionError, ConfigError, DispatchError, ExecutionError, LayoutError, TemplateError,
};
