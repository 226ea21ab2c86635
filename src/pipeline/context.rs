//! Execution inputs shared by every stage of one pipeline.

use std::path::{Path, PathBuf};

/// Which data stream a pipeline processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    /// The 4D BOLD image.
    #[default]
    Image,
    /// The tabular confounds series belonging to the image.
    Confounds,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Image => write!(f, "image"),
            Channel::Confounds => write!(f, "confounds"),
        }
    }
}

/// Inputs for composing one target's pipeline.
///
/// Only the image path is required. Everything else is optional and is
/// checked against the steps that declare a need for it when the pipeline is
/// composed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    /// The image being processed.
    pub image: PathBuf,
    /// Repetition time in seconds.
    pub tr: Option<f64>,
    /// Brain mask matching the image.
    pub mask: Option<PathBuf>,
    /// Raw confounds series for the image.
    pub confounds: Option<PathBuf>,
    /// ICA mixing matrix.
    pub mixing_file: Option<PathBuf>,
    /// Comma-separated list of noise component indices.
    pub noise_file: Option<PathBuf>,
    /// Where the processed image is exported.
    pub image_export: Option<PathBuf>,
    /// Where the processed confounds are exported.
    pub confounds_export: Option<PathBuf>,
}

impl ExecutionContext {
    /// Creates a context for an image with no optional inputs.
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            tr: None,
            mask: None,
            confounds: None,
            mixing_file: None,
            noise_file: None,
            image_export: None,
            confounds_export: None,
        }
    }

    pub fn with_tr(mut self, tr: f64) -> Self {
        self.tr = Some(tr);
        self
    }

    pub fn with_mask(mut self, mask: impl Into<PathBuf>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn with_confounds(mut self, confounds: impl Into<PathBuf>) -> Self {
        self.confounds = Some(confounds.into());
        self
    }

    pub fn with_aroma_files(
        mut self,
        mixing_file: impl Into<PathBuf>,
        noise_file: impl Into<PathBuf>,
    ) -> Self {
        self.mixing_file = Some(mixing_file.into());
        self.noise_file = Some(noise_file.into());
        self
    }

    pub fn with_image_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_export = Some(path.into());
        self
    }

    pub fn with_confounds_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.confounds_export = Some(path.into());
        self
    }

    /// Returns the primary input of a channel.
    pub fn primary_input(&self, channel: Channel) -> Option<&Path> {
        match channel {
            Channel::Image => Some(self.image.as_path()),
            Channel::Confounds => self.confounds.as_deref(),
        }
    }

    /// Returns the export sink of a channel.
    pub fn export_path(&self, channel: Channel) -> Option<&Path> {
        match channel {
            Channel::Image => self.image_export.as_deref(),
            Channel::Confounds => self.confounds_export.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_inputs_and_sinks() {
        let ctx = ExecutionContext::new("bold.nii.gz")
            .with_confounds("confounds.tsv")
            .with_image_export("out/bold.nii.gz");

        assert_eq!(ctx.primary_input(Channel::Image), Some(Path::new("bold.nii.gz")));
        assert_eq!(ctx.primary_input(Channel::Confounds), Some(Path::new("confounds.tsv")));
        assert_eq!(ctx.export_path(Channel::Image), Some(Path::new("out/bold.nii.gz")));
        assert_eq!(ctx.export_path(Channel::Confounds), None);
    }
}
