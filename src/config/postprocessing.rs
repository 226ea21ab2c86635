//! Postprocessing options and processing-stream resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::ConfigError;
use crate::scheduler::Resources;

/// Name of the stream that uses the base postprocessing options unchanged.
pub const DEFAULT_PROCESSING_STREAM: &str = "default";

/// Sidecar written next to each stream's outputs.
pub const PROCESSING_DESCRIPTION_FILE_NAME: &str = "processing_description.json";

fn default_true() -> bool {
    true
}

/// Options for flagging high-motion volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MotionOutliers {
    pub include: bool,
    pub scrub_var: String,
    pub threshold: f64,
    pub scrub_ahead: u32,
    pub scrub_behind: u32,
    pub scrub_contiguous: u32,
}

impl Default for MotionOutliers {
    fn default() -> Self {
        Self {
            include: false,
            scrub_var: "framewise_displacement".to_string(),
            threshold: 0.0,
            scrub_ahead: 0,
            scrub_behind: 0,
            scrub_contiguous: 0,
        }
    }
}

/// Options for the confounds series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfoundOptions {
    /// Columns kept for regression; empty keeps every column.
    pub columns: Vec<String>,
    pub motion_outliers: MotionOutliers,
}

/// Resource requests for image-level jobs. Empty values fall back to the
/// batch-system defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BatchOptions {
    pub memory_usage: String,
    pub time_usage: String,
    #[serde(rename = "NThreads", deserialize_with = "string_or_number")]
    pub n_threads: String,
}

impl BatchOptions {
    /// Overlays the configured values onto `defaults`.
    pub fn resources(&self, defaults: Resources) -> Resources {
        let pick = |value: &str, fallback: String| {
            if value.trim().is_empty() {
                fallback
            } else {
                value.trim().to_string()
            }
        };
        Resources {
            memory: pick(&self.memory_usage, defaults.memory),
            walltime: pick(&self.time_usage, defaults.walltime),
            threads: self.n_threads.trim().parse().unwrap_or(defaults.threads),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

/// Options controlling one postprocessing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PostProcessingOptions {
    pub working_directory: String,
    #[serde(default = "default_true")]
    pub write_process_graph: bool,
    /// fMRIPrep derivatives to process; empty uses the fMRIPrep output directory.
    pub target_directory: String,
    pub target_image_space: String,
    /// Tasks to process; empty processes every task.
    pub target_tasks: Vec<String>,
    /// Acquisitions to process; empty processes every acquisition.
    pub target_acquisitions: Vec<String>,
    pub output_directory: String,
    pub processing_steps: Vec<String>,
    pub processing_step_options: BTreeMap<String, Value>,
    pub confound_options: ConfoundOptions,
    pub batch_options: BatchOptions,
}

impl Default for PostProcessingOptions {
    fn default() -> Self {
        Self {
            working_directory: String::new(),
            write_process_graph: true,
            target_directory: String::new(),
            target_image_space: "MNI152NLin2009cAsym".to_string(),
            target_tasks: Vec::new(),
            target_acquisitions: Vec::new(),
            output_directory: String::new(),
            processing_steps: Vec::new(),
            processing_step_options: BTreeMap::new(),
            confound_options: ConfoundOptions::default(),
            batch_options: BatchOptions::default(),
        }
    }
}

impl PostProcessingOptions {
    /// Copy with step options pruned to the enabled steps.
    pub fn pruned(&self) -> Self {
        let mut pruned = self.clone();
        pruned
            .processing_step_options
            .retain(|step, _| self.processing_steps.contains(step));
        pruned
    }

    /// Writes the processing description sidecar into `stream_dir`,
    /// replacing any earlier one.
    pub fn write_processing_description(&self, stream_dir: &Path) -> Result<PathBuf, ConfigError> {
        std::fs::create_dir_all(stream_dir)?;
        let path = stream_dir.join(PROCESSING_DESCRIPTION_FILE_NAME);
        let json = serde_json::to_string_pretty(&self.pruned())?;
        std::fs::write(&path, json)?;
        info!("Wrote processing description: {}", path.display());
        Ok(path)
    }
}

/// A named set of overrides for the base postprocessing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessingStream {
    pub processing_stream: String,
    #[serde(default)]
    pub post_processing_options: Value,
}

/// Resolves the options of `stream`.
///
/// The default stream returns `base` unchanged. Any other stream deep-merges
/// its overrides into `base`: nested maps merge key by key and every other
/// value replaces the base value.
pub fn resolve_stream(
    base: &PostProcessingOptions,
    streams: &[ProcessingStream],
    stream: &str,
) -> Result<PostProcessingOptions, ConfigError> {
    if stream == DEFAULT_PROCESSING_STREAM {
        return Ok(base.clone());
    }

    let overrides = streams
        .iter()
        .find(|s| s.processing_stream == stream)
        .ok_or_else(|| ConfigError::UnknownStream(stream.to_string()))?;

    let mut merged = serde_json::to_value(base)?;
    deep_update(&mut merged, &overrides.post_processing_options);
    Ok(serde_json::from_value(merged)?)
}

fn deep_update(target: &mut Value, updates: &Value) {
    if let (Value::Object(target), Value::Object(updates)) = (&mut *target, updates) {
        merge_maps(target, updates);
        return;
    }
    *target = updates.clone();
}

fn merge_maps(target: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (key, value) in updates {
        match target.get_mut(key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_update(existing, value)
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
