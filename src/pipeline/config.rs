//! Declarative pipeline configuration.
//!
//! A [`PipelineConfig`] is the ordered list of processing steps a single
//! target will run, each bound to an algorithm name and a free-form parameter
//! map. It is derived from the resolved postprocessing options of a
//! processing stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PostProcessingOptions;
use crate::error::CompositionError;

use super::registry::StepKind;

/// Step option keys that name the algorithm, in lookup order.
const ALGORITHM_KEYS: [&str; 2] = ["Algorithm", "Implementation"];

/// One entry of the ordered step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStepSpec {
    /// Step name, e.g. `TemporalFiltering`.
    pub name: String,
    /// Algorithm name, e.g. `Butterworth`.
    pub algorithm: String,
    /// Remaining step options.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ProcessingStepSpec {
    /// Creates a step with no parameters.
    pub fn new(name: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            algorithm: algorithm.into(),
            parameters: Map::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Builds a step from its name and its entry in `ProcessingStepOptions`.
    ///
    /// The algorithm is taken from the `Algorithm` key (or its older alias
    /// `Implementation`). Steps with a single implementation fall back to
    /// their default algorithm when neither key is set.
    pub fn from_options(name: &str, options: Option<&Value>) -> Self {
        let mut parameters = options
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let named: Vec<String> = ALGORITHM_KEYS
            .iter()
            .filter_map(|key| parameters.remove(*key))
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        let configured = named.into_iter().find(|value| !value.is_empty());

        let algorithm = configured
            .or_else(|| {
                StepKind::from_name(name)
                    .and_then(StepKind::default_algorithm)
                    .map(|alg| alg.name().to_string())
            })
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            algorithm,
            parameters,
        }
    }

    /// Reads a numeric parameter, falling back to `default` when absent.
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, CompositionError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or_else(|| self.invalid(key, format!("expected a number, got {value}"))),
        }
    }

    /// Reads a non-negative integer parameter, falling back to `default` when absent.
    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32, CompositionError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    self.invalid(key, format!("expected a non-negative integer, got {value}"))
                }),
        }
    }

    /// Reads a string parameter; absent and empty strings both yield `None`.
    pub fn string(&self, key: &str) -> Result<Option<String>, CompositionError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {other}"))),
        }
    }

    /// Reads a list-of-strings parameter.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, CompositionError> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.invalid(key, format!("expected strings, got {item}")))
                })
                .collect(),
            Some(other) => Err(self.invalid(key, format!("expected a list, got {other}"))),
        }
    }

    fn invalid(&self, key: &str, reason: String) -> CompositionError {
        CompositionError::InvalidParameter {
            step: self.name.clone(),
            key: key.to_string(),
            reason,
        }
    }
}

/// Ordered step list for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Steps in execution order.
    pub steps: Vec<ProcessingStepSpec>,
    /// Confound columns to keep before regression; empty keeps all columns.
    #[serde(default)]
    pub confound_columns: Vec<String>,
}

impl PipelineConfig {
    /// Creates a configuration from an ordered step list.
    pub fn new(steps: Vec<ProcessingStepSpec>) -> Self {
        Self {
            steps,
            confound_columns: Vec::new(),
        }
    }

    /// Sets the confound column selection.
    pub fn with_confound_columns(mut self, columns: Vec<String>) -> Self {
        self.confound_columns = columns;
        self
    }

    /// Builds the step list from resolved postprocessing options.
    ///
    /// A `Columns` entry on the `ConfoundRegression` step takes precedence
    /// over `ConfoundOptions.Columns`.
    pub fn from_options(options: &PostProcessingOptions) -> Self {
        let steps: Vec<ProcessingStepSpec> = options
            .processing_steps
            .iter()
            .map(|name| {
                ProcessingStepSpec::from_options(name, options.processing_step_options.get(name))
            })
            .collect();

        let step_columns = steps
            .iter()
            .find(|step| step.name == StepKind::ConfoundRegression.name())
            .and_then(|step| step.string_list("Columns").ok())
            .filter(|columns| !columns.is_empty());

        Self {
            steps,
            confound_columns: step_columns
                .unwrap_or_else(|| options.confound_options.columns.clone()),
        }
    }

    /// Returns true if a step with the given kind is configured.
    pub fn contains(&self, kind: StepKind) -> bool {
        self.steps.iter().any(|step| step.name == kind.name())
    }

    /// Returns the first step with the given kind.
    pub fn step(&self, kind: StepKind) -> Option<&ProcessingStepSpec> {
        self.steps.iter().find(|step| step.name == kind.name())
    }

    /// Returns the number of configured steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps are configured.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_options_reads_algorithm_key() {
        let options = json!({"Algorithm": "Butterworth", "FilteringHighPass": 0.008});
        let spec = ProcessingStepSpec::from_options("TemporalFiltering", Some(&options));

        assert_eq!(spec.algorithm, "Butterworth");
        assert!(!spec.parameters.contains_key("Algorithm"));
        assert_eq!(spec.f64_or("FilteringHighPass", -1.0).unwrap(), 0.008);
    }

    #[test]
    fn test_from_options_implementation_alias() {
        let options = json!({"Implementation": "SUSAN", "FWHM": 6});
        let spec = ProcessingStepSpec::from_options("SpatialSmoothing", Some(&options));

        assert_eq!(spec.algorithm, "SUSAN");
        assert_eq!(spec.f64_or("FWHM", 0.0).unwrap(), 6.0);
    }

    #[test]
    fn test_from_options_default_algorithm() {
        let spec = ProcessingStepSpec::from_options("Resample", None);
        assert_eq!(spec.algorithm, "FLIRT");

        let spec = ProcessingStepSpec::from_options("TemporalFiltering", None);
        assert_eq!(spec.algorithm, "");
    }

    #[test]
    fn test_parameter_type_errors() {
        let spec = ProcessingStepSpec::new("SpatialSmoothing", "SUSAN").with_parameter("FWHM", "wide");
        let err = spec.f64_or("FWHM", 6.0).unwrap_err();
        assert!(matches!(err, CompositionError::InvalidParameter { ref key, .. } if key == "FWHM"));

        let spec = ProcessingStepSpec::new("TrimTimepoints", "ImageSlice").with_parameter("FromEnd", -2);
        assert!(spec.u32_or("FromEnd", 0).is_err());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let spec = ProcessingStepSpec::new("SpatialSmoothing", "SUSAN").with_parameter("FWHM", "6");
        assert_eq!(spec.f64_or("FWHM", 0.0).unwrap(), 6.0);
    }

    #[test]
    fn test_string_treats_empty_as_absent() {
        let spec = ProcessingStepSpec::new("Resample", "FLIRT").with_parameter("ReferenceImage", "  ");
        assert_eq!(spec.string("ReferenceImage").unwrap(), None);
    }

    #[test]
    fn test_pipeline_config_from_options_columns_precedence() {
        let mut options = PostProcessingOptions::default();
        options.processing_steps = vec!["ConfoundRegression".to_string()];
        options.confound_options.columns = vec!["csf".to_string()];
        options.processing_step_options.insert(
            "ConfoundRegression".to_string(),
            json!({"Algorithm": "fsl_glm", "Columns": ["trans_x", "trans_y"]}),
        );

        let config = PipelineConfig::from_options(&options);
        assert_eq!(config.confound_columns, vec!["trans_x", "trans_y"]);

        options.processing_step_options.insert(
            "ConfoundRegression".to_string(),
            json!({"Algorithm": "fsl_glm"}),
        );
        let config = PipelineConfig::from_options(&options);
        assert_eq!(config.confound_columns, vec!["csf"]);
    }
}
