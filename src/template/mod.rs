//! Submission-string templates.
//!
//! A template is a command line with `{name}` placeholders. Rendering is a
//! single left-to-right pass: substituted values are copied verbatim and
//! never scanned for further placeholders.
//!
//! # Example
//!
//! ```ignore
//! use fmri_postproc::template::{JobTemplate, TemplateBag};
//!
//! let bag = TemplateBag::new()
//!     .with("program", "fmri-postproc")
//!     .with("subject_id", "01")
//!     .with_flag("debug", false, "-debug");
//!
//! let command = JobTemplate::new("{program} subject {subject_id} {debug}").render(&bag)?;
//! assert_eq!(command, "fmri-postproc subject 01 ");
//! ```

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// Submission string for one subject-level job.
pub const SUBJECT_TEMPLATE: &str = "{program} subject {subject_id} {bids_dir} {fmriprep_dir} \
    {output_dir} {processing_stream} {config_file} {index_dir} {log_dir} {batch} {submit} {debug}";

/// Submission string for one image-level job.
pub const IMAGE_TEMPLATE: &str = "{program} image {config_file} {image_path} {bids_dir} \
    {fmriprep_dir} {pybids_db_path} {out_dir} {subject_out_dir} {processing_stream} \
    {subject_working_dir} {log_dir} {debug}";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Values bound to template placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBag(BTreeMap<String, String>);

impl TemplateBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `value`, replacing any earlier binding.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Binds `key` to `flag` when `enabled`, otherwise to the empty string.
    pub fn with_flag(self, key: impl Into<String>, enabled: bool, flag: &str) -> Self {
        self.with(key, if enabled { flag } else { "" })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A command-line template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    template: String,
}

impl JobTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Template for subject-level jobs.
    pub fn subject() -> Self {
        Self::new(SUBJECT_TEMPLATE)
    }

    /// Template for image-level jobs.
    pub fn image() -> Self {
        Self::new(IMAGE_TEMPLATE)
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Placeholder names in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        placeholder_pattern()
            .captures_iter(&self.template)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Substitutes every placeholder.
    ///
    /// Fails with [`TemplateError::MissingTemplateField`] naming the first
    /// placeholder that has no binding.
    pub fn render(&self, bag: &TemplateBag) -> Result<String, TemplateError> {
        if let Some(field) = self
            .placeholders()
            .into_iter()
            .find(|name| bag.get(name).is_none())
        {
            return Err(TemplateError::MissingTemplateField {
                field: field.to_string(),
            });
        }
        Ok(self.fill(bag))
    }

    /// Substitutes the bound placeholders and leaves the others in place.
    pub fn fill(&self, bag: &TemplateBag) -> String {
        placeholder_pattern()
            .replace_all(&self.template, |caps: &Captures<'_>| {
                match bag.get(&caps[1]) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl From<&str> for JobTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}
