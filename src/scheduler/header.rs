//! Batch-system configuration and submission header composition.
//!
//! A header is the scheduler-specific preamble placed in front of every job
//! command, e.g. `sbatch --no-requeue --mem=5000 -t 2:0:0 -n 1 -J {jobid}
//! -o logs/Output-{jobid}-jobid-%j.out --wrap="{cmdwrap}"`. Directives whose
//! active flag is off are left out entirely, which supports clusters that
//! have no notion of some options (walltime, for example).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::template::{JobTemplate, TemplateBag};

use super::job::{Resources, DEFAULT_MEMORY, DEFAULT_THREADS, DEFAULT_WALLTIME};

/// File name pattern for scheduler output logs.
pub const OUTPUT_FORMAT: &str = "Output-{jobid}-jobid-%j.out";

fn default_true() -> bool {
    true
}

fn default_memory() -> String {
    DEFAULT_MEMORY.to_string()
}

fn default_walltime() -> String {
    DEFAULT_WALLTIME.to_string()
}

fn default_threads() -> String {
    DEFAULT_THREADS.to_string()
}

/// A `command args` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOption {
    pub command: String,
    #[serde(default)]
    pub args: String,
}

impl SubmissionOption {
    pub fn new(command: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: args.into(),
        }
    }
}

/// Directive templates and defaults for one batch system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchSystemConfig {
    /// Submission command, e.g. `sbatch --no-requeue`.
    pub submission_head: String,
    /// Options rendered as `command args`.
    #[serde(default)]
    pub submission_options: Vec<SubmissionOption>,
    /// Options rendered as `command=args`.
    #[serde(default)]
    pub sub_options_equal: Vec<SubmissionOption>,

    #[serde(default = "default_memory")]
    pub memory_default: String,
    #[serde(default = "default_walltime")]
    pub time_default: String,
    #[serde(default = "default_threads", rename = "NThreads")]
    pub n_threads: String,

    #[serde(default)]
    pub memory_command: String,
    #[serde(default = "default_true")]
    pub memory_command_active: bool,

    #[serde(default)]
    pub time_command: String,
    #[serde(default = "default_true")]
    pub time_command_active: bool,

    #[serde(default, rename = "NThreadsCommand")]
    pub n_threads_command: String,
    #[serde(default = "default_true")]
    pub thread_command_active: bool,

    #[serde(default, rename = "JobIDCommand")]
    pub job_id_command: String,
    #[serde(default = "default_true", rename = "JobIDCommandActive")]
    pub job_id_command_active: bool,

    #[serde(default)]
    pub output_command: String,
    #[serde(default = "default_true")]
    pub output_command_active: bool,

    /// Rendered only when an email address is known.
    #[serde(default)]
    pub email_command: String,

    /// Wraps the job command, e.g. `--wrap="{cmdwrap}"`.
    #[serde(default = "default_command_wrapper")]
    pub command_wrapper: String,
}

fn default_command_wrapper() -> String {
    "{cmdwrap}".to_string()
}

impl BatchSystemConfig {
    /// Preset for SLURM clusters.
    pub fn slurm() -> Self {
        Self {
            submission_head: "sbatch --no-requeue".to_string(),
            submission_options: Vec::new(),
            sub_options_equal: Vec::new(),
            memory_default: default_memory(),
            time_default: default_walltime(),
            n_threads: default_threads(),
            memory_command: "--mem={mem}".to_string(),
            memory_command_active: true,
            time_command: "-t {time}".to_string(),
            time_command_active: true,
            n_threads_command: "-n {nthreads}".to_string(),
            thread_command_active: true,
            job_id_command: "-J {jobid}".to_string(),
            job_id_command_active: true,
            output_command: "-o {output}".to_string(),
            output_command_active: true,
            email_command: "--mail-user={email}".to_string(),
            command_wrapper: "--wrap=\"{cmdwrap}\"".to_string(),
        }
    }

    /// Loads a batch-system configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Resources used when the project does not override them.
    pub fn default_resources(&self) -> Resources {
        Resources::new(
            self.memory_default.clone(),
            self.time_default.clone(),
            self.n_threads.trim().parse().unwrap_or(DEFAULT_THREADS),
        )
    }
}

/// Everything a header needs besides the batch-system configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderContext<'a> {
    pub resources: &'a Resources,
    /// Directory scheduler output logs are written to.
    pub log_dir: &'a Path,
    pub email: Option<&'a str>,
}

/// Renders the submission header.
///
/// Directives appear in a fixed order: submission head, option flags,
/// equals options, memory, time, threads, job id, output, email and command
/// wrapper, joined by single spaces. The `{jobid}` and `{cmdwrap}`
/// placeholders are left in place for [`render_job`].
pub fn compose_header(config: &BatchSystemConfig, ctx: &HeaderContext<'_>) -> String {
    let output: PathBuf = ctx.log_dir.join(OUTPUT_FORMAT);
    let bag = TemplateBag::new()
        .with("mem", &ctx.resources.memory)
        .with("time", &ctx.resources.walltime)
        .with("nthreads", ctx.resources.threads)
        .with("output", output.display())
        .with("email", ctx.email.unwrap_or_default());

    let fill = |directive: &str| JobTemplate::new(directive).fill(&bag);

    let mut head = vec![config.submission_head.clone()];
    head.extend(
        config
            .submission_options
            .iter()
            .map(|opt| format!("{} {}", opt.command, opt.args)),
    );
    head.extend(
        config
            .sub_options_equal
            .iter()
            .map(|opt| format!("{}={}", opt.command, opt.args)),
    );

    let directives = [
        (config.memory_command_active, &config.memory_command),
        (config.time_command_active, &config.time_command),
        (config.thread_command_active, &config.n_threads_command),
        (config.job_id_command_active, &config.job_id_command),
        (config.output_command_active, &config.output_command),
        (
            ctx.email.is_some_and(|email| !email.is_empty()),
            &config.email_command,
        ),
    ];
    head.extend(
        directives
            .into_iter()
            .filter(|(active, directive)| *active && !directive.is_empty())
            .map(|(_, directive)| fill(directive)),
    );

    head.push(config.command_wrapper.clone());
    head.retain(|part| !part.trim().is_empty());
    head.join(" ")
}

/// Renders a header for one job: `{jobid}` becomes the job id and
/// `{cmdwrap}` the job command.
pub fn render_job(header: &str, job_id: &str, command: &str) -> String {
    let bag = TemplateBag::new()
        .with("jobid", job_id)
        .with("cmdwrap", command);
    JobTemplate::new(header).fill(&bag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> Resources {
        Resources::new("4000", "1:0:0", 2)
    }

    fn header(config: &BatchSystemConfig, email: Option<&str>) -> String {
        let resources = resources();
        compose_header(
            config,
            &HeaderContext {
                resources: &resources,
                log_dir: Path::new("/proj/logs"),
                email,
            },
        )
    }

    #[test]
    fn test_slurm_header_order() {
        let h = header(&BatchSystemConfig::slurm(), Some("me@example.org"));
        assert_eq!(
            h,
            "sbatch --no-requeue --mem=4000 -t 1:0:0 -n 2 -J {jobid} \
             -o /proj/logs/Output-{jobid}-jobid-%j.out --mail-user=me@example.org \
             --wrap=\"{cmdwrap}\""
        );
    }

    #[test]
    fn test_inactive_directives_are_omitted() {
        let mut config = BatchSystemConfig::slurm();
        config.time_command_active = false;
        config.thread_command_active = false;
        let h = header(&config, None);

        assert!(!h.contains("-t "));
        assert!(!h.contains("-n "));
        assert!(!h.contains("--mail-user"));
        assert!(!h.contains("  "));
        assert_eq!(
            h,
            "sbatch --no-requeue --mem=4000 -J {jobid} \
             -o /proj/logs/Output-{jobid}-jobid-%j.out --wrap=\"{cmdwrap}\""
        );
    }

    #[test]
    fn test_active_directives_keep_relative_order_for_every_subset() {
        let order = ["--mem=", "-t ", "-n ", "-J ", "-o "];
        for mask in 0u8..32 {
            let mut config = BatchSystemConfig::slurm();
            config.memory_command_active = mask & 1 != 0;
            config.time_command_active = mask & 2 != 0;
            config.thread_command_active = mask & 4 != 0;
            config.job_id_command_active = mask & 8 != 0;
            config.output_command_active = mask & 16 != 0;
            let h = header(&config, None);

            let positions: Vec<usize> = order
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, marker)| h.find(marker).expect("active directive present"))
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "mask {mask}: {h}");

            for (i, marker) in order.iter().enumerate() {
                if mask & (1 << i) == 0 {
                    assert!(!h.contains(marker), "mask {mask}: {h}");
                }
            }
        }
    }

    #[test]
    fn test_submission_options() {
        let mut config = BatchSystemConfig::slurm();
        config.submission_options = vec![SubmissionOption::new("-p", "general")];
        config.sub_options_equal = vec![SubmissionOption::new("--qos", "short")];
        let h = header(&config, None);

        assert!(h.starts_with("sbatch --no-requeue -p general --qos=short --mem=4000"));
    }

    #[test]
    fn test_render_job_does_not_rescan_command() {
        let h = header(&BatchSystemConfig::slurm(), None);
        let rendered = render_job(&h, "Postprocessing_sub-01", "run {jobid}");

        assert!(rendered.contains("-J Postprocessing_sub-01"));
        assert!(rendered.contains("Output-Postprocessing_sub-01-jobid-%j.out"));
        assert!(rendered.ends_with("--wrap=\"run {jobid}\""));
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            r#"{
                "SubmissionHead": "qsub",
                "MemoryDefault": "8000",
                "NThreads": "4",
                "MemoryCommand": "-l mem={mem}",
                "TimeCommandActive": false,
                "JobIDCommand": "-N {jobid}",
                "CommandWrapper": "{cmdwrap}"
            }"#,
        )
        .unwrap();

        let config = BatchSystemConfig::load(&path).unwrap();
        assert_eq!(config.submission_head, "qsub");
        assert!(!config.time_command_active);
        assert!(config.output_command_active);
        assert_eq!(config.default_resources(), Resources::new("8000", "2:0:0", 4));
    }
}
