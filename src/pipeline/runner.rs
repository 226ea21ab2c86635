//! Graph execution.
//!
//! Stages run strictly in order, each inside its own working directory under
//! `<working_dir>/<graph name>/<stage label>/`. The confounds channel works on
//! a NIfTI rendering of the confounds table, so its graph is bracketed by a
//! conversion into and back out of that format.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;

use super::context::Channel;
use super::graph::PipelineGraph;
use super::stage::{ToolArg, ToolInvocation};

/// Helper converting a confounds table into a 4D NIfTI series.
pub const TSV_TO_NIFTI_PROGRAM: &str = "tsv_to_nifti";
/// Helper converting a 4D NIfTI series back into a confounds table.
pub const NIFTI_TO_TSV_PROGRAM: &str = "nifti_to_tsv";

/// File name every stage writes its result to.
const STAGE_OUTPUT: &str = "out_file.nii.gz";

/// Exit status and captured error stream of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs a single external tool.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        working_dir: &Path,
    ) -> Result<ToolOutput, ExecutionError>;
}

/// Runs tools as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    async fn resolve_arg(arg: &ToolArg) -> Result<OsString, ExecutionError> {
        match arg {
            ToolArg::Literal(value) => Ok(value.into()),
            ToolArg::Path(path) => Ok(path.as_os_str().to_owned()),
            ToolArg::FileList(path) => {
                let contents = fs::read_to_string(path).await?;
                Ok(join_list(&contents).into())
            }
        }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        working_dir: &Path,
    ) -> Result<ToolOutput, ExecutionError> {
        let mut cmd = Command::new(&invocation.program);
        for arg in &invocation.args {
            cmd.arg(Self::resolve_arg(arg).await?);
        }
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("Running: {}", invocation);

        let output = cmd.output().await.map_err(|source| ExecutionError::Launch {
            program: invocation.program.clone(),
            source,
        })?;

        Ok(ToolOutput {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Normalizes a comma or whitespace delimited list to `a,b,c`.
fn join_list(contents: &str) -> String {
    contents
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Executes composed graphs with a [`ToolRunner`].
#[derive(Debug, Clone)]
pub struct GraphRunner<R = ProcessRunner> {
    runner: R,
    working_dir: PathBuf,
}

impl GraphRunner<ProcessRunner> {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(ProcessRunner, working_dir)
    }
}

impl<R: ToolRunner> GraphRunner<R> {
    pub fn with_runner(runner: R, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Runs every stage of `graph` and returns the final output path: the
    /// export sink when one is wired, otherwise the last stage's output.
    pub async fn run(&self, graph: &PipelineGraph) -> Result<PathBuf, ExecutionError> {
        let graph_dir = self.working_dir.join(graph.name());
        fs::create_dir_all(&graph_dir).await?;

        let source = graph.source().ok_or_else(|| {
            ExecutionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("graph '{}' has no input", graph.name()),
            ))
        })?;

        let mut current = match graph.channel() {
            Channel::Image => source.to_path_buf(),
            Channel::Confounds => {
                let series = graph_dir.join("confounds.nii.gz");
                let convert = ToolInvocation::new(TSV_TO_NIFTI_PROGRAM)
                    .flag_path("--in", source)
                    .flag_path("--out", &series);
                self.invoke(TSV_TO_NIFTI_PROGRAM, &convert, &graph_dir).await?;
                series
            }
        };

        for stage in graph.stages() {
            let label = stage.label();
            let stage_dir = graph_dir.join(&label);
            fs::create_dir_all(&stage_dir).await?;
            let out_file = stage_dir.join(STAGE_OUTPUT);

            for invocation in stage.invocations(&current, &out_file)? {
                self.invoke(&label, &invocation, &stage_dir).await?;
            }

            info!(channel = %graph.channel(), stage = %label, "Stage completed");
            current = out_file;
        }

        let Some(sink) = graph.sink() else {
            return Ok(current);
        };
        if let Some(parent) = sink.parent() {
            fs::create_dir_all(parent).await?;
        }

        match graph.channel() {
            Channel::Image => {
                fs::copy(&current, sink).await?;
            }
            Channel::Confounds => {
                let convert = ToolInvocation::new(NIFTI_TO_TSV_PROGRAM)
                    .flag_path("--in", &current)
                    .flag_path("--header", source)
                    .flag_path("--out", sink);
                self.invoke(NIFTI_TO_TSV_PROGRAM, &convert, &graph_dir).await?;
            }
        }

        info!("Exported {} output to {}", graph.channel(), sink.display());
        Ok(sink.to_path_buf())
    }

    async fn invoke(
        &self,
        stage: &str,
        invocation: &ToolInvocation,
        working_dir: &Path,
    ) -> Result<(), ExecutionError> {
        let output = self.runner.run(invocation, working_dir).await?;
        if output.success() {
            return Ok(());
        }

        warn!(
            stage = %stage,
            code = ?output.code,
            "Tool failed: {}",
            output.stderr.trim()
        );
        Err(ExecutionError::StageFailed {
            stage: stage.to_string(),
            program: invocation.program.clone(),
            code: output.code,
        })
    }
}

/// Copies the named columns of a tab-separated confounds table to `dest`,
/// in the requested order. `n/a` cells become `0`. Returns the number of
/// data rows written.
pub async fn select_confound_columns(
    source: &Path,
    dest: &Path,
    columns: &[String],
) -> Result<usize, ExecutionError> {
    let contents = fs::read_to_string(source).await?;
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());

    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| ExecutionError::EmptyConfounds(source.to_path_buf()))?
        .split('\t')
        .map(str::trim)
        .collect();

    let indices = columns
        .iter()
        .map(|column| {
            header
                .iter()
                .position(|name| name == column)
                .ok_or_else(|| ExecutionError::MissingColumn {
                    path: source.to_path_buf(),
                    column: column.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = columns.join("\t");
    out.push('\n');

    let mut rows = 0;
    for line in lines {
        let cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let selected: Vec<&str> = indices
            .iter()
            .map(|&i| match cells.get(i).copied() {
                None | Some("n/a") | Some("") => "0",
                Some(cell) => cell,
            })
            .collect();
        out.push_str(&selected.join("\t"));
        out.push('\n');
        rows += 1;
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(dest, out).await?;
    debug!("Selected {} confound column(s) into {}", columns.len(), dest.display());
    Ok(rows)
}
