//! CLI command definitions for fmri-postproc.
//!
//! The `subject` and `image` subcommands take positional arguments in the
//! order the submission templates render them, so a queued job line can be
//! run directly.

use std::path::PathBuf;

use clap::{Args, Parser};
use tracing::info;

use crate::config::DEFAULT_PROCESSING_STREAM;
use crate::postprocess::{
    current_program, postprocess_image, postprocess_subject, postprocess_subjects, ImageRequest,
    RunFlags, SubjectRequest, SubjectsRequest,
};

/// Single-dash flags accepted for compatibility with rendered submission
/// strings.
const LEGACY_FLAGS: [&str; 4] = ["-batch", "-no-batch", "-submit", "-debug"];

/// fMRI postprocessing: compose per-image stage graphs and distribute jobs.
#[derive(Parser, Debug)]
#[command(name = "fmri-postproc")]
#[command(about = "Postprocess fMRIPrep outputs on a cluster or locally")]
#[command(version)]
#[command(
    long_about = "fmri-postproc distributes postprocessing of fMRIPrep derivatives.\n\n`subjects` queues one job per subject, each subject job queues one job per image,\nand each image job composes and runs its stage graph.\n\nExample usage:\n  fmri-postproc subjects 01 02 -c clpipe_config.json --submit"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Whether the subcommand asked for debug output.
    pub fn debug(&self) -> bool {
        match &self.command {
            Commands::Subjects(args) => args.flags.debug,
            Commands::Subject(args) => args.flags.debug,
            Commands::Image(args) => args.debug,
        }
    }

    /// The log filter to install when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        if self.debug() {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Queue one postprocessing job per subject.
    Subjects(SubjectsArgs),

    /// Queue one postprocessing job per image of a subject.
    Subject(SubjectArgs),

    /// Postprocess a single image.
    Image(ImageArgs),
}

/// Batch, submit and debug switches.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct FlagArgs {
    /// Use the configured batch system (default).
    #[arg(long, overrides_with = "no_batch")]
    pub batch: bool,

    /// Run jobs in this session instead of the batch system.
    #[arg(long = "no-batch")]
    pub no_batch: bool,

    /// Dispatch jobs. Without this flag jobs are only printed.
    #[arg(long)]
    pub submit: bool,

    /// Print debug output and list every queued job.
    #[arg(long)]
    pub debug: bool,
}

impl FlagArgs {
    fn run_flags(&self) -> RunFlags {
        RunFlags {
            batch: !self.no_batch,
            submit: self.submit,
            debug: self.debug,
        }
    }
}

/// Arguments for `fmri-postproc subjects`.
#[derive(Parser, Debug)]
pub struct SubjectsArgs {
    /// Subjects to process. Defaults to every subject found.
    pub subjects: Vec<String>,

    /// Project configuration file (JSON or YAML).
    #[arg(short = 'c', long)]
    pub config_file: PathBuf,

    /// Processing stream to apply.
    #[arg(short = 'p', long, default_value = DEFAULT_PROCESSING_STREAM)]
    pub processing_stream: String,

    /// Override the fMRIPrep derivatives directory.
    #[arg(long)]
    pub fmriprep_dir: Option<PathBuf>,

    /// Override the postprocessing output directory.
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Override the log directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[command(flatten)]
    pub flags: FlagArgs,
}

/// Arguments for `fmri-postproc subject`.
#[derive(Parser, Debug)]
pub struct SubjectArgs {
    pub subject_id: String,
    pub bids_dir: PathBuf,
    pub fmriprep_dir: PathBuf,
    pub output_dir: PathBuf,
    pub processing_stream: String,
    pub config_file: PathBuf,
    pub index_dir: PathBuf,
    pub log_dir: PathBuf,

    #[command(flatten)]
    pub flags: FlagArgs,
}

/// Arguments for `fmri-postproc image`.
#[derive(Parser, Debug)]
pub struct ImageArgs {
    pub config_file: PathBuf,
    pub image_path: PathBuf,
    pub bids_dir: PathBuf,
    pub fmriprep_dir: PathBuf,
    pub index_dir: PathBuf,
    pub out_dir: PathBuf,
    pub subject_out_dir: PathBuf,
    pub processing_stream: String,
    pub subject_working_dir: PathBuf,
    pub log_dir: PathBuf,

    /// Print debug output.
    #[arg(long)]
    pub debug: bool,
}

/// Rewrites legacy single-dash flags (`-submit`) to their long form.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if LEGACY_FLAGS.contains(&arg.as_str()) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

/// Parse CLI arguments, accepting legacy single-dash flags.
pub fn parse_cli() -> Cli {
    Cli::parse_from(normalize_args(std::env::args()))
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Subjects(args) => run_subjects_command(args).await,
        Commands::Subject(args) => run_subject_command(args).await,
        Commands::Image(args) => run_image_command(args).await,
    }
}

async fn run_subjects_command(args: SubjectsArgs) -> anyhow::Result<()> {
    let mut request = SubjectsRequest::new(args.config_file);
    request.subjects = args.subjects;
    request.processing_stream = args.processing_stream;
    request.fmriprep_dir = args.fmriprep_dir;
    request.output_dir = args.output_dir;
    request.log_dir = args.log_dir;
    request.flags = args.flags.run_flags();
    request.program = current_program();

    info!(stream = %request.processing_stream, "Starting subject distribution");
    postprocess_subjects(request).await
}

async fn run_subject_command(args: SubjectArgs) -> anyhow::Result<()> {
    postprocess_subject(SubjectRequest {
        subject_id: args.subject_id,
        bids_dir: args.bids_dir,
        fmriprep_dir: args.fmriprep_dir,
        output_dir: args.output_dir,
        processing_stream: args.processing_stream,
        config_file: args.config_file,
        index_dir: args.index_dir,
        log_dir: args.log_dir,
        flags: args.flags.run_flags(),
        program: current_program(),
    })
    .await
}

async fn run_image_command(args: ImageArgs) -> anyhow::Result<()> {
    postprocess_image(ImageRequest {
        config_file: args.config_file,
        image_path: args.image_path,
        bids_dir: args.bids_dir,
        fmriprep_dir: args.fmriprep_dir,
        index_dir: args.index_dir,
        out_dir: args.out_dir,
        subject_out_dir: args.subject_out_dir,
        processing_stream: args.processing_stream,
        subject_working_dir: args.subject_working_dir,
        log_dir: args.log_dir,
        debug: args.debug,
    })
    .await
}
