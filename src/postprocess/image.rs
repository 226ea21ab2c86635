use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};

use crate::config::PostProcessingOptions;
use crate::error::LayoutError;
use crate::layout::{DatasetLayout, FsLayout};
use crate::pipeline::{
    compose_confounds, select_confound_columns, ExecutionContext, GraphRunner, PipelineComposer,
    PipelineConfig, PipelineGraph, ProcessRunner, StepKind, ToolRunner,
};

use super::load_config;

/// File name of the Graphviz rendering of an image's stage graph.
pub const PROCESSING_GRAPH_FILE_NAME: &str = "processing_graph.dot";

/// Inputs of [`postprocess_image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
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
    pub debug: bool,
}

/// Short identifier for an image's graphs: the file name without
/// extensions or the `_desc-preproc_bold` suffix, with `-` replaced by `_`.
pub fn pipeline_name(image: &Path) -> String {
    crate::distributor::image_job_id(image)
        .replace("_desc-preproc_bold", "")
        .replace('-', "_")
}

/// Where a processed file is written: the file's path below
/// `<fmriprep_dir>/sub-<id>`, re-rooted at `subject_out_dir`, with `preproc`
/// renamed to `postproc`.
pub fn build_export_path(
    file: &Path,
    subject_id: &str,
    fmriprep_dir: &Path,
    subject_out_dir: &Path,
) -> Result<PathBuf, LayoutError> {
    let relative = file
        .strip_prefix(fmriprep_dir.join(format!("sub-{subject_id}")))
        .map_err(|_| LayoutError::UnknownImage(file.to_path_buf()))?;
    let renamed = relative.to_string_lossy().replace("preproc", "postproc");
    Ok(subject_out_dir.join(renamed))
}

/// Confounds preparation resolved for one image.
struct ConfoundsPlan {
    export: PathBuf,
    selected: Option<PathBuf>,
    graph: Option<PipelineGraph>,
}

/// What one image run produced.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    /// The exported processed image.
    pub output: PathBuf,
    /// The composed image graph.
    pub graph: PipelineGraph,
    /// The exported confounds, when they were prepared.
    pub confounds: Option<PathBuf>,
}

/// Whether the image's pipeline reads or reshapes the confounds series.
fn uses_confounds(pipeline: &PipelineConfig) -> bool {
    pipeline.contains(StepKind::ConfoundRegression)
        || pipeline
            .steps
            .iter()
            .filter_map(|step| StepKind::from_name(&step.name))
            .any(StepKind::is_time_domain)
}

/// Composes and runs the stage graphs of one image.
pub async fn postprocess_image(request: ImageRequest) -> Result<()> {
    postprocess_image_with(request, ProcessRunner).await?;
    Ok(())
}

/// Like [`postprocess_image`], running every tool through `runner`.
pub async fn postprocess_image_with<R: ToolRunner>(
    request: ImageRequest,
    runner: R,
) -> Result<ImageOutcome> {
    info!("Processing image: {}", request.image_path.display());

    let config = load_config(&request.config_file)?;
    let stream_dir = request.out_dir.join(&request.processing_stream);
    let options = config.stream_options(&request.processing_stream)?;
    options.write_processing_description(&stream_dir)?;

    let layout = FsLayout::open(&request.fmriprep_dir)?;
    let image = request.image_path.as_path();
    let entities = layout.entities(image)?;
    let subject_id = entities.subject.as_str();
    let name = pipeline_name(image);
    let working_dir = request.subject_working_dir.join(&name);

    let pipeline = PipelineConfig::from_options(&options);
    let mut context = ExecutionContext::new(image);

    if pipeline.contains(StepKind::AromaRegression) {
        match (layout.mixing(image)?, layout.noise(image)?) {
            (Some(mixing), Some(noise)) => context = context.with_aroma_files(mixing, noise),
            (mixing, _) => warn!(
                "Missing AROMA {} file for {}",
                if mixing.is_none() { "mixing" } else { "noise" },
                name
            ),
        }
    }
    if let Some(mask) = layout.mask(image)? {
        context = context.with_mask(mask);
    }
    if let Some(tr) = layout.tr(image)? {
        context = context.with_tr(tr);
    }

    let image_export =
        build_export_path(image, subject_id, &request.fmriprep_dir, &request.subject_out_dir)?;
    context = context.with_image_export(&image_export);

    let confounds = layout.confounds(image)?;
    if let Some(path) = &confounds {
        context = context.with_confounds(path);
    }

    let plan = match &confounds {
        Some(raw) if uses_confounds(&pipeline) => {
            let planned = match build_export_path(
                raw,
                subject_id,
                &request.fmriprep_dir,
                &request.subject_out_dir,
            ) {
                Ok(export) => {
                    plan_confounds(&pipeline, &options, &context, raw, export, &working_dir).await
                }
                Err(e) => Err(e.into()),
            };
            match planned {
                Ok(plan) => Some(plan),
                Err(e) => {
                    warn!("Confounds preparation unavailable for {}: {:#}", name, e);
                    None
                }
            }
        }
        _ => None,
    };
    if let Some(plan) = &plan {
        if plan.graph.is_some() || plan.selected.is_some() {
            context = context.with_confounds_export(&plan.export);
        }
    }

    let graph = PipelineComposer::new()
        .compose(&pipeline, &context)
        .with_context(|| format!("Failed to compose pipeline for {}", image.display()))?;

    if options.write_process_graph {
        fs::create_dir_all(&stream_dir).await?;
        let dot_path = stream_dir.join(PROCESSING_GRAPH_FILE_NAME);
        fs::write(&dot_path, graph.to_dot()).await?;
        info!("Wrote processing graph: {}", dot_path.display());
    }

    fs::create_dir_all(&request.subject_out_dir).await?;
    fs::create_dir_all(&working_dir).await?;
    let runner = GraphRunner::with_runner(runner, &working_dir);

    let mut confounds_output = None;
    if let Some(plan) = plan {
        if let Some(parent) = plan.export.parent() {
            fs::create_dir_all(parent).await?;
        }
        match (&plan.graph, &plan.selected) {
            (Some(graph), _) => {
                runner.run(graph).await?;
                confounds_output = Some(plan.export);
            }
            (None, Some(selected)) => {
                fs::copy(selected, &plan.export).await?;
                info!("Exported confounds to {}", plan.export.display());
                confounds_output = Some(plan.export);
            }
            (None, None) => {}
        }
    }

    let output = runner
        .run(&graph)
        .await
        .with_context(|| format!("Pipeline failed for {}", image.display()))?;
    info!("Postprocessing complete: {}", output.display());

    Ok(ImageOutcome {
        output,
        graph,
        confounds: confounds_output,
    })
}

async fn plan_confounds(
    pipeline: &PipelineConfig,
    options: &PostProcessingOptions,
    context: &ExecutionContext,
    raw: &Path,
    export: PathBuf,
    working_dir: &Path,
) -> Result<ConfoundsPlan> {
    let mut source = raw.to_path_buf();
    let mut selected = None;

    if !pipeline.confound_columns.is_empty() {
        fs::create_dir_all(working_dir).await?;
        let dest = working_dir.join("selected_confounds.tsv");
        let rows = select_confound_columns(raw, &dest, &pipeline.confound_columns).await?;
        info!(
            "Selected {} confound column(s) over {} row(s)",
            pipeline.confound_columns.len(),
            rows
        );
        source = dest.clone();
        selected = Some(dest);
    }
    if options.confound_options.motion_outliers.include {
        warn!("Motion outlier scrubbing is not applied to the confounds series");
    }

    let confounds_context = context
        .clone()
        .with_confounds(source)
        .with_confounds_export(&export);
    let graph = compose_confounds(pipeline, &confounds_context)
        .context("Failed to compose confounds pipeline")?;

    Ok(ConfoundsPlan {
        export,
        selected,
        graph,
    })
}
