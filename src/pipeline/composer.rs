//! Builds validated stage graphs from an ordered step list.
//!
//! Composition is all-or-nothing. Every precondition is checked before the
//! first stage is built, so a failing configuration never yields a partial
//! graph.

use std::borrow::Cow;
use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::CompositionError;

use super::config::PipelineConfig;
use super::context::{Channel, ExecutionContext};
use super::graph::{ConfoundWiring, Endpoint, PipelineGraph};
use super::registry::{reference_image, StageFactory, StageRegistry, StageRequest, StepKind};

/// Returns true when the confounds must be prepared before they can be used
/// as a design matrix: a column selection is configured, or a time-domain
/// step must also be applied to the confounds to keep them aligned with the
/// image.
pub fn has_preparation_steps(config: &PipelineConfig) -> bool {
    !config.confound_columns.is_empty()
        || config
            .steps
            .iter()
            .filter_map(|step| StepKind::from_name(&step.name))
            .any(StepKind::is_time_domain)
}

/// Composes pipelines for one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineComposer {
    registry: StageRegistry,
    channel: Channel,
}

impl PipelineComposer {
    /// Composer for the image channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Composer for the confounds channel. Only time-domain steps are kept.
    pub fn confounds() -> Self {
        Self {
            registry: StageRegistry,
            channel: Channel::Confounds,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// The subset of `config` this composer's channel runs.
    pub fn channel_config(&self, config: &PipelineConfig) -> PipelineConfig {
        match self.channel {
            Channel::Image => config.clone(),
            Channel::Confounds => PipelineConfig {
                steps: config
                    .steps
                    .iter()
                    .filter(|step| {
                        StepKind::from_name(&step.name).is_some_and(StepKind::is_time_domain)
                    })
                    .cloned()
                    .collect(),
                confound_columns: config.confound_columns.clone(),
            },
        }
    }

    /// Builds the stage graph for `config` over `context`.
    pub fn compose(
        &self,
        config: &PipelineConfig,
        context: &ExecutionContext,
    ) -> Result<PipelineGraph, CompositionError> {
        let config = self.channel_config(config);
        let factories = self.check_preconditions(&config, context)?;

        let source = context
            .primary_input(self.channel)
            .ok_or_else(|| CompositionError::MissingInput {
                step: self.channel.to_string(),
                input: "confounds".to_string(),
            })?
            .to_path_buf();

        // The brain mask is defined on the image grid only.
        let context: Cow<'_, ExecutionContext> = match self.channel {
            Channel::Image => Cow::Borrowed(context),
            Channel::Confounds => Cow::Owned(ExecutionContext {
                mask: None,
                ..context.clone()
            }),
        };

        let wiring = self.confound_wiring(&config, &context);
        let design = wiring.as_ref().map(ConfoundWiring::design_path);

        let mut graph = PipelineGraph::new(format!("{}_pipeline", self.channel), self.channel);

        for (index, (spec, factory)) in config.steps.iter().zip(&factories).enumerate() {
            let request = StageRequest {
                index,
                spec,
                context: &context,
                design,
            };
            let stage = factory.build(&request)?;
            debug!(
                channel = %self.channel,
                stage = %stage.label(),
                "Built stage"
            );
            graph.push_stage(stage);

            if index == 0 {
                graph.connect(Endpoint::Source(source.clone()), Endpoint::Stage(0));
            } else {
                graph.connect(Endpoint::Stage(index - 1), Endpoint::Stage(index));
            }
        }

        if let Some(export) = context.export_path(self.channel) {
            graph.connect(
                Endpoint::Stage(config.steps.len() - 1),
                Endpoint::Sink(export.to_path_buf()),
            );
        }

        if let Some(wiring) = wiring {
            graph.set_confound_wiring(wiring);
        }

        graph.validate()?;
        Ok(graph)
    }

    fn check_preconditions(
        &self,
        config: &PipelineConfig,
        context: &ExecutionContext,
    ) -> Result<Vec<StageFactory>, CompositionError> {
        if config.is_empty() {
            return Err(CompositionError::EmptyPipeline);
        }

        let factories = config
            .steps
            .iter()
            .map(|step| self.registry.resolve(&step.name, &step.algorithm))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        for factory in &factories {
            let step = factory.step();
            if !seen.insert(step) && !step.is_repeatable() {
                return Err(CompositionError::DuplicateStep(step.name().to_string()));
            }
        }

        if seen.contains(&StepKind::TemporalFiltering) && context.tr.is_none() {
            return Err(CompositionError::MissingTr(context.image.clone()));
        }

        if let Some(spec) = config.step(StepKind::Resample) {
            if reference_image(spec)?.is_none() {
                return Err(CompositionError::MissingReferenceImage);
            }
        }

        let missing = |step: StepKind, input: &str| CompositionError::MissingInput {
            step: step.name().to_string(),
            input: input.to_string(),
        };

        if seen.contains(&StepKind::AromaRegression) {
            if context.mixing_file.is_none() {
                return Err(missing(StepKind::AromaRegression, "mixing"));
            }
            if context.noise_file.is_none() {
                return Err(missing(StepKind::AromaRegression, "noise"));
            }
        }

        if seen.contains(&StepKind::ConfoundRegression) && context.confounds.is_none() {
            return Err(missing(StepKind::ConfoundRegression, "confounds"));
        }

        Ok(factories)
    }

    /// Picks the design matrix for a confound-regression stage.
    fn confound_wiring(
        &self,
        config: &PipelineConfig,
        context: &ExecutionContext,
    ) -> Option<ConfoundWiring> {
        if !config.contains(StepKind::ConfoundRegression) {
            return None;
        }
        let raw = context.confounds.as_deref()?.to_path_buf();

        if !has_preparation_steps(config) {
            return Some(ConfoundWiring::RawPassThrough(raw));
        }

        match context.confounds_export.as_deref() {
            Some(prepared) => Some(ConfoundWiring::Prepared(prepared.to_path_buf())),
            None => {
                warn!(
                    confounds = %raw.display(),
                    "Confound preparation is configured but no prepared confounds are available; \
                     regressing the raw confounds"
                );
                Some(ConfoundWiring::RawFallback(raw))
            }
        }
    }
}

/// Composes the confounds graph when the confounds need preparation.
///
/// Returns `Ok(None)` when the configuration has no time-domain step, so
/// there is nothing to apply to the confounds series.
pub fn compose_confounds(
    config: &PipelineConfig,
    context: &ExecutionContext,
) -> Result<Option<PipelineGraph>, CompositionError> {
    let composer = PipelineComposer::confounds();
    if composer.channel_config(config).is_empty() || context.confounds.is_none() {
        return Ok(None);
    }
    composer.compose(config, context).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::ProcessingStepSpec;
    use crate::pipeline::registry::{AlgorithmKind, REFERENCE_IMAGE_PLACEHOLDER};
    use crate::pipeline::stage::{Port, StageParams};
    use std::path::{Path, PathBuf};

    fn full_context() -> ExecutionContext {
        ExecutionContext::new("sub-01_task-rest_desc-preproc_bold.nii.gz")
            .with_tr(2.0)
            .with_mask("sub-01_desc-brain_mask.nii.gz")
            .with_confounds("sub-01_desc-confounds_timeseries.tsv")
            .with_aroma_files("mixing.tsv", "noise.csv")
            .with_image_export("out/sub-01_desc-postproc_bold.nii.gz")
    }

    fn step(name: &str, algorithm: &str) -> ProcessingStepSpec {
        ProcessingStepSpec::new(name, algorithm)
    }

    fn all_steps() -> Vec<ProcessingStepSpec> {
        vec![
            step("TrimTimepoints", "ImageSlice").with_parameter("FromBeginning", 4),
            step("AROMARegression", "fsl_regfilt"),
            step("ConfoundRegression", "fsl_glm"),
            step("TemporalFiltering", "Butterworth").with_parameter("FilteringHighPass", 0.008),
            step("IntensityNormalization", "10000_GlobalMedian"),
            step("SpatialSmoothing", "SUSAN").with_parameter("FWHM", 6),
            step("Resample", "FLIRT").with_parameter("ReferenceImage", "/ref/MNI.nii.gz"),
        ]
    }

    #[test]
    fn test_end_to_end_filter_then_smooth() {
        let config = PipelineConfig::new(vec![
            step("TemporalFiltering", "Butterworth"),
            step("SpatialSmoothing", "SUSAN").with_parameter("FWHM", 6),
        ]);
        let context = ExecutionContext::new("bold.nii.gz")
            .with_tr(2.0)
            .with_image_export("out/bold.nii.gz");

        let graph = PipelineComposer::new().compose(&config, &context).unwrap();
        let stages = graph.stages();

        assert_eq!(stages.len(), 2);
        assert!(matches!(
            stages[0].params(),
            StageParams::TemporalFilter { tr, .. } if *tr == 2.0
        ));
        assert!(matches!(
            stages[1].params(),
            StageParams::SpatialSmoothing { fwhm_mm, .. } if *fwhm_mm == 6.0
        ));
        assert_eq!(graph.source(), Some(Path::new("bold.nii.gz")));
        assert_eq!(graph.sink(), Some(Path::new("out/bold.nii.gz")));
        assert_eq!(graph.internal_edges().count(), 1);
        let internal = graph.internal_edges().next().unwrap();
        assert_eq!(internal.from, Endpoint::Stage(0));
        assert_eq!(internal.to, Endpoint::Stage(1));
    }

    #[test]
    fn test_stage_and_edge_counts() {
        let context = full_context();
        let steps = all_steps();
        for n in 1..=steps.len() {
            let config = PipelineConfig::new(steps[..n].to_vec());
            let graph = PipelineComposer::new().compose(&config, &context).unwrap();
            assert_eq!(graph.stages().len(), n);
            assert_eq!(graph.internal_edges().count(), n - 1);
            assert_eq!(graph.edges().len(), n + 1);
        }
    }

    #[test]
    fn test_no_sink_without_export() {
        let mut context = full_context();
        context.image_export = None;
        let config = PipelineConfig::new(vec![step("TrimTimepoints", "ImageSlice")]);

        let graph = PipelineComposer::new().compose(&config, &context).unwrap();
        assert_eq!(graph.sink(), None);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_empty_pipeline() {
        let err = PipelineComposer::new()
            .compose(&PipelineConfig::default(), &full_context())
            .unwrap_err();
        assert!(matches!(err, CompositionError::EmptyPipeline));
    }

    #[test]
    fn test_missing_tr_for_any_config() {
        let mut context = full_context();
        context.tr = None;
        let steps = all_steps();
        let filter = steps[3].clone();

        for other in steps.iter().filter(|s| s.name != "TemporalFiltering") {
            for order in [vec![filter.clone(), other.clone()], vec![other.clone(), filter.clone()]] {
                let err = PipelineComposer::new()
                    .compose(&PipelineConfig::new(order), &context)
                    .unwrap_err();
                assert!(matches!(err, CompositionError::MissingTr(_)), "got {err:?}");
            }
        }
    }

    #[test]
    fn test_missing_reference_image() {
        for reference in [None, Some(""), Some(REFERENCE_IMAGE_PLACEHOLDER)] {
            let mut resample = step("Resample", "FLIRT");
            if let Some(reference) = reference {
                resample = resample.with_parameter("ReferenceImage", reference);
            }
            let err = PipelineComposer::new()
                .compose(&PipelineConfig::new(vec![resample]), &full_context())
                .unwrap_err();
            assert!(matches!(err, CompositionError::MissingReferenceImage));
        }
    }

    #[test]
    fn test_duplicate_steps() {
        let config = PipelineConfig::new(vec![
            step("SpatialSmoothing", "SUSAN"),
            step("SpatialSmoothing", "SUSAN"),
        ]);
        let err = PipelineComposer::new().compose(&config, &full_context()).unwrap_err();
        assert!(matches!(err, CompositionError::DuplicateStep(ref s) if s == "SpatialSmoothing"));

        let config = PipelineConfig::new(vec![
            step("TrimTimepoints", "ImageSlice").with_parameter("FromBeginning", 2),
            step("SpatialSmoothing", "SUSAN"),
            step("TrimTimepoints", "ImageSlice").with_parameter("FromEnd", 2),
        ]);
        let graph = PipelineComposer::new().compose(&config, &full_context()).unwrap();
        assert_eq!(graph.stages().len(), 3);
    }

    #[test]
    fn test_unknown_step_and_algorithm() {
        let config = PipelineConfig::new(vec![step("Detrending", "SUSAN")]);
        let err = PipelineComposer::new().compose(&config, &full_context()).unwrap_err();
        assert!(matches!(err, CompositionError::UnknownStep(_)));

        let config = PipelineConfig::new(vec![step("TemporalFiltering", "Chebyshev")]);
        let err = PipelineComposer::new().compose(&config, &full_context()).unwrap_err();
        assert!(matches!(err, CompositionError::UnknownAlgorithm { .. }));
    }

    #[test]
    fn test_missing_side_inputs() {
        let mut context = full_context();
        context.noise_file = None;
        let config = PipelineConfig::new(vec![step("AROMARegression", "fsl_regfilt")]);
        let err = PipelineComposer::new().compose(&config, &context).unwrap_err();
        assert!(matches!(err, CompositionError::MissingInput { ref input, .. } if input == "noise"));

        let mut context = full_context();
        context.confounds = None;
        let config = PipelineConfig::new(vec![step("ConfoundRegression", "afni_3dTproject")]);
        let err = PipelineComposer::new().compose(&config, &context).unwrap_err();
        assert!(
            matches!(err, CompositionError::MissingInput { ref input, .. } if input == "confounds")
        );
    }

    #[test]
    fn test_permutations_keep_input_order() {
        let context = full_context();
        let forward = all_steps();
        let mut reversed = forward.clone();
        reversed.reverse();
        let mut rotated = forward.clone();
        rotated.rotate_left(3);

        for steps in [forward, reversed, rotated] {
            let expected: Vec<String> = steps.iter().map(|s| s.algorithm.clone()).collect();
            let graph = PipelineComposer::new()
                .compose(&PipelineConfig::new(steps), &context)
                .unwrap();
            let actual: Vec<String> = graph
                .stages()
                .iter()
                .map(|s| s.algorithm().name().to_string())
                .collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_confound_wiring_pass_through() {
        let config = PipelineConfig::new(vec![
            step("ConfoundRegression", "fsl_glm"),
            step("SpatialSmoothing", "SUSAN"),
        ]);
        assert!(!has_preparation_steps(&config));

        let graph = PipelineComposer::new().compose(&config, &full_context()).unwrap();
        let raw = PathBuf::from("sub-01_desc-confounds_timeseries.tsv");
        assert_eq!(graph.confound_wiring(), Some(&ConfoundWiring::RawPassThrough(raw.clone())));
        assert_eq!(graph.stages()[0].binding(Port::Design), Some(raw.as_path()));
    }

    #[test]
    fn test_confound_wiring_prepared_and_fallback() {
        let config = PipelineConfig::new(vec![step("ConfoundRegression", "fsl_glm")])
            .with_confound_columns(vec!["csf".to_string(), "white_matter".to_string()]);
        assert!(has_preparation_steps(&config));

        let context = full_context().with_confounds_export("out/confounds.tsv");
        let graph = PipelineComposer::new().compose(&config, &context).unwrap();
        assert_eq!(
            graph.confound_wiring(),
            Some(&ConfoundWiring::Prepared(PathBuf::from("out/confounds.tsv")))
        );
        assert_eq!(
            graph.stages()[0].binding(Port::Design),
            Some(Path::new("out/confounds.tsv"))
        );

        let graph = PipelineComposer::new().compose(&config, &full_context()).unwrap();
        assert!(matches!(graph.confound_wiring(), Some(ConfoundWiring::RawFallback(_))));
    }

    #[test]
    fn test_time_domain_step_requires_preparation() {
        let config = PipelineConfig::new(vec![
            step("TemporalFiltering", "fslmaths"),
            step("ConfoundRegression", "fsl_glm"),
        ]);
        assert!(has_preparation_steps(&config));
    }

    #[test]
    fn test_confounds_channel_keeps_time_domain_steps() {
        let context = full_context().with_confounds_export("out/confounds.tsv");
        let config = PipelineConfig::new(all_steps());

        let graph = compose_confounds(&config, &context).unwrap().unwrap();
        let kinds: Vec<StepKind> = graph.stages().iter().map(|s| s.step()).collect();

        assert_eq!(graph.channel(), Channel::Confounds);
        assert_eq!(
            kinds,
            vec![StepKind::TrimTimepoints, StepKind::AromaRegression, StepKind::TemporalFiltering]
        );
        assert_eq!(graph.source(), Some(Path::new("sub-01_desc-confounds_timeseries.tsv")));
        assert_eq!(graph.sink(), Some(Path::new("out/confounds.tsv")));
        assert!(graph.stages().iter().all(|s| s.binding(Port::Mask).is_none()));
        assert_eq!(graph.stages()[1].algorithm(), AlgorithmKind::FslRegfilt);
    }

    #[test]
    fn test_confounds_channel_absent_without_time_domain_steps() {
        let config = PipelineConfig::new(vec![step("SpatialSmoothing", "SUSAN")]);
        assert!(compose_confounds(&config, &full_context()).unwrap().is_none());
    }
}
