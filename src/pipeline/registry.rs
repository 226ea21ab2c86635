//! Closed table of processing steps and the algorithms that implement them.
//!
//! Every [`AlgorithmKind`] belongs to exactly one [`StepKind`], so the
//! `(step, algorithm)` table is checked exhaustively at compile time. Name
//! lookup only happens at the configuration boundary.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CompositionError;

use super::config::ProcessingStepSpec;
use super::context::ExecutionContext;
use super::stage::{Port, Stage, StageParams, REGFILT_R_SCRIPT};

/// Value the default configuration ships in `Resample.ReferenceImage`.
pub const REFERENCE_IMAGE_PLACEHOLDER: &str = "SET REFERENCE IMAGE";

/// Processing steps that may appear in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StepKind {
    TemporalFiltering,
    IntensityNormalization,
    SpatialSmoothing,
    AromaRegression,
    ConfoundRegression,
    TrimTimepoints,
    Resample,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::TemporalFiltering,
        StepKind::IntensityNormalization,
        StepKind::SpatialSmoothing,
        StepKind::AromaRegression,
        StepKind::ConfoundRegression,
        StepKind::TrimTimepoints,
        StepKind::Resample,
    ];

    /// Name used in configuration files.
    pub fn name(self) -> &'static str {
        match self {
            StepKind::TemporalFiltering => "TemporalFiltering",
            StepKind::IntensityNormalization => "IntensityNormalization",
            StepKind::SpatialSmoothing => "SpatialSmoothing",
            StepKind::AromaRegression => "AROMARegression",
            StepKind::ConfoundRegression => "ConfoundRegression",
            StepKind::TrimTimepoints => "TrimTimepoints",
            StepKind::Resample => "Resample",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the step may appear more than once in one pipeline.
    pub fn is_repeatable(self) -> bool {
        matches!(self, StepKind::TrimTimepoints)
    }

    /// Time-domain steps, which must also be applied to the confounds series
    /// so that regressors stay aligned with the image.
    pub fn is_time_domain(self) -> bool {
        matches!(
            self,
            StepKind::TemporalFiltering | StepKind::AromaRegression | StepKind::TrimTimepoints
        )
    }

    /// Algorithm used when the step options do not name one.
    pub fn default_algorithm(self) -> Option<AlgorithmKind> {
        match self {
            StepKind::TrimTimepoints => Some(AlgorithmKind::ImageSlice),
            StepKind::Resample => Some(AlgorithmKind::Flirt),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Algorithms known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlgorithmKind {
    Butterworth,
    Fslmaths,
    GlobalMedian10000,
    Susan,
    FslRegfilt,
    FslRegfiltR,
    FslGlm,
    Afni3dTproject,
    ImageSlice,
    Flirt,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 10] = [
        AlgorithmKind::Butterworth,
        AlgorithmKind::Fslmaths,
        AlgorithmKind::GlobalMedian10000,
        AlgorithmKind::Susan,
        AlgorithmKind::FslRegfilt,
        AlgorithmKind::FslRegfiltR,
        AlgorithmKind::FslGlm,
        AlgorithmKind::Afni3dTproject,
        AlgorithmKind::ImageSlice,
        AlgorithmKind::Flirt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AlgorithmKind::Butterworth => "Butterworth",
            AlgorithmKind::Fslmaths => "fslmaths",
            AlgorithmKind::GlobalMedian10000 => "10000_GlobalMedian",
            AlgorithmKind::Susan => "SUSAN",
            AlgorithmKind::FslRegfilt => "fsl_regfilt",
            AlgorithmKind::FslRegfiltR => "fsl_regfilt_R",
            AlgorithmKind::FslGlm => "fsl_glm",
            AlgorithmKind::Afni3dTproject => "afni_3dTproject",
            AlgorithmKind::ImageSlice => "ImageSlice",
            AlgorithmKind::Flirt => "FLIRT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.name() == name)
    }

    /// The step this algorithm implements.
    pub fn step(self) -> StepKind {
        match self {
            AlgorithmKind::Butterworth | AlgorithmKind::Fslmaths => StepKind::TemporalFiltering,
            AlgorithmKind::GlobalMedian10000 => StepKind::IntensityNormalization,
            AlgorithmKind::Susan => StepKind::SpatialSmoothing,
            AlgorithmKind::FslRegfilt | AlgorithmKind::FslRegfiltR => StepKind::AromaRegression,
            AlgorithmKind::FslGlm | AlgorithmKind::Afni3dTproject => StepKind::ConfoundRegression,
            AlgorithmKind::ImageSlice => StepKind::TrimTimepoints,
            AlgorithmKind::Flirt => StepKind::Resample,
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a factory may read while building one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    /// Position of the stage in the pipeline.
    pub index: usize,
    pub spec: &'a ProcessingStepSpec,
    pub context: &'a ExecutionContext,
    /// Design matrix chosen by the composer for regression stages.
    pub design: Option<&'a Path>,
}

type BuildFn = fn(&StageRequest<'_>, AlgorithmKind) -> Result<Stage, CompositionError>;

/// Builds stages for one `(step, algorithm)` pair.
#[derive(Clone, Copy)]
pub struct StageFactory {
    step: StepKind,
    algorithm: AlgorithmKind,
    build: BuildFn,
}

impl std::fmt::Debug for StageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFactory")
            .field("step", &self.step)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl StageFactory {
    pub fn step(&self) -> StepKind {
        self.step
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    pub fn build(&self, request: &StageRequest<'_>) -> Result<Stage, CompositionError> {
        (self.build)(request, self.algorithm)
    }
}

/// Static lookup from step and algorithm to a stage factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRegistry;

impl StageRegistry {
    /// Resolves configuration names to a factory.
    ///
    /// An algorithm name that is not registered for the step fails with
    /// [`CompositionError::UnknownAlgorithm`], whatever the step. A known
    /// algorithm paired with an unknown step fails with
    /// [`CompositionError::UnknownStep`].
    pub fn resolve(&self, step: &str, algorithm: &str) -> Result<StageFactory, CompositionError> {
        let unknown_algorithm = || CompositionError::UnknownAlgorithm {
            step: step.to_string(),
            algorithm: algorithm.to_string(),
        };

        let algorithm_kind = AlgorithmKind::from_name(algorithm).ok_or_else(unknown_algorithm)?;
        let step_kind =
            StepKind::from_name(step).ok_or_else(|| CompositionError::UnknownStep(step.to_string()))?;

        self.resolve_kind(step_kind, algorithm_kind)
            .ok_or_else(unknown_algorithm)
    }

    /// Typed lookup; `None` when the algorithm implements a different step.
    pub fn resolve_kind(&self, step: StepKind, algorithm: AlgorithmKind) -> Option<StageFactory> {
        if algorithm.step() != step {
            return None;
        }

        let build: BuildFn = match step {
            StepKind::TemporalFiltering => build_temporal_filter,
            StepKind::IntensityNormalization => build_intensity_normalization,
            StepKind::SpatialSmoothing => build_spatial_smoothing,
            StepKind::AromaRegression => build_aroma_regression,
            StepKind::ConfoundRegression => build_confound_regression,
            StepKind::TrimTimepoints => build_trim_timepoints,
            StepKind::Resample => build_resample,
        };

        Some(StageFactory {
            step,
            algorithm,
            build,
        })
    }

    /// Algorithms registered for a step.
    pub fn algorithms_for(&self, step: StepKind) -> Vec<AlgorithmKind> {
        AlgorithmKind::ALL
            .into_iter()
            .filter(|alg| alg.step() == step)
            .collect()
    }
}

fn build_temporal_filter(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let tr = req
        .context
        .tr
        .ok_or_else(|| CompositionError::MissingTr(req.context.image.clone()))?;

    let params = StageParams::TemporalFilter {
        high_pass: req.spec.f64_or("FilteringHighPass", -1.0)?,
        low_pass: req.spec.f64_or("FilteringLowPass", -1.0)?,
        order: req.spec.u32_or("FilteringOrder", 2)?,
        tr,
    };

    Ok(Stage::new(req.index, StepKind::TemporalFiltering, algorithm, params))
}

fn build_intensity_normalization(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    Ok(Stage::new(
        req.index,
        StepKind::IntensityNormalization,
        algorithm,
        StageParams::IntensityNormalization,
    )
    .bind(Port::Mask, req.context.mask.as_deref()))
}

fn build_spatial_smoothing(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let params = StageParams::SpatialSmoothing {
        fwhm_mm: req.spec.f64_or("FWHM", 6.0)?,
        brightness_threshold: req.spec.f64_or("BrightnessThreshold", 0.0)?,
    };

    Ok(
        Stage::new(req.index, StepKind::SpatialSmoothing, algorithm, params)
            .bind(Port::Mask, req.context.mask.as_deref()),
    )
}

fn build_aroma_regression(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let missing = |input: &str| CompositionError::MissingInput {
        step: StepKind::AromaRegression.name().to_string(),
        input: input.to_string(),
    };
    let mixing = req.context.mixing_file.as_deref().ok_or_else(|| missing("mixing"))?;
    let noise = req.context.noise_file.as_deref().ok_or_else(|| missing("noise"))?;

    let script = req
        .spec
        .string("ScriptPath")?
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(REGFILT_R_SCRIPT));

    let mask = match algorithm {
        AlgorithmKind::FslRegfiltR => None,
        _ => req.context.mask.as_deref(),
    };

    Ok(Stage::new(
        req.index,
        StepKind::AromaRegression,
        algorithm,
        StageParams::AromaRegression { script },
    )
    .bind(Port::Mixing, Some(mixing))
    .bind(Port::Noise, Some(noise))
    .bind(Port::Mask, mask))
}

fn build_confound_regression(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let design = req.design.ok_or_else(|| CompositionError::MissingInput {
        step: StepKind::ConfoundRegression.name().to_string(),
        input: "confounds".to_string(),
    })?;

    Ok(Stage::new(
        req.index,
        StepKind::ConfoundRegression,
        algorithm,
        StageParams::ConfoundRegression,
    )
    .bind(Port::Design, Some(design))
    .bind(Port::Mask, req.context.mask.as_deref()))
}

fn build_trim_timepoints(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let params = StageParams::TrimTimepoints {
        from_beginning: req.spec.u32_or("FromBeginning", 0)?,
        from_end: req.spec.u32_or("FromEnd", 0)?,
    };

    Ok(Stage::new(req.index, StepKind::TrimTimepoints, algorithm, params))
}

fn build_resample(
    req: &StageRequest<'_>,
    algorithm: AlgorithmKind,
) -> Result<Stage, CompositionError> {
    let reference_image = reference_image(req.spec)?.ok_or(CompositionError::MissingReferenceImage)?;

    Ok(Stage::new(
        req.index,
        StepKind::Resample,
        algorithm,
        StageParams::Resample { reference_image },
    ))
}

/// Reads `ReferenceImage`, treating the shipped placeholder as unset.
pub(crate) fn reference_image(
    spec: &ProcessingStepSpec,
) -> Result<Option<PathBuf>, CompositionError> {
    Ok(spec
        .string("ReferenceImage")?
        .filter(|value| value != REFERENCE_IMAGE_PLACEHOLDER)
        .map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_algorithm_resolves_for_its_step() {
        let registry = StageRegistry;
        for alg in AlgorithmKind::ALL {
            let factory = registry
                .resolve(alg.step().name(), alg.name())
                .expect("registered pair should resolve");
            assert_eq!(factory.step(), alg.step());
            assert_eq!(factory.algorithm(), alg);
        }
    }

    #[test]
    fn test_unknown_algorithm_fails_for_every_step() {
        let registry = StageRegistry;
        for step in StepKind::ALL {
            let err = registry.resolve(step.name(), "nonexistent").unwrap_err();
            assert!(matches!(err, CompositionError::UnknownAlgorithm { .. }));
        }
        let err = registry.resolve("NotAStep", "nonexistent").unwrap_err();
        assert!(matches!(err, CompositionError::UnknownAlgorithm { .. }));
    }

    #[test]
    fn test_algorithm_from_another_step_is_unknown() {
        let err = StageRegistry.resolve("SpatialSmoothing", "Butterworth").unwrap_err();
        match err {
            CompositionError::UnknownAlgorithm { step, algorithm } => {
                assert_eq!(step, "SpatialSmoothing");
                assert_eq!(algorithm, "Butterworth");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_step_with_known_algorithm() {
        let err = StageRegistry.resolve("Detrending", "SUSAN").unwrap_err();
        assert!(matches!(err, CompositionError::UnknownStep(ref s) if s == "Detrending"));
    }

    #[test]
    fn test_algorithms_for_step() {
        assert_eq!(
            StageRegistry.algorithms_for(StepKind::TemporalFiltering),
            vec![AlgorithmKind::Butterworth, AlgorithmKind::Fslmaths]
        );
        assert_eq!(
            StageRegistry.algorithms_for(StepKind::ConfoundRegression),
            vec![AlgorithmKind::FslGlm, AlgorithmKind::Afni3dTproject]
        );
    }

    #[test]
    fn test_step_names_round_trip() {
        for step in StepKind::ALL {
            assert_eq!(StepKind::from_name(step.name()), Some(step));
        }
        assert_eq!(StepKind::from_name("AROMARegression"), Some(StepKind::AromaRegression));
    }

    #[test]
    fn test_factory_builds_resample_with_reference() {
        let spec = ProcessingStepSpec::new("Resample", "FLIRT")
            .with_parameter("ReferenceImage", "/templates/MNI152.nii.gz");
        let context = ExecutionContext::new("bold.nii.gz");
        let request = StageRequest {
            index: 3,
            spec: &spec,
            context: &context,
            design: None,
        };

        let stage = StageRegistry
            .resolve_kind(StepKind::Resample, AlgorithmKind::Flirt)
            .unwrap()
            .build(&request)
            .unwrap();

        assert_eq!(stage.index(), 3);
        assert_eq!(
            stage.params(),
            &StageParams::Resample {
                reference_image: PathBuf::from("/templates/MNI152.nii.gz")
            }
        );
    }

    #[test]
    fn test_placeholder_reference_image_is_missing() {
        let spec = ProcessingStepSpec::new("Resample", "FLIRT")
            .with_parameter("ReferenceImage", REFERENCE_IMAGE_PLACEHOLDER);
        assert_eq!(reference_image(&spec).unwrap(), None);
    }
}
