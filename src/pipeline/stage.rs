//! Stages: the runnable units of a pipeline.
//!
//! A stage wraps one external tool invocation. Its `in_file` port is wired by
//! the composer through graph edges; its side inputs (mask, design matrix,
//! ICA mixing/noise files) are bound when the stage is built and never change
//! afterwards.

use std::collections::BTreeMap;
use std::f64::consts::LN_2;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ExecutionError;

use super::registry::{AlgorithmKind, StepKind};

/// Helper executable for the Butterworth band-pass filter.
pub const BUTTERWORTH_PROGRAM: &str = "butterworth_filter";
/// Helper executable for trimming volumes from a 4D image.
pub const IMAGE_SLICE_PROGRAM: &str = "image_slice";
/// Default R script for the R variant of AROMA regression.
pub const REGFILT_R_SCRIPT: &str = "fsl_regfilt.R";
/// Threads handed to the R variant of AROMA regression.
const REGFILT_R_THREADS: u32 = 4;

/// Factor converting a FWHM into a Gaussian sigma.
pub fn fwhm_to_sigma() -> f64 {
    (8.0 * LN_2).sqrt()
}

/// Named stage ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Port {
    InFile,
    Mask,
    Design,
    Mixing,
    Noise,
    OutFile,
}

impl Port {
    pub fn as_str(&self) -> &'static str {
        match self {
            Port::InFile => "in_file",
            Port::Mask => "mask",
            Port::Design => "design",
            Port::Mixing => "mixing",
            Port::Noise => "noise",
            Port::OutFile => "out_file",
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters a stage was built with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StageParams {
    TemporalFilter {
        high_pass: f64,
        low_pass: f64,
        order: u32,
        tr: f64,
    },
    IntensityNormalization,
    SpatialSmoothing {
        fwhm_mm: f64,
        brightness_threshold: f64,
    },
    AromaRegression {
        script: PathBuf,
    },
    ConfoundRegression,
    TrimTimepoints {
        from_beginning: u32,
        from_end: u32,
    },
    Resample {
        reference_image: PathBuf,
    },
}

/// One argument of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ToolArg {
    Literal(String),
    Path(PathBuf),
    /// Contents of a delimited file joined with commas, resolved at run time.
    FileList(PathBuf),
}

impl ToolArg {
    fn lit(value: impl ToString) -> Self {
        ToolArg::Literal(value.to_string())
    }

    fn path(path: &Path) -> Self {
        ToolArg::Path(path.to_path_buf())
    }
}

impl fmt::Display for ToolArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolArg::Literal(s) => f.write_str(s),
            ToolArg::Path(p) => write!(f, "{}", p.display()),
            ToolArg::FileList(p) => write!(f, "@{}", p.display()),
        }
    }
}

/// A single external command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<ToolArg>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: ToolArg) -> Self {
        self.args.push(arg);
        self
    }

    pub(crate) fn lit(self, value: impl ToString) -> Self {
        self.arg(ToolArg::lit(value))
    }

    pub(crate) fn path(self, path: &Path) -> Self {
        self.arg(ToolArg::path(path))
    }

    pub(crate) fn flag_path(self, flag: &str, path: &Path) -> Self {
        self.lit(flag).path(path)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A built stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    index: usize,
    step: StepKind,
    algorithm: AlgorithmKind,
    params: StageParams,
    bindings: BTreeMap<Port, PathBuf>,
}

impl Stage {
    pub(crate) fn new(
        index: usize,
        step: StepKind,
        algorithm: AlgorithmKind,
        params: StageParams,
    ) -> Self {
        Self {
            index,
            step,
            algorithm,
            params,
            bindings: BTreeMap::new(),
        }
    }

    /// Binds a side input; only used while the stage is being built.
    pub(crate) fn bind(mut self, port: Port, path: Option<&Path>) -> Self {
        if let Some(path) = path {
            self.bindings.insert(port, path.to_path_buf());
        }
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn step(&self) -> StepKind {
        self.step
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    pub fn params(&self) -> &StageParams {
        &self.params
    }

    /// Stable name used for working directories and graph nodes.
    pub fn label(&self) -> String {
        format!("{:02}_{}", self.index, self.algorithm.name())
    }

    /// Path bound to a side-input port.
    pub fn binding(&self, port: Port) -> Option<&Path> {
        self.bindings.get(&port).map(PathBuf::as_path)
    }

    /// Declared input ports: `in_file` first, then bound side inputs.
    pub fn input_ports(&self) -> Vec<Port> {
        std::iter::once(Port::InFile)
            .chain(self.bindings.keys().copied())
            .collect()
    }

    /// The single output port.
    pub fn output_port(&self) -> Port {
        Port::OutFile
    }

    /// Commands that turn `in_file` into `out_file`.
    ///
    /// Fails with [`ExecutionError::MissingBinding`] when a side input the
    /// algorithm reads was never bound.
    pub fn invocations(
        &self,
        in_file: &Path,
        out_file: &Path,
    ) -> Result<Vec<ToolInvocation>, ExecutionError> {
        let mask = self.binding(Port::Mask);

        let invocations = match (&self.params, self.algorithm) {
            (
                StageParams::TemporalFilter {
                    high_pass,
                    low_pass,
                    order,
                    tr,
                },
                AlgorithmKind::Butterworth,
            ) => vec![ToolInvocation::new(BUTTERWORTH_PROGRAM)
                .flag_path("--in", in_file)
                .flag_path("--out", out_file)
                .lit("--tr")
                .lit(tr)
                .lit("--hp")
                .lit(high_pass)
                .lit("--lp")
                .lit(low_pass)
                .lit("--order")
                .lit(order)],
            (
                StageParams::TemporalFilter {
                    high_pass,
                    low_pass,
                    tr,
                    ..
                },
                _,
            ) => {
                let mean = sibling(out_file, "tmean");
                vec![
                    ToolInvocation::new("fslmaths")
                        .path(in_file)
                        .lit("-Tmean")
                        .path(&mean),
                    ToolInvocation::new("fslmaths")
                        .path(in_file)
                        .lit("-bptf")
                        .lit(cutoff_in_volumes(*high_pass, *tr))
                        .lit(cutoff_in_volumes(*low_pass, *tr))
                        .lit("-add")
                        .path(&mean)
                        .path(out_file),
                ]
            }
            (StageParams::IntensityNormalization, _) => {
                let mut cmd = ToolInvocation::new("fslmaths").path(in_file);
                if let Some(mask) = mask {
                    cmd = cmd.flag_path("-mas", mask);
                }
                vec![cmd.lit("-ing").lit(10000).path(out_file)]
            }
            (
                StageParams::SpatialSmoothing {
                    fwhm_mm,
                    brightness_threshold,
                },
                _,
            ) => {
                let susan = ToolInvocation::new("susan")
                    .path(in_file)
                    .lit(brightness_threshold)
                    .lit(fwhm_mm / fwhm_to_sigma())
                    .lit(3)
                    .lit(1)
                    .lit(0)
                    .path(out_file);
                match mask {
                    Some(mask) => vec![
                        susan,
                        ToolInvocation::new("fslmaths")
                            .path(out_file)
                            .flag_path("-mas", mask)
                            .path(out_file)
                            .lit("-odt")
                            .lit("float"),
                    ],
                    None => vec![susan],
                }
            }
            (StageParams::AromaRegression { script }, AlgorithmKind::FslRegfiltR) => {
                vec![ToolInvocation::new("Rscript")
                    .path(script)
                    .path(in_file)
                    .path(self.required(Port::Mixing)?)
                    .path(self.required(Port::Noise)?)
                    .lit(REGFILT_R_THREADS)
                    .path(out_file)]
            }
            (StageParams::AromaRegression { .. }, _) => {
                let mut cmd = ToolInvocation::new("fsl_regfilt")
                    .flag_path("-i", in_file)
                    .flag_path("-o", out_file)
                    .flag_path("-d", self.required(Port::Mixing)?)
                    .lit("-f")
                    .arg(ToolArg::FileList(self.required(Port::Noise)?.to_path_buf()));
                if let Some(mask) = mask {
                    cmd = cmd.flag_path("-m", mask);
                }
                vec![cmd]
            }
            (StageParams::ConfoundRegression, AlgorithmKind::Afni3dTproject) => {
                let mut cmd = ToolInvocation::new("3dTproject")
                    .flag_path("-input", in_file)
                    .flag_path("-prefix", out_file)
                    .flag_path("-ort", self.required(Port::Design)?)
                    .lit("-polort")
                    .lit(0);
                if let Some(mask) = mask {
                    cmd = cmd.flag_path("-mask", mask);
                }
                vec![cmd]
            }
            (StageParams::ConfoundRegression, _) => {
                let mut cmd = ToolInvocation::new("fsl_glm")
                    .flag_path("-i", in_file)
                    .flag_path("-d", self.required(Port::Design)?)
                    .lit(format!("--out_res={}", out_file.display()));
                if let Some(mask) = mask {
                    cmd = cmd.flag_path("-m", mask);
                }
                vec![cmd]
            }
            (
                StageParams::TrimTimepoints {
                    from_beginning,
                    from_end,
                },
                _,
            ) => vec![ToolInvocation::new(IMAGE_SLICE_PROGRAM)
                .flag_path("--in", in_file)
                .flag_path("--out", out_file)
                .lit("--from-beginning")
                .lit(from_beginning)
                .lit("--from-end")
                .lit(from_end)],
            (StageParams::Resample { reference_image }, _) => {
                vec![ToolInvocation::new("flirt")
                    .flag_path("-in", in_file)
                    .flag_path("-ref", reference_image)
                    .flag_path("-out", out_file)
                    .lit("-applyxfm")
                    .lit("-usesqform")]
            }
        };
        Ok(invocations)
    }

    fn required(&self, port: Port) -> Result<&Path, ExecutionError> {
        self.binding(port).ok_or_else(|| ExecutionError::MissingBinding {
            stage: self.label(),
            port: port.as_str(),
        })
    }
}

/// Converts a cutoff in Hz into the sigma (in volumes) fslmaths expects.
/// A negative cutoff disables that side of the filter.
fn cutoff_in_volumes(cutoff_hz: f64, tr: f64) -> f64 {
    if cutoff_hz < 0.0 {
        -1.0
    } else {
        1.0 / (cutoff_hz * fwhm_to_sigma() * tr)
    }
}

/// Path next to `path` with `prefix_` prepended to the file name.
fn sibling(path: &Path, prefix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{prefix}_{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(step: StepKind, algorithm: AlgorithmKind, params: StageParams) -> Stage {
        Stage::new(0, step, algorithm, params)
    }

    #[test]
    fn test_input_ports_lists_bound_side_inputs() {
        let s = stage(
            StepKind::AromaRegression,
            AlgorithmKind::FslRegfilt,
            StageParams::AromaRegression {
                script: PathBuf::from(REGFILT_R_SCRIPT),
            },
        )
        .bind(Port::Mixing, Some(Path::new("mix.tsv")))
        .bind(Port::Noise, Some(Path::new("noise.csv")))
        .bind(Port::Mask, None);

        assert_eq!(s.input_ports(), vec![Port::InFile, Port::Mixing, Port::Noise]);
        assert_eq!(s.output_port(), Port::OutFile);
        assert_eq!(s.label(), "00_fsl_regfilt");
    }

    #[test]
    fn test_fslmaths_cutoffs() {
        assert_eq!(cutoff_in_volumes(-1.0, 2.0), -1.0);
        let sigma = cutoff_in_volumes(0.01, 2.0);
        assert!((sigma - 1.0 / (0.01 * fwhm_to_sigma() * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_temporal_filter_fslmaths_invocations() {
        let s = stage(
            StepKind::TemporalFiltering,
            AlgorithmKind::Fslmaths,
            StageParams::TemporalFilter {
                high_pass: 0.008,
                low_pass: -1.0,
                order: 2,
                tr: 2.0,
            },
        );
        let cmds = s.invocations(Path::new("in.nii.gz"), Path::new("work/out.nii.gz")).unwrap();

        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].to_string(), "fslmaths in.nii.gz -Tmean work/tmean_out.nii.gz");
        assert!(cmds[1].to_string().contains("-add work/tmean_out.nii.gz work/out.nii.gz"));
    }

    #[test]
    fn test_susan_applies_mask_afterwards() {
        let s = stage(
            StepKind::SpatialSmoothing,
            AlgorithmKind::Susan,
            StageParams::SpatialSmoothing {
                fwhm_mm: 6.0,
                brightness_threshold: 0.0,
            },
        )
        .bind(Port::Mask, Some(Path::new("mask.nii.gz")));

        let cmds = s.invocations(Path::new("in.nii.gz"), Path::new("out.nii.gz")).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].program, "susan");
        assert!(cmds[1].to_string().contains("-mas mask.nii.gz"));
    }

    #[test]
    fn test_regfilt_reads_noise_list_at_runtime() {
        let s = stage(
            StepKind::AromaRegression,
            AlgorithmKind::FslRegfilt,
            StageParams::AromaRegression {
                script: PathBuf::from(REGFILT_R_SCRIPT),
            },
        )
        .bind(Port::Mixing, Some(Path::new("mix.tsv")))
        .bind(Port::Noise, Some(Path::new("noise.csv")));

        let cmds = s.invocations(Path::new("in.nii.gz"), Path::new("out.nii.gz")).unwrap();
        assert!(cmds[0]
            .args
            .contains(&ToolArg::FileList(PathBuf::from("noise.csv"))));
    }

    #[test]
    fn test_glm_uses_design_binding() {
        let s = stage(
            StepKind::ConfoundRegression,
            AlgorithmKind::FslGlm,
            StageParams::ConfoundRegression,
        )
        .bind(Port::Design, Some(Path::new("confounds.tsv")));

        let cmds = s.invocations(Path::new("in.nii.gz"), Path::new("out.nii.gz")).unwrap();
        let line = cmds[0].to_string();
        assert_eq!(line, "fsl_glm -i in.nii.gz -d confounds.tsv --out_res=out.nii.gz");
    }

    #[test]
    fn test_unbound_side_input_is_an_error() {
        let s = stage(
            StepKind::ConfoundRegression,
            AlgorithmKind::Afni3dTproject,
            StageParams::ConfoundRegression,
        );

        let err = s
            .invocations(Path::new("in.nii.gz"), Path::new("out.nii.gz"))
            .unwrap_err();
        match err {
            ExecutionError::MissingBinding { stage, port } => {
                assert_eq!(stage, "00_afni_3dTproject");
                assert_eq!(port, "design");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
