//! Integration tests for job distribution over a dataset on disk.

use std::path::{Path, PathBuf};

use fmri_postproc::config::PROCESSING_DESCRIPTION_FILE_NAME;
use fmri_postproc::distributor::{Distributor, Granularity, SubjectTargets};
use fmri_postproc::layout::{DatasetLayout, FsLayout, ImageQuery};
use fmri_postproc::postprocess::{
    postprocess_subject, postprocess_subjects, RunFlags, SubjectRequest, SubjectsRequest,
};
use fmri_postproc::scheduler::{BatchScheduler, BatchSystemConfig, Resources};
use fmri_postproc::template::{JobTemplate, TemplateBag};
use tempfile::TempDir;

const SPACE: &str = "MNI152NLin2009cAsym";

struct Project {
    dir: TempDir,
}

impl Project {
    fn new(subjects: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let project = Self { dir };

        for subject in subjects {
            for task in ["rest", "nback"] {
                project.touch(&format!(
                    "data_fmriprep/sub-{subject}/func/sub-{subject}_task-{task}_space-{SPACE}_desc-preproc_bold.nii.gz"
                ));
            }
        }

        let config = serde_json::json!({
            "ProjectDirectory": project.root().display().to_string(),
            "FMRIPrepOptions": {
                "BIDSDirectory": project.root().join("data_BIDS").display().to_string(),
                "OutputDirectory": project.fmriprep_dir().display().to_string()
            },
            "PostProcessingOptions": {
                "TargetTasks": ["rest"],
                "ProcessingSteps": ["SpatialSmoothing"],
                "ProcessingStepOptions": {
                    "SpatialSmoothing": {"Algorithm": "SUSAN", "FWHM": 6},
                    "Resample": {"ReferenceImage": "SET REFERENCE IMAGE"}
                },
                "BatchOptions": {"MemoryUsage": "20000", "TimeUsage": "4:0:0", "NThreads": 2}
            }
        });
        std::fs::write(project.config_file(), serde_json::to_string_pretty(&config).unwrap())
            .unwrap();
        project
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn fmriprep_dir(&self) -> PathBuf {
        self.root().join("data_fmriprep")
    }

    fn config_file(&self) -> PathBuf {
        self.root().join("config.json")
    }

    fn touch(&self, relative: &str) {
        let path = self.root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }
}

#[test]
fn test_three_subjects_from_layout() {
    let project = Project::new(&["01", "02", "03"]);
    let layout = FsLayout::open(project.fmriprep_dir()).unwrap();
    let subjects = layout.select_subjects(&[]).unwrap();

    let listing: Vec<_> = subjects.into_iter().map(SubjectTargets::new).collect();
    let shared = TemplateBag::new()
        .with("program", "fmri-postproc")
        .with("bids_dir", "bids")
        .with("fmriprep_dir", "fmriprep")
        .with("output_dir", "out")
        .with("processing_stream", "default")
        .with("config_file", "config.json")
        .with("index_dir", "index")
        .with("log_dir", "logs")
        .with_flag("batch", false, "-no-batch")
        .with_flag("submit", false, "-submit")
        .with_flag("debug", false, "-debug");

    let mut scheduler = BatchScheduler::new(Some(BatchSystemConfig::slurm()), "logs/distributor");
    Distributor::new(JobTemplate::subject(), shared, Resources::non_processing())
        .distribute(Distributor::enumerate(&listing, Granularity::Subject), &mut scheduler);

    let ids: Vec<_> = scheduler.jobs().iter().map(|j| j.id.clone()).collect();
    assert_eq!(
        ids,
        vec!["Postprocessing_sub-01", "Postprocessing_sub-02", "Postprocessing_sub-03"]
    );

    let first = scheduler.print_jobs();
    assert_eq!(first, scheduler.print_jobs());
    assert!(first.contains("sbatch --no-requeue --mem=2000 -t 0:30:0 -n 1 -J Postprocessing_sub-01"));
    assert!(first.contains("--wrap=\"fmri-postproc subject 01 bids fmriprep out default"));
}

#[test]
fn test_layout_filters_target_tasks() {
    let project = Project::new(&["01"]);
    let layout = FsLayout::open(project.fmriprep_dir()).unwrap();

    let images = layout.images(
        "01",
        &ImageQuery::new(SPACE).with_tasks(vec!["rest".to_string()]),
    );
    assert_eq!(images.len(), 1);
    assert!(images[0].to_string_lossy().contains("task-rest"));
}

#[tokio::test]
async fn test_subjects_flow_prints_jobs() {
    let project = Project::new(&["01", "02"]);

    let mut request = SubjectsRequest::new(project.config_file());
    request.subjects = vec!["sub-02".to_string()];
    postprocess_subjects(request).await.unwrap();

    let mut missing = SubjectsRequest::new(project.config_file());
    missing.subjects = vec!["09".to_string()];
    let err = postprocess_subjects(missing).await.unwrap_err();
    assert!(err.to_string().contains("09"));
}

#[tokio::test]
async fn test_subject_flow_prepares_outputs() {
    let project = Project::new(&["01"]);
    let output_dir = project.root().join("data_postproc");
    let log_dir = project.root().join("logs/postproc_logs");

    postprocess_subject(SubjectRequest {
        subject_id: "01".to_string(),
        bids_dir: project.root().join("data_BIDS"),
        fmriprep_dir: project.fmriprep_dir(),
        output_dir: output_dir.clone(),
        processing_stream: "default".to_string(),
        config_file: project.config_file(),
        index_dir: project.root().join("bids_index"),
        log_dir: log_dir.clone(),
        flags: RunFlags::default(),
        program: "fmri-postproc".to_string(),
    })
    .await
    .unwrap();

    assert!(log_dir.join("sub-01").is_dir());
    assert!(output_dir.join("default/sub-01").is_dir());
    assert!(output_dir.join("working/default/sub-01").is_dir());

    let description: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(output_dir.join("default").join(PROCESSING_DESCRIPTION_FILE_NAME))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(description["ProcessingSteps"], serde_json::json!(["SpatialSmoothing"]));
    assert!(description["ProcessingStepOptions"].get("Resample").is_none());
}
