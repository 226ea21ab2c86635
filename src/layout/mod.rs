//! Dataset layout: finding images and their companion files in an fMRIPrep
//! derivatives tree.
//!
//! The postprocess flows only talk to [`DatasetLayout`]; [`FsLayout`] is the
//! filesystem implementation used by the binary. It indexes the tree once on
//! open and answers every query from that index.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::LayoutError;

/// Entities parsed from a BIDS file name such as
/// `sub-01_ses-1_task-rest_run-2_space-MNI_desc-preproc_bold.nii.gz`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidsEntities {
    pub subject: String,
    pub session: Option<String>,
    pub task: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
    pub space: Option<String>,
    pub desc: Option<String>,
    pub suffix: String,
    /// Everything after the first `.`, e.g. `nii.gz`.
    pub extension: String,
}

impl BidsEntities {
    /// Parses a file name. Returns `None` when there is no `sub-` entity.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = match file_name.split_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (file_name, ""),
        };

        let mut entities = Self {
            extension: extension.to_string(),
            ..Default::default()
        };

        for part in stem.split('_') {
            match part.split_once('-') {
                Some(("sub", value)) => entities.subject = value.to_string(),
                Some(("ses", value)) => entities.session = Some(value.to_string()),
                Some(("task", value)) => entities.task = Some(value.to_string()),
                Some(("acq", value)) => entities.acquisition = Some(value.to_string()),
                Some(("run", value)) => entities.run = Some(value.to_string()),
                Some(("space", value)) => entities.space = Some(value.to_string()),
                Some(("desc", value)) => entities.desc = Some(value.to_string()),
                Some(_) => {}
                None => entities.suffix = part.to_string(),
            }
        }

        (!entities.subject.is_empty()).then_some(entities)
    }

    /// Whether `other` belongs to the same acquisition, ignoring space,
    /// description and suffix.
    pub fn same_series(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.session == other.session
            && self.task == other.task
            && self.acquisition == other.acquisition
            && self.run == other.run
    }

    fn is(&self, desc: Option<&str>, suffix: &str, extensions: &[&str]) -> bool {
        self.desc.as_deref() == desc
            && self.suffix == suffix
            && extensions.contains(&self.extension.as_str())
    }

    fn is_preproc_bold(&self) -> bool {
        self.is(Some("preproc"), "bold", &["nii.gz", "nii"])
    }
}

/// Which images of a subject to process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageQuery {
    pub space: String,
    /// Empty matches every task.
    pub tasks: Vec<String>,
    /// Empty matches every acquisition.
    pub acquisitions: Vec<String>,
}

impl ImageQuery {
    pub fn new(space: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            ..Default::default()
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<String>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_acquisitions(mut self, acquisitions: Vec<String>) -> Self {
        self.acquisitions = acquisitions;
        self
    }

    fn matches(&self, entities: &BidsEntities) -> bool {
        let in_list = |list: &[String], value: &Option<String>| {
            list.is_empty() || value.as_ref().is_some_and(|v| list.contains(v))
        };
        entities.space.as_deref() == Some(self.space.as_str())
            && in_list(&self.tasks, &entities.task)
            && in_list(&self.acquisitions, &entities.acquisition)
    }
}

/// Read access to a preprocessed dataset.
pub trait DatasetLayout: Send + Sync {
    /// Root of the derivatives tree.
    fn root(&self) -> &Path;

    /// Subject ids (without the `sub-` prefix), sorted.
    fn subjects(&self) -> Vec<String>;

    /// Preprocessed BOLD images of `subject` matching `query`, sorted.
    fn images(&self, subject: &str, query: &ImageQuery) -> Vec<PathBuf>;

    /// Entities of an image that belongs to the dataset.
    fn entities(&self, image: &Path) -> Result<BidsEntities, LayoutError>;

    /// Brain mask in the image's space.
    fn mask(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError>;

    /// Repetition time in seconds from the image's JSON sidecar.
    fn tr(&self, image: &Path) -> Result<Option<f64>, LayoutError>;

    /// Confounds table of the image's series.
    fn confounds(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError>;

    /// MELODIC mixing matrix of the image's series.
    fn mixing(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError>;

    /// ICA-AROMA noise components of the image's series.
    fn noise(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError>;

    /// Resolves the subjects to process. An empty request selects every
    /// subject; requested ids may carry the `sub-` prefix.
    fn select_subjects(&self, requested: &[String]) -> Result<Vec<String>, LayoutError> {
        let available = self.subjects();

        let selected = if requested.is_empty() {
            available
        } else {
            requested
                .iter()
                .map(|id| {
                    let id = id.strip_prefix("sub-").unwrap_or(id);
                    if available.iter().any(|s| s == id) {
                        Ok(id.to_string())
                    } else {
                        Err(LayoutError::SubjectNotFound(id.to_string()))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        if selected.is_empty() {
            return Err(LayoutError::NoSubjectsFound);
        }
        Ok(selected)
    }
}

#[derive(Debug, Clone)]
struct IndexedFile {
    path: PathBuf,
    entities: BidsEntities,
}

/// [`DatasetLayout`] over an fMRIPrep derivatives directory.
#[derive(Debug, Clone)]
pub struct FsLayout {
    root: PathBuf,
    subjects: Vec<String>,
    files: Vec<IndexedFile>,
}

impl FsLayout {
    /// Indexes every BIDS-named file under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LayoutError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(LayoutError::MissingDirectory(root));
        }

        let mut subjects = BTreeSet::new();
        for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.strip_prefix("sub-")) {
                subjects.insert(id.to_string());
            }
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping directory entry: {}", err);
                    None
                }
            })
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(entities) = entry.file_name().to_str().and_then(BidsEntities::parse) else {
                continue;
            };
            files.push(IndexedFile {
                path: entry.into_path(),
                entities,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Indexed {} files for {} subjects under {}",
            files.len(),
            subjects.len(),
            root.display()
        );

        Ok(Self {
            root,
            subjects: subjects.into_iter().collect(),
            files,
        })
    }

    fn lookup(&self, image: &Path) -> Result<&IndexedFile, LayoutError> {
        let name = image.file_name();
        self.files
            .iter()
            .find(|f| f.path == image || (name.is_some() && f.path.file_name() == name))
            .ok_or_else(|| LayoutError::UnknownImage(image.to_path_buf()))
    }

    fn companion(
        &self,
        image: &Path,
        pred: impl Fn(&BidsEntities, &BidsEntities) -> bool,
    ) -> Result<Option<PathBuf>, LayoutError> {
        let image = &self.lookup(image)?.entities;
        Ok(self
            .files
            .iter()
            .find(|f| f.entities.same_series(image) && pred(&f.entities, image))
            .map(|f| f.path.clone()))
    }
}

impl DatasetLayout for FsLayout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn subjects(&self) -> Vec<String> {
        self.subjects.clone()
    }

    fn images(&self, subject: &str, query: &ImageQuery) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|f| {
                f.entities.subject == subject
                    && f.entities.is_preproc_bold()
                    && query.matches(&f.entities)
            })
            .map(|f| f.path.clone())
            .collect()
    }

    fn entities(&self, image: &Path) -> Result<BidsEntities, LayoutError> {
        Ok(self.lookup(image)?.entities.clone())
    }

    fn mask(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError> {
        self.companion(image, |candidate, image| {
            candidate.space == image.space
                && candidate.is(Some("brain"), "mask", &["nii.gz", "nii"])
        })
    }

    fn tr(&self, image: &Path) -> Result<Option<f64>, LayoutError> {
        let image = &self.lookup(image)?.path;
        let Some(name) = image.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
        let sidecar = image.with_file_name(format!("{stem}.json"));
        if !sidecar.is_file() {
            return Ok(None);
        }

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&sidecar)?)?;
        Ok(json.get("RepetitionTime").and_then(|v| v.as_f64()))
    }

    fn confounds(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError> {
        self.companion(image, |candidate, _| {
            candidate.is(Some("confounds"), "timeseries", &["tsv"])
                || candidate.is(Some("confounds"), "regressors", &["tsv"])
        })
    }

    fn mixing(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError> {
        self.companion(image, |candidate, _| {
            candidate.is(Some("MELODIC"), "mixing", &["tsv"])
        })
    }

    fn noise(&self, image: &Path) -> Result<Option<PathBuf>, LayoutError> {
        self.companion(image, |candidate, _| {
            candidate.is(None, "AROMAnoiseICs", &["csv"])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SERIES: &str = "sub-01_task-rest_run-1";

    fn touch(root: &Path, relative: &str, contents: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn dataset() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let image = touch(
            root,
            &format!("sub-01/func/{SERIES}_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz"),
            "",
        );
        touch(
            root,
            &format!("sub-01/func/{SERIES}_space-MNI152NLin2009cAsym_desc-preproc_bold.json"),
            r#"{"RepetitionTime": 2.0}"#,
        );
        touch(
            root,
            &format!("sub-01/func/{SERIES}_space-MNI152NLin2009cAsym_desc-brain_mask.nii.gz"),
            "",
        );
        touch(root, &format!("sub-01/func/{SERIES}_space-T1w_desc-brain_mask.nii.gz"), "");
        touch(root, &format!("sub-01/func/{SERIES}_desc-confounds_timeseries.tsv"), "a\n1\n");
        touch(root, &format!("sub-01/func/{SERIES}_desc-MELODIC_mixing.tsv"), "");
        touch(root, &format!("sub-01/func/{SERIES}_AROMAnoiseICs.csv"), "1,2");
        touch(
            root,
            "sub-01/func/sub-01_task-nback_run-1_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz",
            "",
        );
        touch(root, "sub-02/anat/sub-02_desc-preproc_T1w.nii.gz", "");
        (dir, image)
    }

    #[test]
    fn test_parse_entities() {
        let entities =
            BidsEntities::parse("sub-01_ses-2_task-rest_acq-mb_run-3_space-MNI_desc-preproc_bold.nii.gz")
                .unwrap();
        assert_eq!(entities.subject, "01");
        assert_eq!(entities.session.as_deref(), Some("2"));
        assert_eq!(entities.acquisition.as_deref(), Some("mb"));
        assert_eq!(entities.run.as_deref(), Some("3"));
        assert_eq!(entities.space.as_deref(), Some("MNI"));
        assert_eq!(entities.suffix, "bold");
        assert_eq!(entities.extension, "nii.gz");

        assert!(BidsEntities::parse("dataset_description.json").is_none());
    }

    #[test]
    fn test_images_filtered_by_query() {
        let (dir, image) = dataset();
        let layout = FsLayout::open(dir.path()).unwrap();

        assert_eq!(layout.subjects(), vec!["01", "02"]);

        let all = layout.images("01", &ImageQuery::new("MNI152NLin2009cAsym"));
        assert_eq!(all.len(), 2);

        let rest = layout.images(
            "01",
            &ImageQuery::new("MNI152NLin2009cAsym").with_tasks(vec!["rest".to_string()]),
        );
        assert_eq!(rest, vec![image]);

        assert!(layout.images("01", &ImageQuery::new("T1w")).is_empty());
    }

    #[test]
    fn test_companion_files() {
        let (dir, image) = dataset();
        let layout = FsLayout::open(dir.path()).unwrap();

        let mask = layout.mask(&image).unwrap().unwrap();
        assert!(mask.to_string_lossy().contains("space-MNI152NLin2009cAsym_desc-brain_mask"));
        assert_eq!(layout.tr(&image).unwrap(), Some(2.0));
        assert!(layout
            .confounds(&image)
            .unwrap()
            .unwrap()
            .ends_with(format!("{SERIES}_desc-confounds_timeseries.tsv")));
        assert!(layout.mixing(&image).unwrap().is_some());
        assert!(layout.noise(&image).unwrap().is_some());
    }

    #[test]
    fn test_missing_companions() {
        let (dir, _) = dataset();
        let layout = FsLayout::open(dir.path()).unwrap();
        let nback = layout
            .images(
                "01",
                &ImageQuery::new("MNI152NLin2009cAsym").with_tasks(vec!["nback".to_string()]),
            )
            .remove(0);

        assert_eq!(layout.tr(&nback).unwrap(), None);
        assert_eq!(layout.confounds(&nback).unwrap(), None);
        assert!(matches!(
            layout.entities(Path::new("/elsewhere/sub-09_bold.nii.gz")),
            Err(LayoutError::UnknownImage(_))
        ));
    }

    #[test]
    fn test_select_subjects() {
        let (dir, _) = dataset();
        let layout = FsLayout::open(dir.path()).unwrap();

        assert_eq!(layout.select_subjects(&[]).unwrap(), vec!["01", "02"]);
        assert_eq!(
            layout.select_subjects(&["sub-02".to_string()]).unwrap(),
            vec!["02"]
        );
        assert!(matches!(
            layout.select_subjects(&["07".to_string()]),
            Err(LayoutError::SubjectNotFound(ref id)) if id == "07"
        ));
    }

    #[test]
    fn test_subjects_are_top_level_directories() {
        let (dir, _) = dataset();
        touch(dir.path(), "sub-03.html", "");
        touch(dir.path(), "sub-01/figures/sub-04/report.svg", "");
        let layout = FsLayout::open(dir.path()).unwrap();

        assert_eq!(layout.subjects(), vec!["01", "02"]);
    }

    #[test]
    fn test_no_subjects() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::open(dir.path()).unwrap();
        assert!(matches!(layout.select_subjects(&[]), Err(LayoutError::NoSubjectsFound)));
        assert!(matches!(
            FsLayout::open(dir.path().join("missing")),
            Err(LayoutError::MissingDirectory(_))
        ));
    }
}
