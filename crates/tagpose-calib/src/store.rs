//! Calibration record persistence.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tagpose_core::CalibrationParameters;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("refusing to store an invalid calibration: {0}")]
    Invalid(#[from] tagpose_core::CameraModelError),
}

/// Where calibration records live between sessions.
///
/// `load` never fails: a missing or unreadable record is the normal
/// bootstrap state and yields `None`.
pub trait CalibrationStore {
    fn load(&self) -> Option<CalibrationParameters>;
    fn save(&mut self, params: &CalibrationParameters) -> Result<(), StoreError>;
}

impl<S: CalibrationStore + ?Sized> CalibrationStore for Box<S> {
    fn load(&self) -> Option<CalibrationParameters> {
        (**self).load()
    }

    fn save(&mut self, params: &CalibrationParameters) -> Result<(), StoreError> {
        (**self).save(params)
    }
}

/// On-disk envelope; the version lets future layouts coexist.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    #[serde(flatten)]
    params: CalibrationParameters,
}

const RECORD_VERSION: u32 = 1;

/// JSON calibration record at a fixed path.
#[derive(Clone, Debug)]
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    pub const DEFAULT_PATH: &'static str = "camera.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<CalibrationParameters, StoreError> {
        let raw = fs::read_to_string(&self.path)?;
        let record: RecordFile = serde_json::from_str(&raw)?;
        record.params.validate()?;
        Ok(record.params)
    }
}

impl Default for FileCalibrationStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self) -> Option<CalibrationParameters> {
        match self.read() {
            Ok(params) => {
                log::info!("loaded camera calibration from {}", self.path.display());
                Some(params)
            }
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no camera calibration at {}", self.path.display());
                None
            }
            Err(err) => {
                log::warn!(
                    "ignoring unreadable camera calibration {}: {err}",
                    self.path.display()
                );
                None
            }
        }
    }

    /// Write atomically: serialize to a sibling temp file, then rename.
    fn save(&mut self, params: &CalibrationParameters) -> Result<(), StoreError> {
        params.validate()?;
        let record = RecordFile {
            version: RECORD_VERSION,
            params: params.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        log::info!("saved camera calibration to {}", self.path.display());
        Ok(())
    }
}

/// Store that keeps the record in memory; useful for tests and for callers
/// that manage persistence themselves.
#[derive(Clone, Debug, Default)]
pub struct MemoryCalibrationStore {
    record: Option<CalibrationParameters>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(params: CalibrationParameters) -> Self {
        Self {
            record: Some(params),
        }
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self) -> Option<CalibrationParameters> {
        self.record.clone()
    }

    fn save(&mut self, params: &CalibrationParameters) -> Result<(), StoreError> {
        params.validate()?;
        self.record = Some(params.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CalibrationParameters {
        CalibrationParameters {
            camera_matrix: [[512.25, 0.0, 241.5], [0.0, 509.75, 119.25], [0.0, 0.0, 1.0]],
            distortion: vec![-0.21, 0.043, 0.0007, -0.0004, 0.0],
            image_size: Some([480, 240]),
            rms_error: Some(0.31),
            views: Some(10),
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCalibrationStore::new(dir.path().join("camera.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileCalibrationStore::new(dir.path().join("nested/camera.json"));
        store.save(&record()).expect("save");
        assert_eq!(store.load(), Some(record()));
        assert_eq!(
            store.load().expect("found").camera_params(),
            record().camera_params()
        );
    }

    #[test]
    fn garbage_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("camera.json");
        fs::write(&path, b"\x93NUMPY not json").expect("write");
        assert!(FileCalibrationStore::new(&path).load().is_none());
    }

    #[test]
    fn invalid_matrix_on_disk_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("camera.json");
        fs::write(
            &path,
            r#"{"version":1,"camera_matrix":[[0,0,0],[0,0,0],[0,0,1]],"distortion":[0,0,0,0,0]}"#,
        )
        .expect("write");
        assert!(FileCalibrationStore::new(&path).load().is_none());
    }

    #[test]
    fn save_rejects_invalid_record() {
        let mut bad = record();
        bad.camera_matrix[1][1] = -1.0;
        let mut store = MemoryCalibrationStore::new();
        assert!(matches!(store.save(&bad), Err(StoreError::Invalid(_))));
        assert!(store.load().is_none());
    }
}
