use crate::types::{DeviceId, SnowError, SnowResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which of the two imager heads recorded a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountPosition {
    Top,
    Bottom,
}

impl MountPosition {
    /// `Top` when the file path mentions "top" (any case), else `Bottom`
    pub fn from_path(path: &Path) -> Self {
        if path.to_string_lossy().to_lowercase().contains("top") {
            MountPosition::Top
        } else {
            MountPosition::Bottom
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MountPosition::Top => "top",
            MountPosition::Bottom => "bottom",
        }
    }
}

/// Resize factor after dewarping, either uniform or per axis `[fx, fy]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stretch {
    Uniform(f64),
    Axes([f64; 2]),
}

impl Default for Stretch {
    fn default() -> Self {
        Stretch::Uniform(1.0)
    }
}

impl Stretch {
    /// `(fx, fy)`
    pub fn factors(&self) -> (f64, f64) {
        match *self {
            Stretch::Uniform(f) => (f, f),
            Stretch::Axes([fx, fy]) => (fx, fy),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.factors() == (1.0, 1.0)
    }
}

/// Lens model and corrections for one mounting position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionProfile {
    /// Distortion center, column (pixels)
    pub xcenter: f64,
    /// Distortion center, row (pixels)
    pub ycenter: f64,
    /// Backward polynomial coefficients, lowest order first
    pub factors: Vec<f64>,
    /// Rotation applied after dewarping (degrees, counter-clockwise)
    #[serde(default)]
    pub rotation: f64,
    /// Circular shift along columns (pixels)
    #[serde(default)]
    pub shift: i64,
    #[serde(default)]
    pub stretch: Stretch,
}

/// Contents of a `distortion_calib_<digits>.json` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionCalibration {
    #[serde(rename = "Serial No.")]
    pub serial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<DistortionProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<DistortionProfile>,
}

impl DistortionCalibration {
    pub fn file_name(device: &DeviceId) -> String {
        format!("distortion_calib_{}.json", device.digits())
    }

    pub fn load(path: &Path) -> SnowResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let calibration: Self = serde_json::from_str(&text)?;
        log::info!(
            "Loaded distortion calibration for serial {} from {}",
            calibration.serial,
            path.display()
        );
        Ok(calibration)
    }

    pub fn save(&self, path: &Path) -> SnowResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Whether this calibration was made for `device`
    pub fn matches(&self, device: &DeviceId) -> bool {
        self.serial.trim() == device.as_str()
    }

    pub fn profile(&self, position: MountPosition) -> SnowResult<&DistortionProfile> {
        let profile = match position {
            MountPosition::Top => self.top.as_ref(),
            MountPosition::Bottom => self.bottom.as_ref(),
        };
        profile.ok_or_else(|| {
            SnowError::CalibrationNotFound(format!(
                "calibration for {} has no '{}' profile",
                self.serial,
                position.as_str()
            ))
        })
    }
}

/// Calibration files of a directory, loaded once per device
#[derive(Debug)]
pub struct CalibrationLibrary {
    dir: PathBuf,
    cache: Mutex<HashMap<DeviceId, Arc<DistortionCalibration>>>,
}

impl CalibrationLibrary {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, device: &DeviceId) -> PathBuf {
        self.dir.join(DistortionCalibration::file_name(device))
    }

    /// Calibration file of `device`.
    ///
    /// A device without digits or without a file yields
    /// `CalibrationNotFound`; any other read failure is returned as is.
    pub fn lookup(&self, device: &DeviceId) -> SnowResult<Arc<DistortionCalibration>> {
        if let Some(found) = self.cache.lock().get(device) {
            return Ok(Arc::clone(found));
        }
        if device.digits().is_empty() {
            return Err(SnowError::CalibrationNotFound(format!(
                "device {} has no serial digits",
                device
            )));
        }

        let path = self.path_for(device);
        let calibration = match DistortionCalibration::load(&path) {
            Ok(c) => Arc::new(c),
            Err(SnowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnowError::CalibrationNotFound(format!(
                    "no calibration file {} for device {}",
                    path.display(),
                    device
                )))
            }
            Err(e) => return Err(e),
        };

        self.cache
            .lock()
            .insert(device.clone(), Arc::clone(&calibration));
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "Serial No.": "snowimager-06",
        "top": {"xcenter": 10.0, "ycenter": 12.5, "factors": [1.0, 0.0, -1e-7],
                "rotation": 0.5, "shift": 3, "stretch": [0.995, 1.0]},
        "bottom": {"xcenter": 11.0, "ycenter": 12.0, "factors": [1.0]}
    }"#;

    #[test]
    fn test_mount_position() {
        assert_eq!(MountPosition::from_path(Path::new("/d/TOP_cam/f.bay")), MountPosition::Top);
        assert_eq!(MountPosition::from_path(Path::new("/d/lower/f.bay")), MountPosition::Bottom);
    }

    #[test]
    fn test_parse_profiles() {
        let calibration: DistortionCalibration = serde_json::from_str(SAMPLE).unwrap();
        let top = calibration.profile(MountPosition::Top).unwrap();
        assert_eq!(top.shift, 3);
        assert_eq!(top.stretch.factors(), (0.995, 1.0));
        let bottom = calibration.profile(MountPosition::Bottom).unwrap();
        assert_eq!(bottom.rotation, 0.0);
        assert!(bottom.stretch.is_identity());
        assert!(calibration.matches(&DeviceId::new("snowimager-06").unwrap()));
        assert!(!calibration.matches(&DeviceId::new("snowimager-07").unwrap()));
    }

    #[test]
    fn test_library_lookup() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("distortion_calib_06.json"), SAMPLE).unwrap();
        let library = CalibrationLibrary::new(dir.path());

        let device = DeviceId::new("snowimager-06").unwrap();
        let first = library.lookup(&device).unwrap();
        let second = library.lookup(&device).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let missing = DeviceId::new("snowimager-09").unwrap();
        assert!(matches!(library.lookup(&missing), Err(SnowError::CalibrationNotFound(_))));
        assert!(matches!(
            library.lookup(&DeviceId::unknown()),
            Err(SnowError::CalibrationNotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("distortion_calib_01.json"), "{not json").unwrap();
        let library = CalibrationLibrary::new(dir.path());
        let result = library.lookup(&DeviceId::new("snowimager-01").unwrap());
        assert!(matches!(result, Err(SnowError::Json(_))));
    }
}
