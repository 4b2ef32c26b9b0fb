use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Single-channel float image (rows x cols)
pub type Plane = Array2<f32>;

/// Multi-channel float image (rows x cols x channels)
pub type ImageData = Array3<f32>;

/// Database key of an image record
pub type ImageId = u64;

/// Kind of frame recorded by the imager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImageType {
    /// Snow wall without the slit grid in front
    #[serde(rename = "ngr")]
    NoGrid,
    /// Snow wall behind the slit grid
    #[serde(rename = "gri")]
    Grid,
    /// White reference panel used for flat-field correction
    #[serde(rename = "ref")]
    Reference,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::NoGrid => "ngr",
            ImageType::Grid => "gri",
            ImageType::Reference => "ref",
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = SnowError;

    fn from_str(s: &str) -> SnowResult<Self> {
        match s.trim() {
            "ngr" => Ok(ImageType::NoGrid),
            "gri" => Ok(ImageType::Grid),
            "ref" => Ok(ImageType::Reference),
            other => Err(SnowError::Parse(format!("Unknown image type: {}", other))),
        }
    }
}

/// Fractional bounding box over an image, corners in [0, 1] x [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl RoiBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Pixel bounds `(col0, row0, col1, row1)` for an image of the given size.
    ///
    /// Corners are rounded half-to-even and clamped to the image.
    pub fn to_pixels(&self, width: usize, height: usize) -> (usize, usize, usize, usize) {
        let px = |rel: f64, size: usize| -> usize {
            let v = (rel * size as f64).round_ties_even();
            if v <= 0.0 {
                0
            } else {
                (v as usize).min(size)
            }
        };
        (
            px(self.x0, width),
            px(self.y0, height),
            px(self.x1, width),
            px(self.y1, height),
        )
    }
}

/// Calibration target placement of one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiSet {
    /// Gray (49.8 % reflectance) targets
    pub gray: Vec<RoiBox>,
    /// White (94 % reflectance) targets
    pub white: Vec<RoiBox>,
}

impl Default for RoiSet {
    fn default() -> Self {
        Self {
            gray: vec![
                RoiBox::new(0.07691, 0.16448, 0.11837, 0.22293),
                RoiBox::new(0.08479, 0.87572, 0.12991, 0.93579),
                RoiBox::new(0.86776, 0.18187, 0.90737, 0.23641),
            ],
            white: vec![
                RoiBox::new(0.07249, 0.2467, 0.11396, 0.30514),
                RoiBox::new(0.08483, 0.9532, 0.12742, 0.99396),
                RoiBox::new(0.8681, 0.26385, 0.90691, 0.31156),
            ],
        }
    }
}

/// Validated camera/device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(raw: &str) -> SnowResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SnowError::Parse("Empty device identifier".to_string()));
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(SnowError::Parse(format!(
                "Device identifier contains control characters: {:?}",
                raw
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All decimal digits of the identifier, concatenated in order
    pub fn digits(&self) -> String {
        self.0.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-frame database record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    // Identity
    pub filepath: PathBuf,
    pub id: ImageId,
    pub img_type: ImageType,
    pub wavelength: f64,           // nm, 0 marks a dark frame
    pub drk_group: i64,
    pub ref_group: i64,
    pub meas_group: String,        // single group, or a list literal before expansion

    // Free text
    pub location: String,
    pub date: String,
    pub stack: String,

    // Geometry
    pub roi: RoiSet,
    pub coords_pix: [f64; 2],      // reference point, fraction of image size
    pub coords_mm: [f64; 2],       // reference point, physical position
    pub px_2_mm: f64,
    pub stitch_at_mm: Vec<f64>,
    pub affine_points: Vec<Vec<f64>>,
    pub trafo_points: Vec<Vec<f64>>,

    pub aux_data: String,
    pub comment: String,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            filepath: PathBuf::new(),
            id: 0,
            img_type: ImageType::NoGrid,
            wavelength: 0.0,
            drk_group: 0,
            ref_group: 0,
            meas_group: "0".to_string(),
            location: "test".to_string(),
            date: "2024-01-01".to_string(),
            stack: "vert".to_string(),
            roi: RoiSet::default(),
            coords_pix: [0.5, 0.5],
            coords_mm: [0.0, 0.0],
            px_2_mm: 1.0,
            stitch_at_mm: Vec::new(),
            affine_points: vec![Vec::new()],
            trafo_points: vec![Vec::new()],
            aux_data: "[]".to_string(),
            comment: "_".to_string(),
        }
    }
}

impl ImageMetadata {
    pub fn with_path(id: ImageId, filepath: impl Into<PathBuf>) -> Self {
        Self {
            id,
            filepath: filepath.into(),
            ..Default::default()
        }
    }

    pub fn is_dark(&self) -> bool {
        self.wavelength == 0.0
    }

    pub fn is_reference(&self) -> bool {
        self.img_type == ImageType::Reference
    }
}

/// Capture information read alongside the raw pixels
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub body_serial: Option<String>,
    pub datetime_original: Option<String>,
    /// Exposure time (s)
    pub exposure_time: Option<f64>,
    pub black_level: Option<u16>,
    pub white_level: Option<u16>,
    /// Contents of the `_metadata.yaml` sidecar, if one was found
    pub sidecar: Option<serde_yml::Value>,
}

impl CaptureInfo {
    /// Camera serial: EXIF body serial, else the sidecar `device`, else `unknown`
    pub fn serial_number(&self) -> DeviceId {
        if let Some(id) = self.body_serial.as_deref().and_then(|s| DeviceId::new(s).ok()) {
            return id;
        }
        self.sidecar_value(&["device"])
            .and_then(|s| DeviceId::new(&s).ok())
            .unwrap_or_else(DeviceId::unknown)
    }

    /// Scalar sidecar entry at a nested key path, rendered as text
    pub fn sidecar_value(&self, path: &[&str]) -> Option<String> {
        let mut node = self.sidecar.as_ref()?;
        for key in path {
            node = node.get(*key)?;
        }
        match node {
            serde_yml::Value::Null => None,
            serde_yml::Value::String(s) => Some(s.clone()),
            serde_yml::Value::Number(n) => Some(n.to_string()),
            serde_yml::Value::Bool(b) => Some(b.to_string()),
            other => serde_yml::to_string(other).ok().map(|s| s.trim().to_string()),
        }
    }
}

/// Error types for snow image processing
#[derive(Debug, thiserror::Error)]
pub enum SnowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing link: {0}")]
    MissingLink(String),

    #[error("No calibration found: {0}")]
    CalibrationNotFound(String),

    #[error("Serial number mismatch: image reports {image}, calibration is for {calibration}")]
    SerialMismatch { image: String, calibration: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Stage unavailable: {0}")]
    StageUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

/// Result type for snow image operations
pub type SnowResult<T> = Result<T, SnowError>;
