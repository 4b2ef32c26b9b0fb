use crate::types::{SnowError, SnowResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when an image's camera serial differs from its calibration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SerialPolicy {
    /// Log a warning and pass the image through unmodified
    #[default]
    Lenient,
    /// Fail the image with `SnowError::SerialMismatch`
    Strict,
}

/// Parameters of the SSA and density analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Border blanked out on the left and right (mm)
    pub frame_x_mm: f64,
    /// Border blanked out at the top and bottom (mm)
    pub frame_y_mm: f64,
    /// Illumination radius per slit (mm); its length caps the slit count
    pub slit_radii_mm: Vec<f64>,
    /// Offset subtracted from the ice-volume fraction
    pub density_offset: f64,
    pub viewing_angle_deg: f64,
    /// Wavelength assumed when an input carries none (nm)
    pub default_wavelength_nm: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_x_mm: 50.0,
            frame_y_mm: 30.0,
            slit_radii_mm: vec![25.0, 20.0, 15.0, 25.0],
            density_offset: 0.35,
            viewing_angle_deg: 45.0,
            default_wavelength_nm: 940.0,
        }
    }
}

/// Processing configuration shared by all pipeline stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Worker threads per pipeline stage
    pub max_workers: usize,
    /// Overlap-mask blur sigma along columns (pixels)
    pub overlap_sigma_x: f64,
    /// Overlap-mask blur sigma along rows (pixels)
    pub overlap_sigma_y: f64,
    /// Downscale factor applied before blurring the overlap mask
    pub mask_downscale: usize,
    pub pyramid_levels: usize,
    pub ffc_epsilon: f32,
    pub serial_policy: SerialPolicy,
    /// Draw stitching seams into the composite
    pub debug_seams: bool,
    /// Directory with `distortion_calib_<digits>.json` files
    pub calibration_dir: PathBuf,
    /// Optional ice refractive-index table replacing the built-in one
    pub refractive_index_table: Option<PathBuf>,
    pub analysis: AnalysisConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            overlap_sigma_x: 200.0,
            overlap_sigma_y: 200.0,
            mask_downscale: 20,
            pyramid_levels: 6,
            ffc_epsilon: 1e-10,
            serial_policy: SerialPolicy::Lenient,
            debug_seams: false,
            calibration_dir: default_config_dir().join("calibration"),
            refractive_index_table: None,
            analysis: AnalysisConfig::default(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("snowimager")
}

impl ProcessingConfig {
    /// Location of the per-user configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.json")
    }

    pub fn load(path: &Path) -> SnowResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        log::info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> SnowResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration, falling back to defaults when absent or invalid
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if !path.exists() {
            log::info!("No configuration file found. Using defaults.");
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to load configuration: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> SnowResult<()> {
        if self.max_workers == 0 {
            return Err(SnowError::Parse("max_workers must be at least 1".to_string()));
        }
        if self.mask_downscale == 0 {
            return Err(SnowError::Parse("mask_downscale must be at least 1".to_string()));
        }
        if self.pyramid_levels == 0 {
            return Err(SnowError::Parse("pyramid_levels must be at least 1".to_string()));
        }
        if !(self.ffc_epsilon > 0.0) {
            return Err(SnowError::Parse("ffc_epsilon must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.pyramid_levels, 6);
        assert_eq!(config.analysis.slit_radii_mm, vec![25.0, 20.0, 15.0, 25.0]);
        assert_eq!(config.serial_policy, SerialPolicy::Lenient);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ProcessingConfig::default();
        config.serial_policy = SerialPolicy::Strict;
        config.analysis.slit_radii_mm = vec![10.0, 12.0];
        config.save(&path).unwrap();

        let loaded = ProcessingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_workers": 2, "analysis": {"density_offset": 0.3}}"#).unwrap();

        let loaded = ProcessingConfig::load(&path).unwrap();
        assert_eq!(loaded.max_workers, 2);
        assert_eq!(loaded.analysis.density_offset, 0.3);
        assert_eq!(loaded.analysis.frame_x_mm, 50.0);
        assert_eq!(loaded.overlap_sigma_x, 200.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_workers": 0}"#).unwrap();
        assert!(ProcessingConfig::load(&path).is_err());
    }
}
