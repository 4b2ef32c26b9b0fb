use crate::config::AnalysisConfig;
use crate::core::density::{compute_density, DensityResult};
use crate::core::image::StitchedImage;
use crate::core::ssa::{compute_ssa, SsaModel, SsaResult};
use crate::io::export::StitchedExport;
use crate::io::refractive_index::RefractiveIndexTable;
use crate::types::{ImageType, Plane, SnowError, SnowResult};
use regex::Regex;

/// Leading number of a wavelength attribute such as `"940nm"`
pub fn parse_wavelength(text: &str) -> Option<f64> {
    let re = Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Columns handed to the report generator
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTable {
    pub headers: Vec<String>,
    /// One column per header, all of equal length
    pub columns: Vec<Vec<f64>>,
}

impl ReportTable {
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        self.columns.iter().map(|c| c.get(index).copied()).collect()
    }
}

/// SSA and density derivation for one snow profile
pub struct SnowProfileAnalysis {
    ngr: Plane,
    gri: Option<Plane>,
    px_2_mm: f64,
    wavelength_nm: f64,
    config: AnalysisConfig,
    table: RefractiveIndexTable,
    ssa: Option<SsaResult>,
    density: Option<DensityResult>,
}

impl SnowProfileAnalysis {
    pub fn new(
        ngr: Plane,
        gri: Option<Plane>,
        px_2_mm: f64,
        wavelength_nm: f64,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            ngr,
            gri,
            px_2_mm,
            wavelength_nm,
            config,
            table: RefractiveIndexTable::builtin(),
            ssa: None,
            density: None,
        }
    }

    pub fn with_table(mut self, table: RefractiveIndexTable) -> Self {
        self.table = table;
        self.ssa = None;
        self.density = None;
        self
    }

    /// Analysis of in-memory composites
    pub fn from_stitched(
        ngr: &StitchedImage,
        gri: Option<&StitchedImage>,
        config: AnalysisConfig,
    ) -> SnowResult<Self> {
        if ngr.meta.img_type != ImageType::NoGrid {
            return Err(SnowError::Analysis(format!(
                "Expected a no-grid composite, got {}",
                ngr.meta.img_type
            )));
        }
        let wavelength = if ngr.meta.wavelength > 0.0 {
            ngr.meta.wavelength
        } else {
            config.default_wavelength_nm
        };
        Ok(Self::new(
            ngr.data.clone(),
            gri.map(|g| g.data.clone()),
            ngr.meta.px_2_mm,
            wavelength,
            config,
        ))
    }

    /// Analysis of exported composites; the wavelength comes from the
    /// device attributes
    pub fn from_exports(exports: &[StitchedExport], config: AnalysisConfig) -> SnowResult<Self> {
        let find = |t: ImageType| exports.iter().find(|e| e.img_type == t);
        let ngr = find(ImageType::NoGrid)
            .ok_or_else(|| SnowError::Analysis("No ngr image in export".to_string()))?;
        let wavelength = ngr
            .aux
            .get("wavelength")
            .and_then(|w| parse_wavelength(w))
            .unwrap_or_else(|| {
                log::warn!(
                    "No wavelength in export; assuming {} nm",
                    config.default_wavelength_nm
                );
                config.default_wavelength_nm
            });
        Ok(Self::new(
            ngr.reflectance(),
            find(ImageType::Grid).map(StitchedExport::reflectance),
            ngr.pix2mm,
            wavelength,
            config,
        ))
    }

    #[cfg(feature = "hdf5")]
    pub fn from_file(path: &std::path::Path, config: AnalysisConfig) -> SnowResult<Self> {
        log::info!("Loading exported composites from {}", path.display());
        let exports = crate::io::export::read_exports(path)?;
        Self::from_exports(&exports, config)
    }

    pub fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    pub fn px_2_mm(&self) -> f64 {
        self.px_2_mm
    }

    pub fn has_grid(&self) -> bool {
        self.gri.is_some()
    }

    pub fn calculate_ssa(&mut self) -> SnowResult<&SsaResult> {
        if self.ssa.is_none() {
            log::info!("Calculating SSA at {} nm", self.wavelength_nm);
            let model = SsaModel::from_table(
                self.wavelength_nm,
                &self.table,
                self.config.viewing_angle_deg,
            )?;
            let result = compute_ssa(&self.ngr, self.px_2_mm, &model, &self.config)?;
            self.ssa = Some(result);
        }
        self.ssa
            .as_ref()
            .ok_or_else(|| SnowError::Analysis("SSA unavailable".to_string()))
    }

    /// Density profiles; computes SSA first if needed
    pub fn calculate_density(&mut self) -> SnowResult<&DensityResult> {
        if self.density.is_none() {
            let gri = self
                .gri
                .as_ref()
                .ok_or_else(|| SnowError::Analysis("Density requires a grid image".to_string()))?
                .clone();
            let ssa = self.calculate_ssa()?.ssa.clone();
            log::info!("Calculating density");
            let result = compute_density(&self.ngr, &gri, &ssa, self.px_2_mm, &self.config)?;
            log::info!("✅ Density profiles for {} slits", result.profiles.len());
            self.density = Some(result);
        }
        self.density
            .as_ref()
            .ok_or_else(|| SnowError::Analysis("Density unavailable".to_string()))
    }

    /// Height, SSA and density columns, bottom row first
    pub fn report_table(&self) -> SnowResult<ReportTable> {
        let ssa = self
            .ssa
            .as_ref()
            .ok_or_else(|| SnowError::Analysis("SSA has not been calculated".to_string()))?;
        let rows = ssa.profile.len();

        let mut headers = vec!["index".to_string(), "Height".to_string(), "SSA".to_string()];
        let mut columns = vec![
            (0..rows).map(|i| i as f64).collect(),
            (0..rows).map(|i| i as f64 * self.px_2_mm).collect(),
            ssa.profile.iter().rev().map(|v| *v as f64).collect(),
        ];
        if let Some(density) = &self.density {
            for profile in &density.profiles {
                headers.push("Ice-volume fraction".to_string());
                columns.push(profile.iter().rev().copied().collect());
            }
        }
        Ok(ReportTable { headers, columns })
    }
}
