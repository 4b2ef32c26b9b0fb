use crate::types::{SnowError, SnowResult};
use std::path::Path;

/// One row of an ice refractive-index table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefractiveIndex {
    pub wavelength_um: f64,
    pub real: f64,
    pub imag: f64,
}

/// Approximate complex refractive index of ice over the imager's LED range
const BUILTIN: [(f64, f64, f64); 16] = [
    (0.400, 1.3194, 2.365e-11),
    (0.450, 1.3157, 8.036e-11),
    (0.500, 1.3130, 3.150e-10),
    (0.550, 1.3110, 1.290e-9),
    (0.600, 1.3094, 2.640e-9),
    (0.650, 1.3080, 1.070e-8),
    (0.700, 1.3069, 3.020e-8),
    (0.750, 1.3058, 6.630e-8),
    (0.800, 1.3049, 1.270e-7),
    (0.850, 1.3041, 2.500e-7),
    (0.900, 1.3034, 5.700e-7),
    (0.940, 1.3028, 1.450e-6),
    (0.960, 1.3025, 1.950e-6),
    (1.000, 1.3020, 1.800e-6),
    (1.030, 1.3016, 2.200e-6),
    (1.100, 1.3006, 1.200e-6),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RefractiveIndexTable {
    rows: Vec<RefractiveIndex>,
}

impl Default for RefractiveIndexTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RefractiveIndexTable {
    pub fn builtin() -> Self {
        Self {
            rows: BUILTIN
                .iter()
                .map(|&(wavelength_um, real, imag)| RefractiveIndex {
                    wavelength_um,
                    real,
                    imag,
                })
                .collect(),
        }
    }

    /// Whitespace-separated `µm real imag` rows after a single header line
    pub fn parse(text: &str) -> SnowResult<Self> {
        let mut rows = Vec::new();
        for (lineno, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let values: Vec<f64> = line
                .split_whitespace()
                .map(|v| v.parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| {
                    SnowError::Parse(format!("Refractive index line {}: {}", lineno + 1, e))
                })?;
            if values.len() < 3 {
                return Err(SnowError::Parse(format!(
                    "Refractive index line {}: expected 3 columns, found {}",
                    lineno + 1,
                    values.len()
                )));
            }
            rows.push(RefractiveIndex {
                wavelength_um: values[0],
                real: values[1],
                imag: values[2],
            });
        }
        if rows.is_empty() {
            return Err(SnowError::Parse("Refractive index table is empty".to_string()));
        }
        Ok(Self { rows })
    }

    pub fn load(path: &Path) -> SnowResult<Self> {
        let table = Self::parse(&std::fs::read_to_string(path)?)?;
        log::debug!(
            "Loaded {} refractive index rows from {}",
            table.rows.len(),
            path.display()
        );
        Ok(table)
    }

    /// Table from `path` if given, else the built-in one
    pub fn from_optional_path(path: Option<&Path>) -> SnowResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::builtin()),
        }
    }

    pub fn rows(&self) -> &[RefractiveIndex] {
        &self.rows
    }

    /// Row closest to `wavelength_nm`; ties resolve to the earlier row
    pub fn nearest(&self, wavelength_nm: f64) -> SnowResult<&RefractiveIndex> {
        let target_um = wavelength_nm / 1000.0;
        let mut best: Option<(&RefractiveIndex, f64)> = None;
        for row in &self.rows {
            let distance = (row.wavelength_um - target_um).abs();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((row, distance));
            }
        }
        best.map(|(row, _)| row).ok_or_else(|| {
            SnowError::Analysis(format!("No refractive index for {} nm", wavelength_nm))
        })
    }

    pub fn imaginary_index(&self, wavelength_nm: f64) -> SnowResult<f64> {
        Ok(self.nearest(wavelength_nm)?.imag)
    }
}
