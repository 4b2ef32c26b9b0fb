//! Specific surface area from near-infrared reflectance.
//!
//! Uses the asymptotic radiative-transfer relation for a sphere-like grain
//! shape: `SSA = B·γ / (3·ρ_ice·(ln(R)/(8x))²·(1 - gG))`, with the ice
//! absorption coefficient `γ = 4π·k/λ` taken from the refractive-index
//! table and `x = 3/7·(1 + 2·cos θ)` for the illumination angle θ.

use crate::config::AnalysisConfig;
use crate::core::filters::{gaussian_blur, nanmean_rows};
use crate::io::refractive_index::RefractiveIndexTable;
use crate::types::{Plane, SnowResult};
use ndarray::{s, Array1};

/// Density of ice (kg/m³)
pub const RHO_ICE: f64 = 916.7;
/// Asymmetry parameter of a sphere
const ASYMMETRY: f64 = 0.895;
/// Absorption enhancement parameter of a sphere
const ABSORPTION_ENHANCEMENT: f64 = 1.25;
/// Upper bound of a physical SSA (m²/kg)
pub const SSA_MAX: f64 = 150.0;

/// Blank out a border of `frame_x_mm` left and right and `frame_y_mm` top
/// and bottom. A border narrower than one pixel leaves that side alone.
pub fn frame_plane(plane: &Plane, px_2_mm: f64, frame_x_mm: f64, frame_y_mm: f64) -> Plane {
    let (rows, cols) = plane.dim();
    let fx = ((frame_x_mm / px_2_mm).trunc().max(0.0) as usize).min(cols);
    let fy = ((frame_y_mm / px_2_mm).trunc().max(0.0) as usize).min(rows);

    let mut out = plane.clone();
    if fx > 0 {
        out.slice_mut(s![.., ..fx]).fill(f32::NAN);
        out.slice_mut(s![.., cols - fx..]).fill(f32::NAN);
    }
    if fy > 0 {
        out.slice_mut(s![..fy, ..]).fill(f32::NAN);
        out.slice_mut(s![rows - fy.., ..]).fill(f32::NAN);
    }
    out
}

/// Reflectance-to-SSA conversion at one wavelength
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsaModel {
    /// Ice absorption coefficient (1/m)
    pub gamma: f64,
    pub x: f64,
}

impl SsaModel {
    pub fn new(wavelength_nm: f64, imaginary_index: f64, viewing_angle_deg: f64) -> Self {
        let lambda = wavelength_nm * 1e-9;
        let mu0 = viewing_angle_deg.to_radians().cos();
        Self {
            gamma: 4.0 * std::f64::consts::PI * imaginary_index / lambda,
            x: 3.0 / 7.0 * (1.0 + 2.0 * mu0),
        }
    }

    pub fn from_table(
        wavelength_nm: f64,
        table: &RefractiveIndexTable,
        viewing_angle_deg: f64,
    ) -> SnowResult<Self> {
        let xi = table.imaginary_index(wavelength_nm)?;
        let model = Self::new(wavelength_nm, xi, viewing_angle_deg);
        log::debug!(
            "SSA model at {} nm: k = {:e}, gamma = {:.4} 1/m",
            wavelength_nm,
            xi,
            model.gamma
        );
        Ok(model)
    }

    /// Unclipped SSA (m²/kg) for reflectance `r`
    pub fn raw(&self, r: f64) -> f64 {
        let g_g = 2.0 * ASYMMETRY - 1.0;
        let l = r.ln() / (8.0 * self.x);
        ABSORPTION_ENHANCEMENT * self.gamma / (3.0 * RHO_ICE * l * l * (1.0 - g_g))
    }

    /// SSA with non-physical values (negative or above 150) set to 0
    pub fn ssa(&self, r: f64) -> f64 {
        let v = self.raw(r);
        if v > SSA_MAX || v < 0.0 {
            0.0
        } else {
            v
        }
    }

    /// `(R, SSA(R))` at `n` reflectances evenly spaced over `[0, 1]`
    pub fn calibration_curve(&self, n: usize) -> Vec<(f64, f64)> {
        Array1::linspace(0.0, 1.0, n)
            .iter()
            .map(|&r| (r, self.raw(r)))
            .collect()
    }
}

/// Output of the SSA derivation
#[derive(Debug, Clone)]
pub struct SsaResult {
    /// Smoothed SSA map (m²/kg), NaN in the frame
    pub ssa: Plane,
    /// Framed input reflectance
    pub reflectance: Plane,
    /// Row means of `ssa`, top row first
    pub profile: Array1<f32>,
    pub calibration: Vec<(f64, f64)>,
}

pub fn compute_ssa(
    reflectance: &Plane,
    px_2_mm: f64,
    model: &SsaModel,
    config: &AnalysisConfig,
) -> SnowResult<SsaResult> {
    let framed = frame_plane(reflectance, px_2_mm, config.frame_x_mm, config.frame_y_mm);
    let ssa = framed.mapv(|r| model.ssa(r as f64) as f32);
    let ssa = gaussian_blur(&ssa, 7, 3, 0.0, 0.0)?;
    let profile = nanmean_rows(&ssa);
    Ok(SsaResult {
        ssa,
        reflectance: framed,
        profile,
        calibration: model.calibration_curve(100),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_frame_plane() {
        let plane = Array2::from_elem((10, 12), 1.0f32);
        let framed = frame_plane(&plane, 1.0, 2.0, 3.0);
        assert!(framed[[5, 1]].is_nan());
        assert!(framed[[5, 10]].is_nan());
        assert!(framed[[2, 5]].is_nan());
        assert!(framed[[7, 5]].is_nan());
        assert_eq!(framed[[3, 2]], 1.0);
        assert_eq!(framed[[6, 9]], 1.0);

        let untouched = frame_plane(&plane, 100.0, 50.0, 30.0);
        assert_eq!(untouched, plane);
    }

    #[test]
    fn test_ssa_formula() {
        let model = SsaModel::new(940.0, 1.45e-6, 45.0);
        let x = 3.0 / 7.0 * (1.0 + 2.0 * std::f64::consts::FRAC_1_SQRT_2);
        assert_relative_eq!(model.x, x, epsilon = 1e-12);
        let gamma = 4.0 * std::f64::consts::PI * 1.45e-6 / 940e-9;
        let l = 0.8f64.ln() / (8.0 * x);
        let expected = 1.25 * gamma / (3.0 * 916.7 * l * l * (1.0 - 0.79));
        assert_relative_eq!(model.ssa(0.8), expected, max_relative = 1e-10);
        assert!(model.ssa(0.8) > 0.0 && model.ssa(0.8) < 150.0);
    }

    #[test]
    fn test_non_physical_values_clipped() {
        let model = SsaModel::new(940.0, 1.45e-6, 45.0);
        // R close to 1 blows up
        assert_eq!(model.ssa(0.9999), 0.0);
        assert_eq!(model.ssa(0.0), 0.0);
    }

    #[test]
    fn test_profile_ignores_frame() {
        let model = SsaModel::new(940.0, 1.45e-6, 45.0);
        let reflectance = Array2::from_elem((20, 30), 0.7f32);
        let config = AnalysisConfig {
            frame_x_mm: 5.0,
            frame_y_mm: 4.0,
            ..Default::default()
        };
        let result = compute_ssa(&reflectance, 1.0, &model, &config).unwrap();
        assert_eq!(result.profile.len(), 20);
        assert!(result.profile[0].is_nan());
        assert_relative_eq!(result.profile[10] as f64, model.ssa(0.7), max_relative = 1e-4);
        assert_eq!(result.calibration.len(), 100);
    }
}
