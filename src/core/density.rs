//! Ice-volume fraction from reflectance behind the slit grid.
//!
//! Light entering the snow through a slit of radius `r` is re-emitted next
//! to it; the reflectance model `phi` inverts that relation for the ice
//! volume fraction given the local optical diameter `d_opt = 6 / SSA`.

use crate::config::AnalysisConfig;
use crate::core::filters::{gaussian_blur, nan_to_num, nanmean_rows};
use crate::core::lambert_w::lambert_w0;
use crate::core::ssa::frame_plane;
use crate::types::{Plane, SnowError, SnowResult};
use ndarray::{Array1, Axis, Zip};

/// Absorption of ice (1/mm)
const KAPPA_ICE: f64 = 0.0027;
const ASYMMETRY: f64 = 0.85;
const MODEL_A: f64 = 1.26;
const MODEL_B: f64 = 0.79;

fn model_c(d_opt: f64) -> f64 {
    KAPPA_ICE + 0.84 / MODEL_A * (1.0 - ASYMMETRY) * (KAPPA_ICE / d_opt).sqrt()
}

/// Offset that makes the truncated reflectance integral vanish at r = 0
fn model_offset(d_opt: f64) -> f64 {
    let c = model_c(d_opt);
    (KAPPA_ICE / c - 1.0) * (-MODEL_A * (3.0 * KAPPA_ICE * MODEL_B * MODEL_B / c).sqrt()).exp()
}

/// Ice-volume fraction for slit reflectance `r`, optical diameter `d_opt`
/// (m) and slit radius `radius` (mm). Non-physical solutions give NaN.
pub fn phi(r: f64, d_opt: f64, radius: f64) -> f64 {
    let c = model_c(d_opt);
    let a = MODEL_A * (3.0 * KAPPA_ICE * c).sqrt();
    let z = (r + model_offset(d_opt)) / (KAPPA_ICE / c - 1.0) * c / MODEL_B;
    let x = lambert_w0(a / z) / a;
    let radicand = x * x - (MODEL_B * MODEL_B) / (c * c);
    if radicand.is_nan() || radicand < 0.0 {
        return f64::NAN;
    }
    radicand.sqrt() / radius
}

/// A bright vertical band of the grid image, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slit {
    pub center: f64,
    pub width: f64,
}

impl Slit {
    /// Column mask: 1 within half a width of the center
    pub fn mask(&self, cols: usize) -> Array1<f32> {
        Array1::from_shape_fn(cols, |c| {
            if (c as f64 - self.center).abs() <= self.width / 2.0 {
                1.0
            } else {
                0.0
            }
        })
    }
}

/// Column means of the plane, NaN counted as 0
pub fn column_trace(plane: &Plane) -> Array1<f32> {
    nan_to_num(plane)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(plane.ncols()))
}

/// Locate up to `max_slits` slits where the column trace crosses half its
/// maximum. Crossings pair up as rising and falling edges.
pub fn find_slits(plane: &Plane, max_slits: usize) -> Vec<Slit> {
    let trace = column_trace(plane);
    let cut = trace.iter().copied().fold(f32::NEG_INFINITY, f32::max) / 2.0;

    let crossings: Vec<usize> = trace
        .windows(2)
        .into_iter()
        .enumerate()
        .filter(|(_, w)| (w[0] > cut && w[1] < cut) || (w[0] < cut && w[1] > cut))
        .map(|(i, _)| i)
        .collect();

    let slits: Vec<Slit> = crossings
        .chunks_exact(2)
        .take(max_slits)
        .map(|pair| {
            let (lo, hi) = (pair[0] as f64, pair[1] as f64);
            Slit {
                center: (lo + hi + 2.0) / 2.0,
                width: hi - lo + 1.0,
            }
        })
        .collect();
    if slits.len() < max_slits {
        log::warn!("Found {} of {} slits in the grid image", slits.len(), max_slits);
    }
    slits
}

/// Keep the masked columns; everything else, and exact zeros, become NaN
pub fn mask_plane(plane: &Plane, mask: &Array1<f32>) -> Plane {
    let mut out = plane * &mask.view().insert_axis(Axis(0));
    out.mapv_inplace(|v| if v == 0.0 { f32::NAN } else { v });
    out
}

/// Output of the density derivation
#[derive(Debug, Clone)]
pub struct DensityResult {
    pub slits: Vec<Slit>,
    /// One ice-volume fraction profile per slit, top row first
    pub profiles: Vec<Array1<f64>>,
    /// Framed no-grid reflectance masked to each slit
    pub reflectance_masked: Vec<Plane>,
    /// Framed, smoothed grid reflectance masked to each slit
    pub grid_masked: Vec<Plane>,
}

/// Density profiles from no-grid reflectance, grid reflectance and the SSA
/// map, all on the same pixel grid
pub fn compute_density(
    reflectance: &Plane,
    grid: &Plane,
    ssa: &Plane,
    px_2_mm: f64,
    config: &AnalysisConfig,
) -> SnowResult<DensityResult> {
    if reflectance.dim() != grid.dim() || reflectance.dim() != ssa.dim() {
        return Err(SnowError::Analysis(format!(
            "Reflectance {:?}, grid {:?} and SSA {:?} images differ in shape",
            reflectance.dim(),
            grid.dim(),
            ssa.dim()
        )));
    }

    let framed = frame_plane(reflectance, px_2_mm, config.frame_x_mm, config.frame_y_mm);
    let grid_framed = frame_plane(grid, px_2_mm, config.frame_x_mm, config.frame_y_mm);
    let grid_framed = gaussian_blur(&grid_framed, 7, 3, 0.0, 0.0)?;

    let slits = find_slits(&grid_framed, config.slit_radii_mm.len());
    let cols = grid_framed.ncols();

    let mut profiles = Vec::with_capacity(slits.len());
    let mut reflectance_masked = Vec::with_capacity(slits.len());
    let mut grid_masked = Vec::with_capacity(slits.len());
    for (slit, radius) in slits.iter().zip(&config.slit_radii_mm) {
        let mask = slit.mask(cols);
        let ssa_profile = nanmean_rows(&mask_plane(ssa, &mask));
        let grid_slit = mask_plane(&grid_framed, &mask);
        let grid_profile = nanmean_rows(&grid_slit);

        let mut profile = Array1::zeros(ssa_profile.len());
        Zip::from(&mut profile)
            .and(&grid_profile)
            .and(&ssa_profile)
            .for_each(|out, &r, &s| {
                let d_opt = 6.0 / s as f64 / 1000.0;
                *out = phi(r as f64, d_opt, 0.5 * radius) - config.density_offset;
            });
        log::debug!(
            "Slit at column {:.1} (width {:.1}) with radius {} mm",
            slit.center,
            slit.width,
            radius
        );

        profiles.push(profile);
        reflectance_masked.push(mask_plane(&framed, &mask));
        grid_masked.push(grid_slit);
    }

    Ok(DensityResult {
        slits,
        profiles,
        reflectance_masked,
        grid_masked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_phi_matches_closed_form() {
        let (r, d_opt, radius) = (0.2, 2e-4, 12.5);
        let c = model_c(d_opt);
        let a = 1.26 * (3.0 * 0.0027 * c).sqrt();
        let z = (r + model_offset(d_opt)) / (0.0027 / c - 1.0) * c / 0.79;
        let x = lambert_w0(a / z) / a;
        let expected = (x * x - 0.79 * 0.79 / (c * c)).sqrt() / radius;
        let value = phi(r, d_opt, radius);
        assert!(value.is_finite());
        assert_relative_eq!(value, expected, max_relative = 1e-12);
        // the model inverts w·exp(w) exactly
        assert_relative_eq!(x * a * (x * a).exp(), a / z, max_relative = 1e-10);
    }

    #[test]
    fn test_phi_non_physical_is_nan() {
        assert!(phi(f64::NAN, 2e-4, 12.5).is_nan());
        assert!(phi(0.2, f64::NAN, 12.5).is_nan());
    }

    #[test]
    fn test_find_slits() {
        // bright columns 2..=3 and 7..=9
        let row = array![0.0f32, 0.1, 1.0, 1.0, 0.1, 0.0, 0.1, 1.0, 1.0, 1.0, 0.1, 0.0];
        let plane = Array2::from_shape_fn((4, row.len()), |(_, c)| row[c]);
        let slits = find_slits(&plane, 4);
        assert_eq!(slits.len(), 2);
        assert_eq!(slits[0], Slit { center: 3.0, width: 3.0 });
        assert_eq!(slits[1], Slit { center: 8.5, width: 4.0 });

        let mask = slits[0].mask(row.len());
        assert_eq!(mask.to_vec(), vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(find_slits(&plane, 1).len(), 1);
    }

    #[test]
    fn test_mask_plane_blanks_outside_and_zero() {
        let plane = array![[1.0f32, 0.0, 3.0], [4.0, 5.0, 6.0]];
        let masked = mask_plane(&plane, &array![1.0f32, 1.0, 0.0]);
        assert_eq!(masked[[0, 0]], 1.0);
        assert!(masked[[0, 1]].is_nan());
        assert!(masked[[1, 2]].is_nan());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array2::zeros((4, 4));
        let b = Array2::zeros((4, 5));
        assert!(compute_density(&a, &b, &a, 1.0, &AnalysisConfig::default()).is_err());
    }
}
