use crate::config::SerialPolicy;
use crate::core::filters::{resize_bilinear, roll};
use crate::core::image::Image;
use crate::io::calibration_file::{CalibrationLibrary, DistortionProfile, MountPosition};
use crate::types::{ImageData, Plane, SnowError, SnowResult};
use ndarray::{s, Array2, Array3, Axis};

/// Bilinear sample at fractional `(row, col)`, coordinates clamped to the plane
fn sample_bilinear(plane: &Plane, row: f64, col: f64) -> f32 {
    let (rows, cols) = plane.dim();
    let row = row.clamp(0.0, (rows - 1) as f64);
    let col = col.clamp(0.0, (cols - 1) as f64);
    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(rows - 1);
    let c1 = (c0 + 1).min(cols - 1);
    let fr = (row - r0 as f64) as f32;
    let fc = (col - c0 as f64) as f32;
    let top = plane[[r0, c0]] * (1.0 - fc) + plane[[r0, c1]] * fc;
    let bottom = plane[[r1, c0]] * (1.0 - fc) + plane[[r1, c1]] * fc;
    top * (1.0 - fr) + bottom * fr
}

/// Backward radial dewarp.
///
/// Each undistorted pixel at radius `r` from the center samples the
/// distorted plane at `center + (Σ factors[k]·r^k) · offset`.
pub fn unwarp_backward(plane: &Plane, xcenter: f64, ycenter: f64, factors: &[f64]) -> Plane {
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 {
        return plane.clone();
    }
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let xu = c as f64 - xcenter;
        let yu = r as f64 - ycenter;
        let radius = (xu * xu + yu * yu).sqrt();
        let (fact, _) = factors
            .iter()
            .fold((0.0, 1.0), |(sum, power), f| (sum + f * power, power * radius));
        sample_bilinear(plane, ycenter + fact * yu, xcenter + fact * xu)
    })
}

/// Rotate counter-clockwise by `angle_deg` about the plane center, keeping
/// the shape; samples outside the plane take the nearest edge value
pub fn rotate(plane: &Plane, angle_deg: f64) -> Plane {
    let (rows, cols) = plane.dim();
    if angle_deg == 0.0 || rows == 0 || cols == 0 {
        return plane.clone();
    }
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cr = (rows as f64 - 1.0) / 2.0;
    let cc = (cols as f64 - 1.0) / 2.0;
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let dc = c as f64 - cc;
        let dr = r as f64 - cr;
        let src_c = cos * dc - sin * dr + cc;
        let src_r = sin * dc + cos * dr + cr;
        sample_bilinear(plane, src_r, src_c)
    })
}

/// Resize by `(fx, fy)`, then crop or zero-pad at the bottom/right back to
/// the original shape
pub fn stretch(plane: &Plane, fx: f64, fy: f64) -> Plane {
    let (rows, cols) = plane.dim();
    let new_rows = ((rows as f64 * fy).round() as usize).max(1);
    let new_cols = ((cols as f64 * fx).round() as usize).max(1);
    let resized = resize_bilinear(plane, (new_rows, new_cols));

    let mut out = Array2::zeros((rows, cols));
    let keep_r = rows.min(new_rows);
    let keep_c = cols.min(new_cols);
    out.slice_mut(s![..keep_r, ..keep_c])
        .assign(&resized.slice(s![..keep_r, ..keep_c]));
    out
}

/// Dewarp, rotate and stretch one plane
fn correct_plane(plane: &Plane, profile: &DistortionProfile) -> Plane {
    let mut out = unwarp_backward(plane, profile.xcenter, profile.ycenter, &profile.factors);
    out = rotate(&out, profile.rotation);
    if !profile.stretch.is_identity() {
        let (fx, fy) = profile.stretch.factors();
        out = stretch(&out, fx, fy);
    }
    out
}

/// Full correction of a multi-channel image: per-channel dewarp, rotation
/// and stretch, then the column shift
pub fn apply_profile(data: &ImageData, profile: &DistortionProfile) -> SnowResult<ImageData> {
    let (rows, cols, channels) = data.dim();
    let planes: Vec<Plane> = data.axis_iter(Axis(2)).map(|p| p.to_owned()).collect();

    #[cfg(feature = "parallel")]
    let corrected: Vec<Plane> = {
        use rayon::prelude::*;
        planes.par_iter().map(|p| correct_plane(p, profile)).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let corrected: Vec<Plane> = planes.iter().map(|p| correct_plane(p, profile)).collect();

    let mut out = Array3::zeros((rows, cols, channels));
    for (ch, plane) in corrected.iter().enumerate() {
        out.index_axis_mut(Axis(2), ch).assign(plane);
    }

    if profile.shift != 0 {
        out = roll(&out, profile.shift as isize, Axis(1));
    }
    Ok(out)
}

/// Lens-distortion correction keyed by each frame's camera serial
pub struct Undistorter<'a> {
    library: &'a CalibrationLibrary,
    policy: SerialPolicy,
}

impl<'a> Undistorter<'a> {
    pub fn new(library: &'a CalibrationLibrary, policy: SerialPolicy) -> Self {
        Self { library, policy }
    }

    pub fn undistort(&self, image: &Image) -> SnowResult<Image> {
        let device = image.capture.serial_number();
        log::info!(
            "Undistorting image {} with camera serial number {}",
            image.id(),
            device
        );

        let calibration = self.library.lookup(&device)?;
        if !calibration.matches(&device) {
            match self.policy {
                SerialPolicy::Lenient => {
                    log::warn!(
                        "Serial number {} of image {} does not match calibration {}; image left unchanged",
                        device,
                        image.id(),
                        calibration.serial
                    );
                    return Ok(image.clone());
                }
                SerialPolicy::Strict => {
                    return Err(SnowError::SerialMismatch {
                        image: device.to_string(),
                        calibration: calibration.serial.clone(),
                    })
                }
            }
        }

        let position = MountPosition::from_path(&image.meta.filepath);
        let profile = calibration.profile(position)?;
        log::debug!(
            "Image {}: {} profile, rotation {}°, shift {}, stretch {:?}",
            image.id(),
            position.as_str(),
            profile.rotation,
            profile.shift,
            profile.stretch
        );

        Ok(Image {
            meta: image.meta.clone(),
            data: apply_profile(&image.data, profile)?,
            capture: image.capture.clone(),
        })
    }
}
