//! Separable filters, pyramids and resampling on float planes.
//!
//! Borders are handled by reflecting about the edge pixel
//! (`gfedcb|abcdefgh|gfedcba`). NaN values are not masked; they spread
//! through every filter tap that touches them.

use crate::types::{Plane, SnowError, SnowResult};
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Dimension, RemoveAxis, Zip};
use num_traits::Float;

/// Binomial taps used by the pyramid down/up steps
const PYRAMID_TAPS: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

/// Index into a lane of length `n`, reflected about the edge pixels
pub fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// 1-D Gaussian taps, normalised to sum 1.
///
/// A non-positive sigma is derived from the kernel size; for the small
/// sizes 1, 3, 5 and 7 the fixed binomial-like taps are used instead.
pub fn gaussian_kernel(ksize: usize, sigma: f64) -> SnowResult<Vec<f32>> {
    if ksize == 0 || ksize % 2 == 0 {
        return Err(SnowError::Processing(format!(
            "Gaussian kernel size must be odd and positive, got {}",
            ksize
        )));
    }
    if sigma <= 0.0 {
        match ksize {
            1 => return Ok(vec![1.0]),
            3 => return Ok(vec![0.25, 0.5, 0.25]),
            5 => return Ok(vec![0.0625, 0.25, 0.375, 0.25, 0.0625]),
            7 => {
                return Ok(vec![
                    0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125,
                ])
            }
            _ => {}
        }
    }
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let center = (ksize as f64 - 1.0) * 0.5;
    let taps: Vec<f64> = (0..ksize)
        .map(|i| {
            let x = i as f64 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    Ok(taps.iter().map(|t| (t / sum) as f32).collect())
}

fn convolve_lane(src: ArrayView1<f32>, kernel: &[f32], mut dst: ArrayViewMut1<f32>) {
    let n = src.len();
    let half = (kernel.len() / 2) as isize;
    for i in 0..n {
        let mut acc = 0.0f32;
        for (k, w) in kernel.iter().enumerate() {
            let j = reflect101(i as isize + k as isize - half, n);
            acc += src[j] * w;
        }
        dst[i] = acc;
    }
}

/// Convolve every lane along `axis` with `kernel`
fn convolve_axis(input: ArrayView2<f32>, kernel: &[f32], axis: Axis) -> Plane {
    let mut out = Array2::zeros(input.raw_dim());
    if input.len_of(axis) == 0 {
        return out;
    }

    #[cfg(feature = "parallel")]
    {
        Zip::from(out.lanes_mut(axis))
            .and(input.lanes(axis))
            .par_for_each(|dst, src| convolve_lane(src, kernel, dst));
    }

    #[cfg(not(feature = "parallel"))]
    {
        Zip::from(out.lanes_mut(axis))
            .and(input.lanes(axis))
            .for_each(|dst, src| convolve_lane(src, kernel, dst));
    }

    out
}

/// Separable Gaussian blur.
///
/// `ksize_x`/`sigma_x` act along columns (within a row), `ksize_y`/`sigma_y`
/// along rows. A non-positive `sigma_y` takes the value of `sigma_x`.
pub fn gaussian_blur(
    plane: &Plane,
    ksize_x: usize,
    ksize_y: usize,
    sigma_x: f64,
    sigma_y: f64,
) -> SnowResult<Plane> {
    let sigma_y = if sigma_y > 0.0 { sigma_y } else { sigma_x };
    let kx = gaussian_kernel(ksize_x, sigma_x)?;
    let ky = gaussian_kernel(ksize_y, sigma_y)?;
    let horizontal = convolve_axis(plane.view(), &kx, Axis(1));
    Ok(convolve_axis(horizontal.view(), &ky, Axis(0)))
}

/// Blur with the 5x5 binomial kernel and drop every other row and column
pub fn pyr_down(plane: &Plane) -> Plane {
    let (rows, cols) = plane.dim();
    let taps: Vec<f32> = PYRAMID_TAPS.iter().map(|t| t / 16.0).collect();
    let horizontal = convolve_axis(plane.view(), &taps, Axis(1));
    let blurred = convolve_axis(horizontal.view(), &taps, Axis(0));

    let out_rows = (rows + 1) / 2;
    let out_cols = (cols + 1) / 2;
    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| blurred[[2 * r, 2 * c]])
}

/// Upsample to `(rows, cols)` by zero insertion and interpolate with the
/// binomial kernel scaled by 4
pub fn pyr_up(plane: &Plane, (rows, cols): (usize, usize)) -> Plane {
    let mut upsampled = Array2::<f32>::zeros((rows, cols));
    for ((r, c), v) in plane.indexed_iter() {
        if 2 * r < rows && 2 * c < cols {
            upsampled[[2 * r, 2 * c]] = *v;
        }
    }
    let taps: Vec<f32> = PYRAMID_TAPS.iter().map(|t| t / 8.0).collect();
    let horizontal = convolve_axis(upsampled.view(), &taps, Axis(1));
    convolve_axis(horizontal.view(), &taps, Axis(0))
}

/// Bilinear resize with pixel-center alignment
pub fn resize_bilinear(plane: &Plane, (rows, cols): (usize, usize)) -> Plane {
    let (src_rows, src_cols) = plane.dim();
    if src_rows == 0 || src_cols == 0 {
        return Array2::zeros((rows, cols));
    }

    let sample_axis = |dst: usize, dst_len: usize, src_len: usize| -> (usize, usize, f32) {
        let scale = src_len as f64 / dst_len as f64;
        let pos = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (pos.floor() as usize).min(src_len - 1);
        let i1 = (i0 + 1).min(src_len - 1);
        (i0, i1, (pos - i0 as f64).min(1.0) as f32)
    };

    let row_samples: Vec<_> = (0..rows).map(|r| sample_axis(r, rows, src_rows)).collect();
    let col_samples: Vec<_> = (0..cols).map(|c| sample_axis(c, cols, src_cols)).collect();

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let (r0, r1, fr) = row_samples[r];
        let (c0, c1, fc) = col_samples[c];
        let top = plane[[r0, c0]] * (1.0 - fc) + plane[[r0, c1]] * fc;
        let bottom = plane[[r1, c0]] * (1.0 - fc) + plane[[r1, c1]] * fc;
        top * (1.0 - fr) + bottom * fr
    })
}

/// Mean of the non-NaN values; NaN when there are none
pub fn nanmean<F: Float>(values: impl IntoIterator<Item = F>) -> F {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((F::zero(), 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        F::nan()
    } else {
        sum / F::from(count).unwrap_or_else(F::one)
    }
}

/// Row-wise mean ignoring NaN: one value per row
pub fn nanmean_rows(plane: &Plane) -> Array1<f32> {
    plane
        .outer_iter()
        .map(|row| nanmean(row.iter().copied()))
        .collect()
}

/// Circular shift along `axis`; elements pushed past the end wrap around
pub fn roll<D>(array: &Array<f32, D>, shift: isize, axis: Axis) -> Array<f32, D>
where
    D: Dimension + RemoveAxis,
{
    let n = array.len_of(axis);
    let mut out = array.clone();
    if n == 0 {
        return out;
    }
    let shift = shift.rem_euclid(n as isize) as usize;
    if shift == 0 {
        return out;
    }
    for (i, lane) in array.axis_iter(axis).enumerate() {
        out.index_axis_mut(axis, (i + shift) % n).assign(&lane);
    }
    out
}

/// Replace NaN by 0 and infinities by the largest finite values
pub fn nan_to_num(plane: &Plane) -> Plane {
    plane.mapv(|v| {
        if v.is_nan() {
            0.0
        } else if v == f32::INFINITY {
            f32::MAX
        } else if v == f32::NEG_INFINITY {
            f32::MIN
        } else {
            v
        }
    })
}
