//! Placement and multiresolution blending of same-type frames.
//!
//! Frames are positioned from their physical reference coordinates, never
//! by image content. The canvas grows from its bottom-left corner: each
//! frame is padded on the left and bottom by its offset from the set
//! minimum, then canvas and frame are padded on the right and top to a
//! common shape. From the second frame on, the overlap is merged with a
//! Laplacian pyramid guided by a smoothed overlap mask.

use crate::config::ProcessingConfig;
use crate::core::filters::{gaussian_blur, pyr_down, pyr_up, resize_bilinear, roll};
use crate::core::image::{FrameRecord, Image, StitchedImage, StitchedMetadata};
use crate::types::{ImageType, Plane, SnowError, SnowResult};
use ndarray::{s, Array2, Axis, Zip};

/// Blending parameters
#[derive(Debug, Clone)]
pub struct StitchParams {
    /// Overlap-mask blur sigma along columns (pixels)
    pub sigma_x: f64,
    /// Overlap-mask blur sigma along rows (pixels)
    pub sigma_y: f64,
    /// Subsampling applied before the mask blur
    pub mask_downscale: usize,
    pub pyramid_levels: usize,
    /// Overlay the seam of every blend onto the composite
    pub debug_seams: bool,
}

impl Default for StitchParams {
    fn default() -> Self {
        Self {
            sigma_x: 200.0,
            sigma_y: 200.0,
            mask_downscale: 20,
            pyramid_levels: 6,
            debug_seams: false,
        }
    }
}

impl From<&ProcessingConfig> for StitchParams {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            sigma_x: config.overlap_sigma_x,
            sigma_y: config.overlap_sigma_y,
            mask_downscale: config.mask_downscale,
            pyramid_levels: config.pyramid_levels,
            debug_seams: config.debug_seams,
        }
    }
}

/// Half-open pixel window `[row0, row1) x [col0, col1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

impl CropBox {
    pub fn shape(&self) -> (usize, usize) {
        (self.row1 - self.row0, self.col1 - self.col0)
    }
}

/// Physical position (mm) of a frame's corner.
///
/// The reference pixel is `coords_pix` as a fraction of the frame size,
/// truncated to whole pixels.
pub fn frame_origin_mm(image: &Image) -> [f64; 2] {
    let meta = &image.meta;
    let pix = [
        (meta.coords_pix[0] * image.width() as f64).trunc(),
        (meta.coords_pix[1] * image.height() as f64).trunc(),
    ];
    [
        meta.coords_mm[0] + pix[0] * meta.px_2_mm,
        meta.coords_mm[1] + pix[1] * meta.px_2_mm,
    ]
}

/// Origins relative to the set minimum, plus that minimum.
///
/// The smallest relative origin on each axis is exactly 0.
pub fn relative_positions(images: &[&Image]) -> ([f64; 2], Vec<[f64; 2]>) {
    let origins: Vec<[f64; 2]> = images.iter().map(|img| frame_origin_mm(img)).collect();
    let min = origins.iter().fold([f64::INFINITY, f64::INFINITY], |acc, o| {
        [acc[0].min(o[0]), acc[1].min(o[1])]
    });
    let relative = origins
        .iter()
        .map(|o| [o[0] - min[0], o[1] - min[1]])
        .collect();
    (min, relative)
}

/// Whole-pixel offset of a relative position
pub fn offset_pixels(position_mm: [f64; 2], px_2_mm: f64) -> (usize, usize) {
    let to_px = |mm: f64| (mm / px_2_mm).trunc().max(0.0) as usize;
    (to_px(position_mm[0]), to_px(position_mm[1]))
}

/// Zero-pad a plane on each side
pub fn pad(plane: &Plane, top: usize, bottom: usize, left: usize, right: usize) -> Plane {
    let (rows, cols) = plane.dim();
    if top + bottom + left + right == 0 {
        return plane.clone();
    }
    let mut out = Array2::zeros((rows + top + bottom, cols + left + right));
    out.slice_mut(s![top..top + rows, left..left + cols])
        .assign(plane);
    out
}

/// Align the canvas and an incoming frame offset by `(dx, dy)` pixels from
/// the bottom-left corner. Both returned planes have the same shape.
pub fn register(canvas: &Plane, incoming: &Plane, dx: usize, dy: usize) -> (Plane, Plane) {
    let mut incoming = pad(incoming, 0, dy, dx, 0);
    let mut canvas = canvas.clone();

    let (c_rows, c_cols) = canvas.dim();
    let (i_rows, i_cols) = incoming.dim();
    if c_cols < i_cols {
        canvas = pad(&canvas, 0, 0, 0, i_cols - c_cols);
    } else if c_cols > i_cols {
        incoming = pad(&incoming, 0, 0, 0, c_cols - i_cols);
    }
    if c_rows < i_rows {
        canvas = pad(&canvas, i_rows - c_rows, 0, 0, 0);
    } else if c_rows > i_rows {
        incoming = pad(&incoming, c_rows - i_rows, 0, 0, 0);
    }

    log::debug!(
        "Registered frame at dx={} dy={}, canvas now {:?}",
        dx,
        dy,
        canvas.dim()
    );
    (canvas, incoming)
}

/// Inclusive bounds `(rmin, rmax, cmin, cmax)` of the nonzero pixels
fn bounding_box(plane: &Plane) -> Option<(usize, usize, usize, usize)> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for ((r, c), v) in plane.indexed_iter() {
        if *v != 0.0 {
            bounds = Some(match bounds {
                None => (r, r, c, c),
                Some((r0, r1, c0, c1)) => (r0.min(r), r1.max(r), c0.min(c), c1.max(c)),
            });
        }
    }
    bounds
}

/// Footprint of the incoming frame widened by about 10 %
pub fn blend_window(incoming: &Plane) -> Option<CropBox> {
    let (rows, cols) = incoming.dim();
    let (rmin, rmax, cmin, cmax) = bounding_box(incoming)?;
    let widen = |max: usize, size: usize| {
        let grown = max as f64 * 1.1;
        if grown < size as f64 {
            grown as usize
        } else {
            size
        }
    };
    Some(CropBox {
        row0: (rmin as f64 * 0.9) as usize,
        row1: widen(rmax, rows),
        col0: (cmin as f64 * 0.9) as usize,
        col1: widen(cmax, cols),
    })
}

/// Weight of the incoming frame inside `window`.
///
/// The canvas footprint counts +1 and the incoming footprint -1; their sum
/// is blurred at reduced resolution and the incoming frame takes every
/// pixel where the blurred sum is not positive. The result is 1 wherever
/// only the incoming frame has data, 0 wherever it has none, and the
/// bounding box of the weighted region is filled solid.
pub fn overlap_mask(
    canvas: &Plane,
    incoming: &Plane,
    window: CropBox,
    params: &StitchParams,
) -> SnowResult<Plane> {
    let a = canvas.slice(s![window.row0..window.row1, window.col0..window.col1]);
    let b = incoming.slice(s![window.row0..window.row1, window.col0..window.col1]);
    let shape = window.shape();

    let footprint = Zip::from(&a).and(&b).map_collect(|&va, &vb| {
        let in_a = if va != 0.0 { 1.0f32 } else { 0.0 };
        let in_b = if vb != 0.0 { -1.0f32 } else { 0.0 };
        in_a + in_b
    });

    let step = params.mask_downscale.max(1);
    let coarse = footprint.slice(s![..;step, ..;step]).to_owned();
    let sigma_x = params.sigma_x / step as f64;
    let sigma_y = params.sigma_y / step as f64;
    let ksize_x = 4 * sigma_x.trunc() as usize + 1;
    let ksize_y = 4 * sigma_y.trunc() as usize + 1;
    let blurred = gaussian_blur(&coarse, ksize_x, ksize_y, sigma_x, sigma_y)?;
    let smooth = resize_bilinear(&blurred, shape);

    let mut mask = Zip::from(&smooth).and(&a).and(&b).map_collect(|&m, &va, &vb| {
        let rounded = (m * 1e5).round() / 1e5;
        if vb == 0.0 {
            0.0f32
        } else if va == 0.0 || rounded <= 0.0 {
            1.0
        } else {
            0.0
        }
    });

    if let Some((r0, r1, c0, c1)) = bounding_box(&mask) {
        mask.slice_mut(s![r0..=r1, c0..=c1]).fill(1.0);
        Zip::from(&mut mask).and(&b).for_each(|m, &vb| {
            if vb == 0.0 {
                *m = 0.0;
            }
        });
    }
    Ok(mask)
}

fn gaussian_pyramid(plane: &Plane, levels: usize) -> Vec<Plane> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(plane.clone());
    for i in 1..levels {
        let next = pyr_down(&pyramid[i - 1]);
        pyramid.push(next);
    }
    pyramid
}

/// Coarsest level first, then band-pass levels up to full resolution
fn laplacian_pyramid(gaussian: &[Plane]) -> Vec<Plane> {
    let levels = gaussian.len();
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(gaussian[levels - 1].clone());
    for i in (1..levels).rev() {
        let expanded = pyr_up(&gaussian[i], gaussian[i - 1].dim());
        pyramid.push(&gaussian[i - 1] - &expanded);
    }
    pyramid
}

/// Blend `incoming` into `canvas` inside `window` with weights `mask`
pub fn pyramid_blend(
    canvas: &mut Plane,
    incoming: &Plane,
    mask: &Plane,
    window: CropBox,
    levels: usize,
) {
    let levels = levels.max(1);
    let crop = s![window.row0..window.row1, window.col0..window.col1];
    let a = canvas.slice(crop).to_owned();
    let b = incoming.slice(crop).to_owned();

    let lap_a = laplacian_pyramid(&gaussian_pyramid(&a, levels));
    let lap_b = laplacian_pyramid(&gaussian_pyramid(&b, levels));
    let mut weights = gaussian_pyramid(mask, levels);
    weights.reverse();

    let blended: Vec<Plane> = lap_a
        .iter()
        .zip(&lap_b)
        .zip(&weights)
        .map(|((la, lb), m)| {
            Zip::from(la)
                .and(lb)
                .and(m)
                .map_collect(|&va, &vb, &w| va * (1.0 - w) + vb * w)
        })
        .collect();

    let mut result = blended[0].clone();
    for level in &blended[1..] {
        result = pyr_up(&result, level.dim()) + level;
    }
    canvas.slice_mut(crop).assign(&result);
}

/// Outline of a full-canvas mask: pixels whose value exceeds the one five
/// pixels up or left
pub fn seam_overlay(mask: &Plane) -> Plane {
    let down = roll(mask, 5, Axis(0));
    let right = roll(mask, 5, Axis(1));
    Zip::from(mask).and(&down).and(&right).map_collect(|&m, &d, &r| {
        if (m - d) + (m - r) > 0.0 {
            1.0
        } else {
            0.0
        }
    })
}

/// Folds frames of one type into a composite
pub struct Stitcher {
    params: StitchParams,
}

impl Stitcher {
    pub fn new() -> Self {
        Self {
            params: StitchParams::default(),
        }
    }

    pub fn with_params(params: StitchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StitchParams {
        &self.params
    }

    /// Grayscale composite of `images`, in the order given
    pub fn blend(&self, images: &[&Image]) -> SnowResult<Plane> {
        match images {
            [] => Err(SnowError::Processing("No images to blend".to_string())),
            [single] => single.to_gray(),
            _ => self.blend_many(images),
        }
    }

    fn blend_many(&self, images: &[&Image]) -> SnowResult<Plane> {
        let (_, positions) = relative_positions(images);
        let mut canvas: Plane = Array2::zeros((1, 1));

        for (i, (image, position)) in images.iter().zip(&positions).enumerate() {
            let gray = image.to_gray()?;
            let (dx, dy) = offset_pixels(*position, image.meta.px_2_mm);
            log::debug!(
                "Image {} of type {} at {:?} mm -> ({}, {}) px",
                image.id(),
                image.meta.img_type,
                position,
                dx,
                dy
            );

            let (registered_canvas, incoming) = register(&canvas, &gray, dx, dy);
            if i == 0 {
                canvas = incoming;
                continue;
            }
            canvas = registered_canvas;

            let window = match blend_window(&incoming) {
                Some(w) => w,
                None => {
                    log::warn!("Image {} is empty after registration; skipped", image.id());
                    continue;
                }
            };
            let mask = overlap_mask(&canvas, &incoming, window, &self.params)?;
            pyramid_blend(&mut canvas, &incoming, &mask, window, self.params.pyramid_levels);

            if self.params.debug_seams {
                let mut full = Array2::zeros(canvas.dim());
                full.slice_mut(s![window.row0..window.row1, window.col0..window.col1])
                    .assign(&mask);
                canvas = canvas + seam_overlay(&full);
            }
        }
        Ok(canvas)
    }

    /// Composite of one image type with its combined metadata
    pub fn stitch_group(&self, img_type: ImageType, images: &[&Image]) -> SnowResult<StitchedImage> {
        log::info!("🔗 Stitching {} {} image(s)", images.len(), img_type);
        let data = self.blend(images)?;
        let (origin_mm, _) = relative_positions(images);
        let frames = images
            .iter()
            .map(|img| FrameRecord {
                meta: img.meta.clone(),
                capture: img.capture.clone(),
            })
            .collect();
        let meta = StitchedMetadata::from_frames(img_type, frames, origin_mm)?;
        log::info!("✅ {} composite is {}x{}", img_type, data.nrows(), data.ncols());
        Ok(StitchedImage { meta, data })
    }
}

impl Default for Stitcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageMetadata;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    fn frame(id: u64, value: f32, coords_mm: [f64; 2], shape: (usize, usize)) -> Image {
        let meta = ImageMetadata {
            id,
            coords_pix: [0.0, 0.0],
            coords_mm,
            px_2_mm: 1.0,
            ..Default::default()
        };
        Image::new(meta, Array3::from_elem((shape.0, shape.1, 3), value))
    }

    #[test]
    fn test_origin_truncates_reference_pixel() {
        let mut image = frame(1, 1.0, [10.0, 5.0], (10, 20));
        image.meta.coords_pix = [0.55, 0.5];
        image.meta.px_2_mm = 0.5;
        // 0.55 * 20 = 11, 0.5 * 10 = 5
        assert_eq!(frame_origin_mm(&image), [15.5, 7.5]);
    }

    #[test]
    fn test_relative_positions_start_at_zero() {
        let a = frame(1, 1.0, [4.0, -3.0], (4, 4));
        let b = frame(2, 1.0, [1.0, 7.0], (4, 4));
        let (min, rel) = relative_positions(&[&a, &b]);
        assert_eq!(min, [1.0, -3.0]);
        assert_eq!(rel, vec![[3.0, 0.0], [0.0, 10.0]]);
    }

    #[test]
    fn test_register_pads_bottom_left() {
        let canvas = Array2::from_elem((2, 3), 1.0f32);
        let incoming = Array2::from_elem((2, 2), 2.0f32);
        let (c, i) = register(&canvas, &incoming, 2, 1);
        assert_eq!(c.dim(), (3, 4));
        assert_eq!(i.dim(), (3, 4));
        // incoming sits one row above the bottom, two columns in
        assert_eq!(i[[0, 2]], 2.0);
        assert_eq!(i[[2, 2]], 0.0);
        assert_eq!(i[[1, 1]], 0.0);
        // canvas grew on top and right
        assert_eq!(c[[0, 0]], 0.0);
        assert_eq!(c[[2, 0]], 1.0);
        assert_eq!(c[[1, 3]], 0.0);
    }

    #[test]
    fn test_single_image_is_identity() {
        let image = frame(1, 0.3, [0.0, 0.0], (8, 9));
        let out = Stitcher::new().blend(&[&image]).unwrap();
        assert_eq!(out, image.to_gray().unwrap());
    }

    #[test]
    fn test_canvas_covers_bounding_box() {
        let a = frame(1, 0.4, [0.0, 0.0], (30, 40));
        let b = frame(2, 0.4, [25.0, 20.0], (30, 40));
        let stitcher = Stitcher::with_params(StitchParams {
            sigma_x: 20.0,
            sigma_y: 20.0,
            mask_downscale: 2,
            pyramid_levels: 3,
            debug_seams: false,
        });
        let out = stitcher.blend(&[&a, &b]).unwrap();
        assert_eq!(out.dim(), (50, 65));
        // equal inputs stay close to their level in the overlap
        assert!((0.2..0.6).contains(&out[[25, 30]]));
        // b alone at the top right, a alone at the bottom left
        assert_abs_diff_eq!(out[[2, 60]], 0.4, epsilon = 1e-4);
        assert_abs_diff_eq!(out[[48, 2]], 0.4, epsilon = 1e-4);
        // uncovered corners stay empty
        assert_abs_diff_eq!(out[[2, 2]], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_mask_weights_incoming_only_region() {
        let canvas = array![[1.0f32, 1.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]];
        let incoming = array![[0.0f32, 2.0, 2.0, 2.0], [0.0, 2.0, 2.0, 2.0]];
        let window = CropBox {
            row0: 0,
            row1: 2,
            col0: 0,
            col1: 4,
        };
        let params = StitchParams {
            sigma_x: 2.0,
            sigma_y: 2.0,
            mask_downscale: 1,
            pyramid_levels: 1,
            debug_seams: false,
        };
        let mask = overlap_mask(&canvas, &incoming, window, &params).unwrap();
        assert_eq!(mask.column(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(mask.column(3).to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_seam_overlay_marks_edges() {
        let mut mask = Array2::zeros((20, 20));
        mask.slice_mut(s![5..15, 5..15]).fill(1.0f32);
        let seams = seam_overlay(&mask);
        assert_eq!(seams[[5, 10]], 1.0);
        assert_eq!(seams[[12, 12]], 0.0);
        assert_eq!(seams[[0, 0]], 0.0);
    }
}
