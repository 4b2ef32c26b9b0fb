use crate::core::filters::nanmean;
use crate::core::image::Image;
use crate::types::{ImageData, RoiBox, SnowError, SnowResult};
use ndarray::{s, Axis, Zip};

/// Reflectance of the gray calibration targets
pub const GRAY_REFLECTANCE: f64 = 0.498;
/// Reflectance of the white calibration targets
pub const WHITE_REFLECTANCE: f64 = 0.94;

/// Slope weights for (white-gray, white-black, gray-black)
const SLOPE_WEIGHTS: [f64; 3] = [3.0, 1.0, 1.0];

/// Affine map `R' = slope * R + offset` of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectanceFit {
    pub slope: f64,
    pub offset: f64,
}

impl ReflectanceFit {
    /// Fit from the measured target means.
    ///
    /// Combines the white-gray, white-black and gray-black slopes 3:1:1.
    /// When a target reads zero the map is the two-point line through both
    /// targets. When both targets read the same, the white-gray slope drops
    /// out and the remaining weights are renormalised.
    pub fn from_targets(gray: f64, white: f64) -> SnowResult<Self> {
        let slopes = [
            (WHITE_REFLECTANCE - GRAY_REFLECTANCE) / (white - gray),
            WHITE_REFLECTANCE / white,
            GRAY_REFLECTANCE / gray,
        ];

        if slopes[0].is_finite() && !(slopes[1].is_finite() && slopes[2].is_finite()) {
            let slope = slopes[0];
            return Ok(Self {
                slope,
                offset: GRAY_REFLECTANCE - slope * gray,
            });
        }

        let (weighted, total) = slopes
            .iter()
            .zip(SLOPE_WEIGHTS)
            .filter(|(m, _)| m.is_finite())
            .fold((0.0, 0.0), |(acc, n), (m, w)| (acc + m * w, n + w));
        if total == 0.0 {
            return Err(SnowError::Processing(format!(
                "Cannot fit reflectance from target means gray={} white={}",
                gray, white
            )));
        }
        let slope = weighted / total;
        let offset = ((WHITE_REFLECTANCE - slope * white) + (GRAY_REFLECTANCE - slope * gray)) / 2.0;
        Ok(Self { slope, offset })
    }

    pub fn apply(&self, value: f32) -> f32 {
        (self.slope * value as f64 + self.offset) as f32
    }
}

/// Per-channel means inside each box, one row per box
pub fn roi_means(image: &ImageData, boxes: &[RoiBox]) -> Vec<Vec<f64>> {
    let (height, width, _) = image.dim();
    boxes
        .iter()
        .map(|roi| {
            let (x0, y0, x1, y1) = roi.to_pixels(width, height);
            let window = image.slice(s![y0..y1.max(y0), x0..x1.max(x0), ..]);
            window
                .axis_iter(Axis(2))
                .map(|channel| nanmean(channel.iter().map(|v| *v as f64)))
                .collect()
        })
        .collect()
}

/// Per-channel mean over all boxes
pub fn target_means(image: &ImageData, boxes: &[RoiBox]) -> Vec<f64> {
    let per_box = roi_means(image, boxes);
    (0..image.len_of(Axis(2)))
        .map(|ch| nanmean(per_box.iter().map(|means| means[ch])))
        .collect()
}

/// Converts flat-field corrected frames to absolute reflectance using the
/// gray and white targets placed in each frame
pub struct ReflectanceCalibrator;

impl ReflectanceCalibrator {
    pub fn new() -> Self {
        Self
    }

    /// One fit per channel
    pub fn fit(&self, image: &Image) -> SnowResult<Vec<ReflectanceFit>> {
        let gray = target_means(&image.data, &image.meta.roi.gray);
        let white = target_means(&image.data, &image.meta.roi.white);
        log::debug!(
            "Image {} ({} nm): gray targets {:?}, white targets {:?}",
            image.id(),
            image.meta.wavelength,
            gray,
            white
        );
        gray.iter()
            .zip(&white)
            .map(|(g, w)| ReflectanceFit::from_targets(*g, *w))
            .collect::<SnowResult<Vec<_>>>()
            .map_err(|e| SnowError::Processing(format!("Image {}: {}", image.id(), e)))
    }

    pub fn calibrate(&self, image: &Image) -> SnowResult<Image> {
        let fits = self.fit(image)?;
        let mut data = image.data.clone();

        let apply = |mut pixel: ndarray::ArrayViewMut1<f32>| {
            for (v, fit) in pixel.iter_mut().zip(&fits) {
                *v = fit.apply(*v);
            }
        };

        #[cfg(feature = "parallel")]
        Zip::from(data.lanes_mut(Axis(2))).par_for_each(apply);

        #[cfg(not(feature = "parallel"))]
        Zip::from(data.lanes_mut(Axis(2))).for_each(apply);

        Ok(Image {
            meta: image.meta.clone(),
            data,
            capture: image.capture.clone(),
        })
    }
}

impl Default for ReflectanceCalibrator {
    fn default() -> Self {
        Self::new()
    }
}
