use crate::core::image::Image;
use crate::types::{ImageData, SnowError, SnowResult};
use ndarray::Zip;

/// Flat-field correction parameters
#[derive(Debug, Clone)]
pub struct FlatFieldParams {
    /// Lower bound of the dark-corrected reference
    pub epsilon: f32,
    /// Gain applied after the division
    pub gain: f32,
    pub clip_min: f32,
    pub clip_max: f32,
}

impl Default for FlatFieldParams {
    fn default() -> Self {
        Self {
            epsilon: 1e-10,
            gain: 0.5,
            clip_min: -0.25,
            clip_max: 1.25,
        }
    }
}

/// Frames resolved through the link table for one measurement
pub struct FlatFieldFrames<'a> {
    pub dark: &'a Image,
    pub reference: &'a Image,
    pub reference_dark: &'a Image,
}

/// `clip((img - dark) / max(ref - ref_dark, eps) * gain, min, max)`
pub struct FlatFieldCorrector {
    params: FlatFieldParams,
}

impl FlatFieldCorrector {
    pub fn new() -> Self {
        Self {
            params: FlatFieldParams::default(),
        }
    }

    pub fn with_params(params: FlatFieldParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &FlatFieldParams {
        &self.params
    }

    pub fn apply(
        &self,
        image: &ImageData,
        dark: &ImageData,
        reference: &ImageData,
        reference_dark: &ImageData,
    ) -> SnowResult<ImageData> {
        let shape = image.dim();
        for (name, other) in [("dark", dark), ("reference", reference), ("reference dark", reference_dark)] {
            if other.dim() != shape {
                return Err(SnowError::Processing(format!(
                    "Flat-field {} frame has shape {:?}, image has {:?}",
                    name,
                    other.dim(),
                    shape
                )));
            }
        }

        let FlatFieldParams {
            epsilon,
            gain,
            clip_min,
            clip_max,
        } = self.params;
        let correct = move |&v: &f32, &d: &f32, &r: &f32, &rd: &f32| -> f32 {
            let flat = (r - rd).max(epsilon);
            ((v - d) / flat * gain).clamp(clip_min, clip_max)
        };

        #[cfg(feature = "parallel")]
        let corrected = Zip::from(image)
            .and(dark)
            .and(reference)
            .and(reference_dark)
            .par_map_collect(correct);

        #[cfg(not(feature = "parallel"))]
        let corrected = Zip::from(image)
            .and(dark)
            .and(reference)
            .and(reference_dark)
            .map_collect(correct);

        Ok(corrected)
    }

    /// Corrected copy of `image`, keeping its identity and capture info
    pub fn correct(&self, image: &Image, frames: &FlatFieldFrames<'_>) -> SnowResult<Image> {
        log::debug!(
            "FFC of image {} with dark {}, reference {} and reference dark {}",
            image.id(),
            frames.dark.id(),
            frames.reference.id(),
            frames.reference_dark.id()
        );
        let data = self.apply(
            &image.data,
            &frames.dark.data,
            &frames.reference.data,
            &frames.reference_dark.data,
        )?;
        Ok(Image {
            meta: image.meta.clone(),
            data,
            capture: image.capture.clone(),
        })
    }
}

impl Default for FlatFieldCorrector {
    fn default() -> Self {
        Self::new()
    }
}
