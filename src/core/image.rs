use crate::io::raw_reader::RawReader;
use crate::types::{
    CaptureInfo, ImageData, ImageId, ImageMetadata, ImageType, Plane, SnowError, SnowResult,
};
use ndarray::Axis;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A decoded frame together with its database record
#[derive(Debug, Clone)]
pub struct Image {
    pub meta: ImageMetadata,
    pub data: ImageData,
    pub capture: CaptureInfo,
}

impl Image {
    pub fn new(meta: ImageMetadata, data: ImageData) -> Self {
        Self {
            meta,
            data,
            capture: CaptureInfo::default(),
        }
    }

    pub fn with_capture(mut self, capture: CaptureInfo) -> Self {
        self.capture = capture;
        self
    }

    /// Resolve the record's file path, relative paths against `data_dir`
    pub fn resolve_path(meta: &ImageMetadata, data_dir: Option<&Path>) -> PathBuf {
        match data_dir {
            Some(dir) if meta.filepath.is_relative() => dir.join(&meta.filepath),
            _ => meta.filepath.clone(),
        }
    }

    /// Decode the raw file behind `meta`
    pub fn load(meta: ImageMetadata, data_dir: Option<&Path>) -> SnowResult<Self> {
        let path = Self::resolve_path(&meta, data_dir);
        log::debug!("Loading image {} from {}", meta.id, path.display());
        let (data, capture) = RawReader::new(&path)?.read()?;
        Ok(Self {
            meta,
            data,
            capture,
        })
    }

    /// Fast low-resolution decode with the same array layout as `load`
    pub fn load_preview(meta: ImageMetadata, data_dir: Option<&Path>, shrink: usize) -> SnowResult<Self> {
        let path = Self::resolve_path(&meta, data_dir);
        let data = RawReader::new(&path)?.read_preview(shrink)?;
        Ok(Self::new(meta, data))
    }

    pub fn id(&self) -> ImageId {
        self.meta.id
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// Channel mean as a single plane
    pub fn to_gray(&self) -> SnowResult<Plane> {
        self.data.mean_axis(Axis(2)).ok_or_else(|| {
            SnowError::Processing(format!("Image {} has no channels", self.meta.id))
        })
    }
}

/// Per-frame provenance kept with a composite
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRecord {
    pub meta: ImageMetadata,
    pub capture: CaptureInfo,
}

/// Descriptor of a stitched composite
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StitchedMetadata {
    pub img_type: ImageType,
    pub px_2_mm: f64,
    pub wavelength: f64,
    pub date: String,
    pub location: String,
    /// Reference point of the composite, fraction of its size
    pub coords_pix: [f64; 2],
    /// Physical position of the reference point (mm)
    pub coords_mm: [f64; 2],
    /// Source frames, ascending by ID
    pub orig_meta: Vec<FrameRecord>,
}

impl StitchedMetadata {
    /// Combine the records of a stitched group.
    ///
    /// Fields that disagree across frames are logged and taken from the
    /// frame with the lowest ID. Dates of reference frames are ignored.
    pub fn from_frames(
        img_type: ImageType,
        mut frames: Vec<FrameRecord>,
        origin_mm: [f64; 2],
    ) -> SnowResult<Self> {
        frames.sort_by_key(|f| f.meta.id);
        let first = frames.first().ok_or_else(|| {
            SnowError::Processing(format!("No frames to describe {} composite", img_type))
        })?;

        let wavelength = consistent(img_type, "wavelength", frames.iter().map(|f| f.meta.wavelength))
            .unwrap_or(first.meta.wavelength);
        let px_2_mm = consistent(img_type, "px_2_mm", frames.iter().map(|f| f.meta.px_2_mm))
            .unwrap_or(first.meta.px_2_mm);
        let date = consistent(
            img_type,
            "date",
            frames
                .iter()
                .filter(|f| !f.meta.is_reference())
                .map(|f| f.meta.date.clone()),
        )
        .unwrap_or_else(|| first.meta.date.clone());
        let location = consistent(img_type, "location", frames.iter().map(|f| f.meta.location.clone()))
            .unwrap_or_else(|| first.meta.location.clone());

        Ok(Self {
            img_type,
            px_2_mm,
            wavelength,
            date,
            location,
            coords_pix: [0.0, 0.0],
            coords_mm: origin_mm,
            orig_meta: frames,
        })
    }
}

/// First value of `values`; warns if any later value differs
fn consistent<T: PartialEq + std::fmt::Debug>(
    img_type: ImageType,
    field: &str,
    mut values: impl Iterator<Item = T>,
) -> Option<T> {
    let first = values.next()?;
    if values.any(|v| v != first) {
        log::warn!(
            "Multiple values of {} in {} composite; keeping {:?}",
            field,
            img_type,
            first
        );
    }
    Some(first)
}

/// Grayscale composite of one image type
#[derive(Debug, Clone)]
pub struct StitchedImage {
    pub meta: StitchedMetadata,
    pub data: Plane,
}

impl StitchedImage {
    /// Capture info of the last source frame, used for export attributes
    pub fn capture(&self) -> Option<&CaptureInfo> {
        self.meta.orig_meta.last().map(|f| &f.capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn frame(id: ImageId, img_type: ImageType, wavelength: f64, date: &str) -> FrameRecord {
        FrameRecord {
            meta: ImageMetadata {
                id,
                img_type,
                wavelength,
                date: date.to_string(),
                ..Default::default()
            },
            capture: CaptureInfo::default(),
        }
    }

    #[test]
    fn test_gray_is_channel_mean() {
        let data = Array3::from_shape_fn((2, 3, 3), |(_, _, ch)| ch as f32);
        let image = Image::new(ImageMetadata::default(), data);
        assert_eq!((image.height(), image.width(), image.channels()), (2, 3, 3));
        let gray = image.to_gray().unwrap();
        assert!(gray.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_resolve_relative_path() {
        let meta = ImageMetadata::with_path(1, "pit/a.bay");
        assert_eq!(
            Image::resolve_path(&meta, Some(Path::new("/data"))),
            PathBuf::from("/data/pit/a.bay")
        );
        let absolute = ImageMetadata::with_path(1, "/abs/a.bay");
        assert_eq!(
            Image::resolve_path(&absolute, Some(Path::new("/data"))),
            PathBuf::from("/abs/a.bay")
        );
    }

    #[test]
    fn test_stitched_metadata_keeps_first_on_conflict() {
        let frames = vec![
            frame(9, ImageType::NoGrid, 850.0, "2024-02-02"),
            frame(3, ImageType::NoGrid, 940.0, "2024-02-01"),
            frame(5, ImageType::Reference, 940.0, "1999-01-01"),
        ];
        let meta = StitchedMetadata::from_frames(ImageType::NoGrid, frames, [1.0, 2.0]).unwrap();
        assert_eq!(meta.wavelength, 940.0);
        assert_eq!(meta.date, "2024-02-01");
        assert_eq!(meta.coords_pix, [0.0, 0.0]);
        assert_eq!(meta.coords_mm, [1.0, 2.0]);
        let ids: Vec<_> = meta.orig_meta.iter().map(|f| f.meta.id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_stitched_metadata_requires_frames() {
        assert!(StitchedMetadata::from_frames(ImageType::Grid, Vec::new(), [0.0, 0.0]).is_err());
    }
}
