//! Export of stitched composites.
//!
//! A composite is stored as 16-bit integers scaled by 1023 under
//! `SnowImage(s)/<img_type>/image`, with its scale and reference point as
//! dataset attributes. Capture details of the device go on the
//! `SnowImage(s)` group.

use crate::core::image::{StitchedImage, StitchedMetadata};
use crate::types::{CaptureInfo, ImageType, Plane};
use chrono::{DateTime, TimeZone};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Name of the top-level group in exported files
pub const ROOT_GROUP: &str = "SnowImage(s)";
/// Scale applied to reflectance before quantisation
pub const EXPORT_SCALE: f32 = 1023.0;
/// Divisor applied when reading exported images back
pub const IMPORT_SCALE: f32 = 1024.0;

/// Group attributes describing the capture device
pub type AuxAttributes = BTreeMap<String, String>;

/// A composite in its exported form
#[derive(Debug, Clone, PartialEq)]
pub struct StitchedExport {
    pub img_type: ImageType,
    pub image: Array2<i16>,
    pub pix2mm: f64,
    pub reference_pix_xz: [f64; 2],
    pub reference_pos_xz: [f64; 2],
    pub aux: AuxAttributes,
}

impl StitchedExport {
    pub fn from_stitched(stitched: &StitchedImage) -> Self {
        let aux = match stitched.capture() {
            Some(capture) => aux_attributes(capture),
            None => AuxAttributes::new(),
        };
        Self {
            img_type: stitched.meta.img_type,
            image: quantize(&stitched.data),
            pix2mm: stitched.meta.px_2_mm,
            reference_pix_xz: stitched.meta.coords_pix,
            reference_pos_xz: stitched.meta.coords_mm,
            aux,
        }
    }

    /// Reflectance as read back for analysis
    pub fn reflectance(&self) -> Plane {
        self.image.mapv(|v| v as f32 / IMPORT_SCALE)
    }
}

/// `clip(plane·1023, 0, 1023)` truncated to integers; NaN maps to 0
pub fn quantize(plane: &Plane) -> Array2<i16> {
    plane.mapv(|v| {
        if v.is_nan() {
            0
        } else {
            (v * EXPORT_SCALE).clamp(0.0, EXPORT_SCALE) as i16
        }
    })
}

/// Device attributes of a capture, keyed by its device family
pub fn aux_attributes(capture: &CaptureInfo) -> AuxAttributes {
    let serial = capture.serial_number();
    log::info!("Serial number is {}", serial);
    let sidecar = |path: &[&str]| capture.sidecar_value(path).unwrap_or_default();

    let entries: Vec<(&str, String)> = match serial.as_str() {
        "snowimager-01" => vec![
            ("timestamp", sidecar(&["timestamp"])),
            ("timezone", sidecar(&["timezone"])),
            ("longitude", String::new()),
            ("latitude", String::new()),
            ("software_version", sidecar(&["software_version"])),
            ("wavelength", sidecar(&["wavelength"])),
            ("board_temperature_electronics_side", String::new()),
            ("board_temperature_led_side", String::new()),
        ],
        "snowimager-06" | "snowimager-07" => vec![
            (
                "timestamp",
                capture.datetime_original.clone().unwrap_or_default(),
            ),
            ("timezone", "UTC".to_string()),
            ("longitude", sidecar(&["longitude"])),
            ("latitude", sidecar(&["latitude"])),
            ("software_version", sidecar(&["software_version"])),
            ("wavelength", sidecar(&["wavelength"])),
            (
                "board_temperature_electronics_side",
                sidecar(&["temperatures", "board_temperature_electronics_side"]),
            ),
            (
                "board_temperature_led_side",
                sidecar(&["temperatures", "board_temperature_led_side"]),
            ),
        ],
        other => {
            log::warn!("No auxiliary attributes known for device {}", other);
            Vec::new()
        }
    };
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// `<date>_<location>/processedOn_<YYYYmmdd_HHMM>.h5`, or `.DEBUG.h5` when
/// seams are drawn into the composite
pub fn default_output_path<Tz>(meta: &StitchedMetadata, debug: bool, now: &DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let extension = if debug { "DEBUG.h5" } else { "h5" };
    PathBuf::from(format!("{}_{}", meta.date, meta.location)).join(format!(
        "processedOn_{}.{}",
        now.format("%Y%m%d_%H%M"),
        extension
    ))
}

#[cfg(feature = "hdf5")]
mod h5 {
    use super::*;
    use crate::types::{SnowError, SnowResult};
    use hdf5::types::VarLenUnicode;
    use std::path::Path;

    fn unicode(value: &str) -> SnowResult<VarLenUnicode> {
        value
            .parse::<VarLenUnicode>()
            .map_err(|e| SnowError::Processing(format!("Invalid attribute text {:?}: {}", value, e)))
    }

    fn pair(values: Vec<f64>, name: &str) -> SnowResult<[f64; 2]> {
        match values.as_slice() {
            [a, b] => Ok([*a, *b]),
            _ => Err(SnowError::Processing(format!(
                "Attribute {} has {} values, expected 2",
                name,
                values.len()
            ))),
        }
    }

    /// Append composites to `path`, creating the file if needed. An
    /// existing composite of the same type is replaced. Device attributes
    /// are written with the top-level group, taken from the last export
    /// that has any.
    pub fn write_exports(path: &Path, exports: &[StitchedExport]) -> SnowResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = hdf5::File::append(path)?;
        let (root, created) = if file.link_exists(ROOT_GROUP) {
            (file.group(ROOT_GROUP)?, false)
        } else {
            (file.create_group(ROOT_GROUP)?, true)
        };

        if created {
            let aux = exports.iter().rev().find(|e| !e.aux.is_empty()).map(|e| &e.aux);
            for (key, value) in aux.into_iter().flatten() {
                root.new_attr::<VarLenUnicode>()
                    .create(key.as_str())?
                    .write_scalar(&unicode(value)?)?;
            }
        }

        for export in exports {
            let name = export.img_type.as_str();
            if root.link_exists(name) {
                log::warn!("Replacing existing {} composite in {}", name, path.display());
                root.unlink(name)?;
            }
            let group = root.create_group(name)?;
            let dataset = group
                .new_dataset_builder()
                .shuffle()
                .deflate(4)
                .with_data(&export.image)
                .create("image")?;
            dataset
                .new_attr::<f64>()
                .create("pix2mm")?
                .write_scalar(&export.pix2mm)?;
            dataset
                .new_attr::<f64>()
                .shape(2)
                .create("reference_pix_xz")?
                .write_raw(&export.reference_pix_xz[..])?;
            dataset
                .new_attr::<f64>()
                .shape(2)
                .create("reference_pos_xz")?
                .write_raw(&export.reference_pos_xz[..])?;
            log::info!("Wrote {} composite to {}", name, path.display());
        }
        Ok(())
    }

    /// Read every composite stored in `path`
    pub fn read_exports(path: &Path) -> SnowResult<Vec<StitchedExport>> {
        let file = hdf5::File::open(path)?;
        let root = file.group(ROOT_GROUP)?;

        let mut aux = AuxAttributes::new();
        for key in root.attr_names()? {
            let value = root.attr(&key)?.read_scalar::<VarLenUnicode>()?;
            aux.insert(key, value.as_str().to_string());
        }

        let mut exports = Vec::new();
        for name in root.member_names()? {
            let img_type: ImageType = match name.parse() {
                Ok(t) => t,
                Err(_) => {
                    log::warn!("Ignoring unknown group {} in {}", name, path.display());
                    continue;
                }
            };
            let dataset = root.group(&name)?.dataset("image")?;
            exports.push(StitchedExport {
                img_type,
                image: dataset.read_2d::<i16>()?,
                pix2mm: dataset.attr("pix2mm")?.read_scalar::<f64>()?,
                reference_pix_xz: pair(dataset.attr("reference_pix_xz")?.read_raw()?, "reference_pix_xz")?,
                reference_pos_xz: pair(dataset.attr("reference_pos_xz")?.read_raw()?, "reference_pos_xz")?,
                aux: aux.clone(),
            });
        }
        Ok(exports)
    }
}

#[cfg(feature = "hdf5")]
pub use h5::{read_exports, write_exports};
