//! snowimager: snow-pit image processing
//!
//! Turns raw frames of a snow-pit survey into calibrated reflectance,
//! stitches them into one composite per image type, and derives specific
//! surface area and ice-volume fraction profiles from the composites.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Plane, ImageData, ImageId, ImageType, ImageMetadata, CaptureInfo, DeviceId,
    RoiBox, RoiSet, SnowError, SnowResult
};
pub use config::{ProcessingConfig, AnalysisConfig, SerialPolicy};

pub use io::{MetadataDatabase, RawReader, CalibrationLibrary, StitchedExport};
pub use crate::core::{ImageSet, PipelineStage, Image, StitchedImage, SnowProfileAnalysis};
