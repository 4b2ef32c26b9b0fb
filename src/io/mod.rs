//! Readers and writers for raw frames, metadata and calibration data

pub mod literal;
pub mod database;
pub mod raw_reader;
pub mod calibration_file;
pub mod refractive_index;
pub mod export;

pub use database::MetadataDatabase;
pub use raw_reader::{RawReader, RawFormat};
pub use calibration_file::{CalibrationLibrary, DistortionCalibration, DistortionProfile, MountPosition};
pub use refractive_index::RefractiveIndexTable;
pub use export::{StitchedExport, AuxAttributes};
