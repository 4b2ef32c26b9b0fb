//! Core snow image processing modules

pub mod filters;
pub mod image;
pub mod flat_field;
pub mod reflectance;
pub mod undistort;
pub mod stitching;
pub mod linking;
pub mod progress;
pub mod pipeline;
pub mod lambert_w;
pub mod ssa;
pub mod density;
pub mod analysis;

// Re-export main types
pub use image::{Image, FrameRecord, StitchedImage, StitchedMetadata};
pub use flat_field::{FlatFieldCorrector, FlatFieldFrames, FlatFieldParams};
pub use reflectance::{ReflectanceCalibrator, ReflectanceFit};
pub use undistort::Undistorter;
pub use stitching::{Stitcher, StitchParams};
pub use linking::{LinkTable, LinkEntry};
pub use progress::{ProgressTracker, ProgressUpdate, ProgressCallback, CancellationToken};
pub use pipeline::{ImageSet, PipelineStage, Snapshot};
pub use lambert_w::{lambert_w, lambert_w0, lambert_wm1, Branch};
pub use ssa::{SsaModel, SsaResult};
pub use density::{DensityResult, Slit};
pub use analysis::{SnowProfileAnalysis, ReportTable};
