//! The image-set state machine.
//!
//! An [`ImageSet`] owns the metadata database of one survey and the
//! snapshots produced by each processing stage. Stages run on a bounded
//! worker pool, one task per image, and each one reads the most advanced
//! snapshot its input chain allows:
//!
//! | stage                   | input, in order of preference            |
//! |-------------------------|------------------------------------------|
//! | flat-field              | loaded                                   |
//! | reflectance calibration | flat-field                               |
//! | undistortion            | reflectance-calibrated, flat-field       |
//! | stitching               | undistorted, reflectance-calibrated, flat-field |

use crate::config::ProcessingConfig;
use crate::core::flat_field::{FlatFieldCorrector, FlatFieldFrames, FlatFieldParams};
use crate::core::image::{Image, StitchedImage};
use crate::core::linking::LinkTable;
use crate::core::progress::{CancellationToken, ProgressCallback, ProgressTracker};
use crate::core::reflectance::ReflectanceCalibrator;
use crate::core::stitching::{StitchParams, Stitcher};
use crate::core::undistort::Undistorter;
use crate::io::calibration_file::CalibrationLibrary;
use crate::io::database::MetadataDatabase;
use crate::types::{ImageId, ImageMetadata, ImageType, SnowError, SnowResult};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Images of one stage, keyed by ID
pub type Snapshot = BTreeMap<ImageId, Image>;

/// Processing stages in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    Loaded,
    FlatField,
    ReflectanceCalibrated,
    Undistorted,
    Stitched,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Loaded => "loaded",
            PipelineStage::FlatField => "flat-field corrected",
            PipelineStage::ReflectanceCalibrated => "reflectance calibrated",
            PipelineStage::Undistorted => "undistorted",
            PipelineStage::Stitched => "stitched",
        }
    }

    /// Snapshots this stage can consume, most advanced first
    pub fn inputs(&self) -> &'static [PipelineStage] {
        use PipelineStage::*;
        match self {
            Loaded => &[],
            FlatField => &[Loaded],
            ReflectanceCalibrated => &[FlatField],
            Undistorted => &[ReflectanceCalibrated, FlatField],
            Stitched => &[Undistorted, ReflectanceCalibrated, FlatField],
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A survey's images and their processing state
pub struct ImageSet {
    db: MetadataDatabase,
    data_dir: Option<PathBuf>,
    config: ProcessingConfig,
    links: LinkTable,
    snapshots: BTreeMap<PipelineStage, Snapshot>,
    stitched: BTreeMap<ImageType, StitchedImage>,
    calibrations: CalibrationLibrary,
    progress: ProgressTracker,
    cancel: CancellationToken,
    pool: rayon::ThreadPool,
}

impl ImageSet {
    pub fn new(config: ProcessingConfig) -> SnowResult<Self> {
        Self::with_database(MetadataDatabase::new(), None, config)
    }

    /// Set over an existing database; relative file paths resolve against
    /// `data_dir`
    pub fn with_database(
        db: MetadataDatabase,
        data_dir: Option<PathBuf>,
        config: ProcessingConfig,
    ) -> SnowResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers)
            .thread_name(|i| format!("snowimager-worker-{}", i))
            .build()
            .map_err(|e| SnowError::Processing(format!("Failed to build worker pool: {}", e)))?;
        let links = LinkTable::build(&db);
        let calibrations = CalibrationLibrary::new(&config.calibration_dir);
        Ok(Self {
            db,
            data_dir,
            config,
            links,
            snapshots: BTreeMap::new(),
            stitched: BTreeMap::new(),
            calibrations,
            progress: ProgressTracker::new(),
            cancel: CancellationToken::new(),
            pool,
        })
    }

    /// Set over images already in memory, registered as the loaded stage
    pub fn from_images(images: Vec<Image>, config: ProcessingConfig) -> SnowResult<Self> {
        let db = MetadataDatabase::from_records(images.iter().map(|i| i.meta.clone()).collect());
        let mut set = Self::with_database(db, None, config)?;
        let loaded = images.into_iter().map(|i| (i.id(), i)).collect();
        set.snapshots.insert(PipelineStage::Loaded, loaded);
        Ok(set)
    }

    pub fn set_progress_callback(&mut self, callback: Option<ProgressCallback>) {
        self.progress.set_callback(callback);
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Token that cancels the running stage when triggered from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn database(&self) -> &MetadataDatabase {
        &self.db
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    // ---- database -------------------------------------------------------

    /// Replace the database; drops every snapshot
    pub fn load_db(&mut self, path: &Path) -> SnowResult<()> {
        self.db = MetadataDatabase::load(path)?;
        self.data_dir = path.parent().map(Path::to_path_buf);
        self.clear_snapshots();
        self.regenerate_links();
        Ok(())
    }

    pub fn save_db(&mut self, path: Option<&Path>) -> SnowResult<PathBuf> {
        self.db.save(path)
    }

    pub fn add_images_from_dir(&mut self, dir: &Path) -> SnowResult<Vec<ImageId>> {
        let added = self.db.add_images_from_dir(dir)?;
        self.regenerate_links();
        Ok(added)
    }

    pub fn insert_record(&mut self, meta: ImageMetadata) {
        self.db.insert(meta);
        self.regenerate_links();
    }

    pub fn remove_images(&mut self, ids: &[ImageId]) -> Vec<ImageMetadata> {
        let removed = ids.iter().filter_map(|id| self.db.remove(*id)).collect();
        for snapshot in self.snapshots.values_mut() {
            for id in ids {
                snapshot.remove(id);
            }
        }
        self.regenerate_links();
        removed
    }

    pub fn copy_fields(&mut self, source: ImageId, fields: &[&str], targets: &[ImageId]) -> SnowResult<()> {
        let result = self.db.copy_fields(source, fields, targets);
        self.regenerate_links();
        result
    }

    pub fn update_field(&mut self, ids: &[ImageId], field: &str, value: &str) -> SnowResult<()> {
        let result = self.db.update_field(ids, field, value);
        self.regenerate_links();
        result
    }

    pub fn add_default_roi(&mut self, id: ImageId) -> SnowResult<()> {
        let result = self.db.add_default_roi(id);
        self.regenerate_links();
        result
    }

    fn regenerate_links(&mut self) {
        self.links = LinkTable::build(&self.db);
    }

    // ---- snapshots ------------------------------------------------------

    pub fn snapshot(&self, stage: PipelineStage) -> Option<&Snapshot> {
        self.snapshots.get(&stage)
    }

    /// Stages with a snapshot, in pipeline order
    pub fn stages(&self) -> Vec<PipelineStage> {
        let mut stages: Vec<_> = self.snapshots.keys().copied().collect();
        if !self.stitched.is_empty() {
            stages.push(PipelineStage::Stitched);
        }
        stages
    }

    pub fn stitched(&self, img_type: ImageType) -> Option<&StitchedImage> {
        self.stitched.get(&img_type)
    }

    pub fn stitched_images(&self) -> &BTreeMap<ImageType, StitchedImage> {
        &self.stitched
    }

    /// Most advanced snapshot `stage` can consume
    pub fn input_for(&self, stage: PipelineStage) -> SnowResult<(PipelineStage, &Snapshot)> {
        stage
            .inputs()
            .iter()
            .find_map(|s| self.snapshots.get(s).map(|snap| (*s, snap)))
            .ok_or_else(|| {
                SnowError::StageUnavailable(format!(
                    "Cannot run {} stage: none of {:?} is available",
                    stage,
                    stage.inputs()
                ))
            })
    }

    /// Discard the snapshot of `stage`; true if there was one
    pub fn undo(&mut self, stage: PipelineStage) -> bool {
        let removed = match stage {
            PipelineStage::Stitched => {
                let had = !self.stitched.is_empty();
                self.stitched.clear();
                had
            }
            other => self.snapshots.remove(&other).is_some(),
        };
        if removed {
            log::info!("Discarded {} snapshot", stage);
        }
        removed
    }

    fn clear_snapshots(&mut self) {
        self.snapshots.clear();
        self.stitched.clear();
    }

    // ---- stages ---------------------------------------------------------

    /// Run `task` over `items` on the worker pool.
    ///
    /// Every item is processed even when some fail; the first failure in
    /// item order is returned afterwards. Cancellation stops workers before
    /// their next item.
    fn run_stage<T, F>(&self, items: Vec<T>, task: F) -> SnowResult<Vec<Image>>
    where
        T: Send,
        F: Fn(T) -> SnowResult<Option<Image>> + Sync,
    {
        let empty = items.is_empty();
        let step = 100.0 / items.len().max(1) as f64;
        let cancel = &self.cancel;
        let progress = &self.progress;

        let results: Vec<SnowResult<Option<Image>>> = self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| {
                    cancel.check()?;
                    let result = task(item);
                    progress.inc(step, None, false);
                    result
                })
                .collect()
        });
        if empty {
            progress.inc(step, None, false);
        }

        if cancel.is_cancelled() {
            log::warn!("Stage cancelled; previous snapshots kept");
            return Err(SnowError::Cancelled);
        }

        let mut first_error = None;
        let mut done = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Some(image)) => done.push(image),
                Ok(None) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => log::warn!("Additional failure in stage: {}", e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    fn begin(&self, message: &str) {
        self.cancel.reset();
        self.progress.start(message);
        log::info!("{}", message);
    }

    /// Decode every database record into the loaded snapshot. All later
    /// snapshots are dropped.
    pub fn load_images(&mut self) -> SnowResult<usize> {
        self.begin("Loading images");
        let data_dir = self.data_dir.clone();
        let records: Vec<ImageMetadata> = self.db.records().cloned().collect();
        let images = self.run_stage(records, |meta| {
            Image::load(meta, data_dir.as_deref()).map(Some)
        })?;

        self.clear_snapshots();
        let count = images.len();
        self.snapshots.insert(
            PipelineStage::Loaded,
            images.into_iter().map(|i| (i.id(), i)).collect(),
        );
        log::info!("✅ Loaded {} images", count);
        Ok(count)
    }

    /// Low-resolution decode of every record; not stored as a stage
    pub fn load_previews(&self, shrink: usize) -> SnowResult<Snapshot> {
        self.begin("Loading previews");
        let data_dir = self.data_dir.clone();
        let records: Vec<ImageMetadata> = self.db.records().cloned().collect();
        let images = self.run_stage(records, |meta| {
            Image::load_preview(meta, data_dir.as_deref(), shrink).map(Some)
        })?;
        Ok(images.into_iter().map(|i| (i.id(), i)).collect())
    }

    /// Flat-field correct every lit image that has a reference partner
    pub fn ffc(&mut self) -> SnowResult<usize> {
        self.begin("Flat-field correction");
        let (_, loaded) = self.input_for(PipelineStage::FlatField)?;
        let corrector = FlatFieldCorrector::with_params(FlatFieldParams {
            epsilon: self.config.ffc_epsilon,
            ..FlatFieldParams::default()
        });
        let links = &self.links;

        let targets: Vec<&Image> = loaded
            .values()
            .filter(|img| !img.meta.is_dark() && links.ref_id(img.id()).is_some())
            .collect();

        let images = self.run_stage(targets, |image| {
            match resolve_flat_field_frames(image.id(), links, loaded) {
                Ok(frames) => corrector.correct(image, &frames).map(Some),
                Err(e) => {
                    log::warn!("Skipping image {} in flat-field correction: {}", image.id(), e);
                    Ok(None)
                }
            }
        })?;

        let count = images.len();
        self.store(PipelineStage::FlatField, images);
        log::info!("✅ Flat-field corrected {} images", count);
        Ok(count)
    }

    /// Convert flat-field corrected images to absolute reflectance
    pub fn refl_cal(&mut self) -> SnowResult<usize> {
        self.begin("Reflectance calibration");
        let (_, input) = self.input_for(PipelineStage::ReflectanceCalibrated)?;
        let calibrator = ReflectanceCalibrator::new();
        let images = self.run_stage(input.values().collect(), |image: &Image| {
            calibrator.calibrate(image).map(Some)
        })?;

        let count = images.len();
        self.store(PipelineStage::ReflectanceCalibrated, images);
        log::info!("✅ Reflectance calibrated {} images", count);
        Ok(count)
    }

    /// Correct lens distortion using each camera's calibration file
    pub fn undistort(&mut self) -> SnowResult<usize> {
        self.begin("Undistortion");
        let (source, input) = self.input_for(PipelineStage::Undistorted)?;
        log::info!("Undistorting the {} snapshot", source);
        let undistorter = Undistorter::new(&self.calibrations, self.config.serial_policy);
        let images = self.run_stage(input.values().collect(), |image: &Image| {
            undistorter.undistort(image).map(Some)
        })?;

        let count = images.len();
        self.store(PipelineStage::Undistorted, images);
        log::info!("✅ Undistorted {} images", count);
        Ok(count)
    }

    /// Stitch each image type into one composite. Reference frames and
    /// types without images are left out.
    pub fn stitch(&mut self) -> SnowResult<usize> {
        self.begin("Stitching");
        let (source, input) = self.input_for(PipelineStage::Stitched)?;
        log::info!("Stitching the {} snapshot", source);

        let mut groups: BTreeMap<ImageType, Vec<&Image>> = BTreeMap::new();
        for image in input.values() {
            if image.meta.img_type != ImageType::Reference {
                groups.entry(image.meta.img_type).or_default().push(image);
            }
        }
        let groups: Vec<(ImageType, Vec<&Image>)> = groups.into_iter().collect();
        let step = 100.0 / groups.len().max(1) as f64;
        let stitcher = Stitcher::with_params(StitchParams::from(&self.config));
        let cancel = &self.cancel;
        let progress = &self.progress;

        let results: Vec<SnowResult<StitchedImage>> = self.pool.install(|| {
            groups
                .par_iter()
                .map(|(img_type, images)| {
                    cancel.check()?;
                    let result = stitcher.stitch_group(*img_type, images);
                    progress.inc(step, None, false);
                    result
                })
                .collect()
        });
        if groups.is_empty() {
            progress.inc(step, None, false);
            log::warn!("No images to stitch");
        }
        if cancel.is_cancelled() {
            return Err(SnowError::Cancelled);
        }

        let stitched = results
            .into_iter()
            .map(|r| r.map(|s| (s.meta.img_type, s)))
            .collect::<SnowResult<BTreeMap<_, _>>>()?;
        let count = stitched.len();
        self.stitched = stitched;
        log::info!("✅ Stitched {} composites", count);
        Ok(count)
    }

    fn store(&mut self, stage: PipelineStage, images: Vec<Image>) {
        self.snapshots
            .insert(stage, images.into_iter().map(|i| (i.id(), i)).collect());
    }
}

impl std::fmt::Debug for ImageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSet")
            .field("records", &self.db.len())
            .field("data_dir", &self.data_dir)
            .field("stages", &self.stages())
            .finish()
    }
}

/// Dark, reference and reference-dark frames of `id`
fn resolve_flat_field_frames<'a>(
    id: ImageId,
    links: &LinkTable,
    loaded: &'a Snapshot,
) -> SnowResult<FlatFieldFrames<'a>> {
    let frame = |partner: Option<ImageId>, role: &str| -> SnowResult<&'a Image> {
        let partner = partner
            .ok_or_else(|| SnowError::MissingLink(format!("image {} has no {}", id, role)))?;
        loaded.get(&partner).ok_or_else(|| {
            SnowError::MissingLink(format!("{} {} of image {} is not loaded", role, partner, id))
        })
    };

    let ref_id = links.ref_id(id);
    Ok(FlatFieldFrames {
        dark: frame(links.dark_id(id), "dark frame")?,
        reference: frame(ref_id, "reference")?,
        reference_dark: frame(ref_id.and_then(|r| links.dark_id(r)), "reference dark frame")?,
    })
}
