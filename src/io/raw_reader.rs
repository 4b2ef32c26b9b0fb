use crate::types::{CaptureInfo, ImageData, SnowError, SnowResult};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Raw sensor container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    /// Packed Bayer stream written by the camera module (`.bay`)
    Bayer,
    /// Adobe DNG (`.dng`)
    Dng,
}

impl RawFormat {
    pub fn from_path(path: &Path) -> SnowResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "bay" => Ok(RawFormat::Bayer),
            "dng" => Ok(RawFormat::Dng),
            _ => Err(SnowError::UnsupportedFormat(format!(
                "{} is not a supported raw image (.bay, .dng)",
                path.display()
            ))),
        }
    }
}

/// Bit packing of a Bayer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// 4 pixels in 5 bytes
    Raw10,
    /// 2 pixels in 3 bytes
    Raw12,
}

impl Packing {
    pub fn full_scale(&self) -> f32 {
        match self {
            Packing::Raw10 => 1023.0,
            Packing::Raw12 => 4095.0,
        }
    }
}

/// Physical layout of one camera/sensor-mode combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BayerLayout {
    pub version: u8,
    pub rows: usize,
    pub row_bytes: usize,
    pub crop_rows: usize,
    pub crop_bytes: usize,
    pub packing: Packing,
}

impl BayerLayout {
    const fn new(
        version: u8,
        (rows, row_bytes): (usize, usize),
        (crop_rows, crop_bytes): (usize, usize),
        packing: Packing,
    ) -> Self {
        Self {
            version,
            rows,
            row_bytes,
            crop_rows,
            crop_bytes,
            packing,
        }
    }

    pub fn file_size(&self) -> usize {
        self.rows * self.row_bytes
    }

    /// Sensor pixels per row after unpacking
    pub fn width(&self) -> usize {
        match self.packing {
            Packing::Raw10 => self.crop_bytes / 5 * 4,
            Packing::Raw12 => self.crop_bytes / 3 * 2,
        }
    }

    /// Layout matching a file of `len` bytes
    pub fn for_file_size(len: usize) -> Option<&'static BayerLayout> {
        BAYER_LAYOUTS.iter().find(|l| l.file_size() == len)
    }
}

/// Known camera modules and sensor modes
pub const BAYER_LAYOUTS: [BayerLayout; 7] = [
    BayerLayout::new(1, (1952, 3264), (1944, 3240), Packing::Raw10),
    BayerLayout::new(2, (2480, 4128), (2464, 4100), Packing::Raw10), // v2, picamera
    BayerLayout::new(3, (2464, 4128), (2464, 4100), Packing::Raw10), // v2, picamera2
    BayerLayout::new(4, (864, 1536), (864, 1536), Packing::Raw10),   // v3, mode 0
    BayerLayout::new(5, (1296, 2880), (1296, 2880), Packing::Raw10), // v3, mode 1
    BayerLayout::new(6, (2592, 5760), (2592, 5760), Packing::Raw10), // v3, mode 2
    BayerLayout::new(7, (3040, 6112), (3040, 6084), Packing::Raw12), // HQ
];

fn unpack_row(packing: Packing, src: &[u8], dst: &mut [u16]) {
    match packing {
        Packing::Raw10 => {
            for (group, out) in src.chunks_exact(5).zip(dst.chunks_exact_mut(4)) {
                let low = group[4];
                for k in 0..4 {
                    out[k] = ((group[k] as u16) << 2) | ((low >> (6 - 2 * k)) & 0b11) as u16;
                }
            }
        }
        Packing::Raw12 => {
            for (group, out) in src.chunks_exact(3).zip(dst.chunks_exact_mut(2)) {
                let low = group[2];
                out[0] = ((group[0] as u16) << 4) | (low & 0x0F) as u16;
                out[1] = ((group[1] as u16) << 4) | (low >> 4) as u16;
            }
        }
    }
}

/// Unpack a Bayer stream into sensor values (crop_rows x width)
pub fn unpack_bayer(bytes: &[u8], layout: &BayerLayout) -> SnowResult<Array2<u16>> {
    if bytes.len() != layout.file_size() {
        return Err(SnowError::Decode(format!(
            "Bayer layout {} expects {} bytes, got {}",
            layout.version,
            layout.file_size(),
            bytes.len()
        )));
    }

    let width = layout.width();
    let mut out = Array2::<u16>::zeros((layout.crop_rows, width));

    let unpack = |(row, mut dst): (usize, ndarray::ArrayViewMut1<u16>)| {
        let start = row * layout.row_bytes;
        let src = &bytes[start..start + layout.crop_bytes];
        if let Some(dst) = dst.as_slice_mut() {
            unpack_row(layout.packing, src, dst);
        }
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(unpack);
    }

    #[cfg(not(feature = "parallel"))]
    {
        out.axis_iter_mut(Axis(0)).enumerate().for_each(unpack);
    }

    Ok(out)
}

/// How the two green photosites of a 2x2 cell are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreenMerge {
    /// `floor((a + b) / 2)`
    FloorMean,
    /// `floor(a / 2) + floor(b / 2)`
    HalfSum,
}

impl GreenMerge {
    pub fn merge(self, a: f32, b: f32) -> f32 {
        match self {
            GreenMerge::FloorMean => ((a + b) / 2.0).floor(),
            GreenMerge::HalfSum => (a / 2.0).floor() + (b / 2.0).floor(),
        }
    }
}

/// Split a 2x2 mosaic into R, G, B at half resolution.
///
/// Red sits on odd rows/even columns, blue on even rows/odd columns;
/// the two greens are merged with `green`.
pub fn debayer(raw: ArrayView2<f32>, green: GreenMerge) -> ImageData {
    let rows = raw.nrows() / 2;
    let cols = raw.ncols() / 2;
    let mut image = Array3::<f32>::zeros((rows, cols, 3));

    let r = raw.slice(s![1..rows * 2;2, 0..cols * 2;2]);
    let g1 = raw.slice(s![0..rows * 2;2, 0..cols * 2;2]);
    let g2 = raw.slice(s![1..rows * 2;2, 1..cols * 2;2]);
    let b = raw.slice(s![0..rows * 2;2, 1..cols * 2;2]);

    image.index_axis_mut(Axis(2), 0).assign(&r);
    ndarray::Zip::from(image.index_axis_mut(Axis(2), 1))
        .and(&g1)
        .and(&g2)
        .for_each(|g, &a, &b| *g = green.merge(a, b));
    image.index_axis_mut(Axis(2), 2).assign(&b);
    image
}

/// Every `shrink`-th pixel of a single plane, as a one-channel image
pub fn preview_plane(plane: ArrayView2<f32>, shrink: usize) -> ImageData {
    let shrink = shrink.max(1);
    plane
        .slice(s![..;shrink, ..;shrink])
        .to_owned()
        .insert_axis(Axis(2))
}

/// Mean over `factor` x `factor` blocks; trailing rows/columns are dropped
pub fn bin_mean(image: &ImageData, factor: usize) -> ImageData {
    if factor <= 1 {
        return image.clone();
    }
    let (rows, cols, channels) = image.dim();
    let (out_rows, out_cols) = (rows / factor, cols / factor);
    let norm = (factor * factor) as f32;
    Array3::from_shape_fn((out_rows, out_cols, channels), |(r, c, ch)| {
        image
            .slice(s![r * factor..(r + 1) * factor, c * factor..(c + 1) * factor, ch])
            .sum()
            / norm
    })
}

/// `<name up to the last '-'>_metadata.yaml` next to the image
pub fn sidecar_path(image_path: &Path) -> Option<PathBuf> {
    let name = image_path.file_name()?.to_str()?;
    let (prefix, _) = name.rsplit_once('-')?;
    Some(image_path.with_file_name(format!("{}_metadata.yaml", prefix)))
}

/// Parse the sidecar of an image. Absent or unreadable sidecars yield `None`.
pub fn load_sidecar(image_path: &Path) -> Option<serde_yml::Value> {
    let path = sidecar_path(image_path)?;
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            log::debug!("No sidecar metadata at {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_yml::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("Ignoring invalid sidecar {}: {}", path.display(), e);
            None
        }
    }
}

/// Camera identity and capture time from the DNG root IFD
#[derive(Debug, Default)]
struct DngTags {
    serial: Option<String>,
    datetime: Option<String>,
    exposure_time: Option<f64>,
}

fn ascii_tag<R: std::io::Read + std::io::Seek>(
    decoder: &mut tiff::decoder::Decoder<R>,
    code: u16,
) -> Option<String> {
    match decoder.find_tag(tiff::tags::Tag::Unknown(code)) {
        Ok(Some(tiff::decoder::ifd::Value::Ascii(s))) => {
            let s = s.trim_end_matches('\0').trim().to_string();
            (!s.is_empty()).then_some(s)
        }
        _ => None,
    }
}

fn read_dng_tags(path: &Path) -> DngTags {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return DngTags::default(),
    };
    let mut decoder = match tiff::decoder::Decoder::new(BufReader::new(file)) {
        Ok(d) => d,
        Err(e) => {
            log::debug!("Cannot read TIFF tags of {}: {}", path.display(), e);
            return DngTags::default();
        }
    };

    let exposure_time = match decoder.find_tag(tiff::tags::Tag::Unknown(0x829A)) {
        Ok(Some(tiff::decoder::ifd::Value::Rational(n, d))) if d != 0 => Some(n as f64 / d as f64),
        _ => None,
    };

    DngTags {
        // BodySerialNumber, then the DNG CameraSerialNumber
        serial: ascii_tag(&mut decoder, 0xA431).or_else(|| ascii_tag(&mut decoder, 0xC62F)),
        // DateTimeOriginal, then DateTime
        datetime: ascii_tag(&mut decoder, 0x9003).or_else(|| ascii_tag(&mut decoder, 0x0132)),
        exposure_time,
    }
}

/// Decoder for raw snow images
pub struct RawReader {
    path: PathBuf,
    format: RawFormat,
}

impl RawReader {
    pub fn new<P: AsRef<Path>>(path: P) -> SnowResult<Self> {
        let path = path.as_ref().to_path_buf();
        let format = RawFormat::from_path(&path)?;
        Ok(Self { path, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> RawFormat {
        self.format
    }

    /// Full decode: half-resolution RGB normalised to the sensor full scale
    pub fn read(&self) -> SnowResult<(ImageData, CaptureInfo)> {
        log::debug!("Loading {:?} image {}", self.format, self.path.display());
        let (image, mut capture) = match self.format {
            RawFormat::Bayer => self.read_bayer()?,
            RawFormat::Dng => self.read_dng()?,
        };
        capture.sidecar = load_sidecar(&self.path);
        Ok((image, capture))
    }

    /// Fast single-channel decode, same array type as `read`
    pub fn read_preview(&self, shrink: usize) -> SnowResult<ImageData> {
        match self.format {
            RawFormat::Bayer => {
                let (image, _) = self.read_bayer()?;
                Ok(preview_plane(image.index_axis(Axis(2), 0), shrink))
            }
            RawFormat::Dng => {
                let (image, _) = self.read_dng()?;
                let gray = image.mean_axis(Axis(2)).ok_or_else(|| {
                    SnowError::Decode(format!("Empty image in {}", self.path.display()))
                })?;
                Ok(preview_plane(gray.view(), shrink))
            }
        }
    }

    fn read_bayer(&self) -> SnowResult<(ImageData, CaptureInfo)> {
        let bytes = std::fs::read(&self.path)?;
        let layout = BayerLayout::for_file_size(bytes.len()).ok_or_else(|| {
            SnowError::Decode(format!(
                "{}: {} bytes does not match any known Bayer layout",
                self.path.display(),
                bytes.len()
            ))
        })?;
        log::debug!(
            "Bayer layout {} ({}x{}, {:?})",
            layout.version,
            layout.crop_rows,
            layout.width(),
            layout.packing
        );

        let raw = unpack_bayer(&bytes, layout)?.mapv(|v| v as f32);
        let scale = layout.packing.full_scale();
        let image = debayer(raw.view(), GreenMerge::FloorMean).mapv_into(|v| v / scale);

        let capture = CaptureInfo {
            white_level: Some(scale as u16),
            black_level: Some(0),
            ..Default::default()
        };
        Ok((image, capture))
    }

    fn read_dng(&self) -> SnowResult<(ImageData, CaptureInfo)> {
        let raw = rawloader::decode_file(&self.path)
            .map_err(|e| SnowError::Decode(format!("{}: {}", self.path.display(), e)))?;

        if raw.cpp != 1 {
            return Err(SnowError::Decode(format!(
                "{}: expected a Bayer mosaic, found {} components per pixel",
                self.path.display(),
                raw.cpp
            )));
        }

        let values: Vec<f32> = match &raw.data {
            rawloader::RawImageData::Integer(data) => data.iter().map(|&v| v as f32).collect(),
            rawloader::RawImageData::Float(data) => data.clone(),
        };
        let mosaic = Array2::from_shape_vec((raw.height, raw.width), values)
            .map_err(|e| SnowError::Decode(format!("{}: {}", self.path.display(), e)))?;

        let white_level = raw.whitelevels[0].max(1);
        let image = bin_mean(&debayer(mosaic.view(), GreenMerge::HalfSum), 2)
            .mapv_into(|v| v / white_level as f32);

        let tags = read_dng_tags(&self.path);
        let capture = CaptureInfo {
            make: Some(raw.clean_make.clone()),
            model: Some(raw.clean_model.clone()),
            body_serial: tags.serial,
            datetime_original: tags.datetime,
            exposure_time: tags.exposure_time,
            black_level: Some(raw.blacklevels[0]),
            white_level: Some(white_level),
            sidecar: None,
        };
        Ok((image, capture))
    }
}
