use approx::assert_relative_eq;
use ndarray::Array2;
use snowimager::core::image::{FrameRecord, StitchedMetadata};
use snowimager::core::ssa::SsaModel;
use snowimager::io::RefractiveIndexTable;
use snowimager::{
    AnalysisConfig, CaptureInfo, ImageMetadata, ImageType, Plane, SnowError, SnowProfileAnalysis,
    StitchedImage,
};

const SLITS: [(usize, usize); 4] = [(80, 100), (150, 170), (220, 240), (290, 310)];

fn no_grid() -> Plane {
    Array2::from_elem((200, 400), 0.7)
}

fn grid() -> Plane {
    Array2::from_shape_fn((200, 400), |(_, c)| {
        if SLITS.iter().any(|&(lo, hi)| c >= lo && c <= hi) {
            0.6
        } else {
            0.05
        }
    })
}

fn stitched(img_type: ImageType, data: Plane, wavelength: f64) -> StitchedImage {
    let frame = FrameRecord {
        meta: ImageMetadata {
            id: 1,
            img_type,
            wavelength,
            px_2_mm: 1.0,
            ..Default::default()
        },
        capture: CaptureInfo::default(),
    };
    let meta = StitchedMetadata::from_frames(img_type, vec![frame], [0.0, 0.0])
        .expect("Failed to build composite metadata");
    StitchedImage { meta, data }
}

#[test]
fn test_ssa_and_density_profiles() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = AnalysisConfig::default();
    let mut analysis = SnowProfileAnalysis::new(no_grid(), Some(grid()), 1.0, 940.0, config.clone());

    let expected_ssa = SsaModel::from_table(940.0, &RefractiveIndexTable::builtin(), 45.0)
        .expect("Failed to build SSA model")
        .ssa(0.7);
    let ssa = analysis.calculate_ssa().expect("Failed to calculate SSA");
    println!("SSA at row 100: {}", ssa.profile[100]);
    assert_eq!(ssa.profile.len(), 200);
    assert!(ssa.profile[10].is_nan());
    assert_relative_eq!(ssa.profile[100] as f64, expected_ssa, max_relative = 1e-4);

    let density = analysis
        .calculate_density()
        .expect("Failed to calculate density")
        .clone();
    assert_eq!(density.slits.len(), 4);
    assert_eq!(density.profiles.len(), 4);
    for (slit, &(lo, hi)) in density.slits.iter().zip(SLITS.iter()) {
        assert!(slit.center > lo as f64 && slit.center < hi as f64 + 1.0);
    }
    for profile in &density.profiles {
        let mid = profile[100];
        println!("Ice-volume fraction at row 100: {}", mid);
        assert!(mid.is_finite() && mid > 0.0 && mid < 1.0);
    }
    // narrower slits of the same reflectance give denser snow
    assert!(density.profiles[2][100] > density.profiles[0][100]);

    let table = analysis.report_table().expect("Failed to build report table");
    assert_eq!(
        table.headers,
        vec![
            "index",
            "Height",
            "SSA",
            "Ice-volume fraction",
            "Ice-volume fraction",
            "Ice-volume fraction",
            "Ice-volume fraction"
        ]
    );
    assert_eq!(table.len(), 200);
    let row = table.row(100).expect("Missing row 100");
    assert_eq!(row[1], 100.0);
    assert_eq!(row[3], density.profiles[0][99]);
}

#[test]
fn test_density_rejects_mismatched_shapes() {
    let mut analysis = SnowProfileAnalysis::new(
        no_grid(),
        Some(Array2::from_elem((200, 390), 0.3)),
        1.0,
        940.0,
        AnalysisConfig::default(),
    );
    assert!(matches!(analysis.calculate_density(), Err(SnowError::Analysis(_))));
}

#[test]
fn test_from_stitched_falls_back_to_default_wavelength() {
    let config = AnalysisConfig {
        default_wavelength_nm: 960.0,
        ..Default::default()
    };
    let ngr = stitched(ImageType::NoGrid, no_grid(), 0.0);
    let gri = stitched(ImageType::Grid, grid(), 0.0);
    let analysis = SnowProfileAnalysis::from_stitched(&ngr, Some(&gri), config.clone())
        .expect("Failed to create analysis");
    assert_eq!(analysis.wavelength_nm(), 960.0);
    assert!(analysis.has_grid());

    assert!(SnowProfileAnalysis::from_stitched(&gri, None, config).is_err());
}

#[cfg(feature = "hdf5")]
#[test]
fn test_analysis_from_exported_file() {
    use snowimager::io::export::write_exports;
    use snowimager::StitchedExport;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("2024-02-01_davos").join("processedOn_20240305_1407.h5");

    let mut ngr = StitchedExport::from_stitched(&stitched(ImageType::NoGrid, no_grid(), 940.0));
    ngr.aux.insert("wavelength".to_string(), "940nm".to_string());
    let gri = StitchedExport::from_stitched(&stitched(ImageType::Grid, grid(), 940.0));
    write_exports(&path, &[ngr, gri]).expect("Failed to write export");

    let mut analysis = SnowProfileAnalysis::from_file(&path, AnalysisConfig::default())
        .expect("Failed to read export");
    assert_eq!(analysis.wavelength_nm(), 940.0);
    assert!(analysis.has_grid());
    // 0.7 * 1023 truncates to 716, read back over 1024
    let ssa = analysis.calculate_ssa().expect("Failed to calculate SSA");
    assert!(ssa.profile[100].is_finite());
    assert_eq!(
        analysis.calculate_density().expect("Failed to calculate density").profiles.len(),
        4
    );
}
