use approx::assert_abs_diff_eq;
use ndarray::Array3;
use snowimager::core::stitching::{relative_positions, StitchParams, Stitcher};
use snowimager::{Image, ImageMetadata, ImageType};

fn frame(id: u64, img_type: ImageType, value: f32, coords_mm: [f64; 2], shape: (usize, usize)) -> Image {
    let meta = ImageMetadata {
        id,
        img_type,
        coords_pix: [0.0, 0.0],
        coords_mm,
        px_2_mm: 0.5,
        ..Default::default()
    };
    Image::new(meta, Array3::from_elem((shape.0, shape.1, 3), value))
}

fn fast_params() -> StitchParams {
    StitchParams {
        sigma_x: 10.0,
        sigma_y: 10.0,
        mask_downscale: 2,
        pyramid_levels: 3,
        debug_seams: false,
    }
}

#[test]
fn test_relative_positions_have_zero_minimum() {
    let frames = [
        frame(1, ImageType::NoGrid, 0.5, [12.5, 40.0], (10, 10)),
        frame(2, ImageType::NoGrid, 0.5, [-3.0, 41.5], (10, 10)),
        frame(3, ImageType::NoGrid, 0.5, [7.0, 55.0], (10, 10)),
    ];
    let refs: Vec<&Image> = frames.iter().collect();
    let (min, relative) = relative_positions(&refs);
    assert_eq!(min, [-3.0, 40.0]);
    let min_x = relative.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
    let min_y = relative.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
    assert_eq!(min_x, 0.0);
    assert_eq!(min_y, 0.0);
    assert!(relative.iter().all(|p| p[0] >= 0.0 && p[1] >= 0.0));
}

#[test]
fn test_single_frame_composite_equals_gray() {
    let mut image = frame(7, ImageType::Grid, 0.0, [0.0, 0.0], (12, 16));
    image.data = Array3::from_shape_fn((12, 16, 3), |(r, c, ch)| (r + c + ch) as f32 / 40.0);

    let stitched = Stitcher::with_params(fast_params())
        .stitch_group(ImageType::Grid, &[&image])
        .expect("Failed to stitch a single frame");
    assert_eq!(stitched.data, image.to_gray().expect("Failed to convert to gray"));
    assert_eq!(stitched.meta.img_type, ImageType::Grid);
    assert_eq!(stitched.meta.px_2_mm, 0.5);
}

#[test]
fn test_offset_frames_cover_bounding_box() {
    // 20 mm right and 10 mm up at 0.5 mm/px -> 40 columns, 20 rows
    let a = frame(1, ImageType::NoGrid, 0.6, [0.0, 0.0], (60, 80));
    let b = frame(2, ImageType::NoGrid, 0.6, [20.0, 10.0], (60, 80));

    let stitched = Stitcher::with_params(fast_params())
        .stitch_group(ImageType::NoGrid, &[&a, &b])
        .expect("Failed to stitch two frames");
    println!("Composite shape: {:?}", stitched.data.dim());
    assert_eq!(stitched.data.dim(), (80, 120));
    assert_eq!(stitched.meta.coords_mm, [0.0, 0.0]);

    // corners covered by one frame only keep its value
    assert_abs_diff_eq!(stitched.data[[75, 5]], 0.6, epsilon = 1e-3);
    assert_abs_diff_eq!(stitched.data[[5, 115]], 0.6, epsilon = 1e-3);
    // corners covered by neither stay empty
    assert_abs_diff_eq!(stitched.data[[5, 5]], 0.0, epsilon = 1e-3);
    assert_abs_diff_eq!(stitched.data[[75, 115]], 0.0, epsilon = 1e-3);
}
