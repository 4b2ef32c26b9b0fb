use snowimager::{ImageMetadata, ImageType, MetadataDatabase, RoiBox};

fn sample_records() -> Vec<ImageMetadata> {
    let mut lit = ImageMetadata::with_path(11, "pit/top-0001.bay");
    lit.wavelength = 940.0;
    lit.drk_group = 2;
    lit.ref_group = 1;
    lit.meas_group = "3".to_string();
    lit.coords_mm = [12.5, -40.0];
    lit.px_2_mm = 0.1234;
    lit.stitch_at_mm = vec![150.0, 310.5];
    lit.comment = "wind crust, see notes".to_string();

    let mut grid = ImageMetadata::with_path(12, "pit/bottom-0002.dng");
    grid.img_type = ImageType::Grid;
    grid.wavelength = 1310.0;
    grid.roi.gray.push(RoiBox::new(0.5, 0.5, 0.6, 0.6));
    grid.affine_points = vec![vec![1.0, 2.0], vec![3.5, 4.25]];
    grid.comment = "says \"check\"".to_string();

    let dark = ImageMetadata::with_path(13, "pit/top-0003.bay");
    vec![lit, grid, dark]
}

#[test]
fn test_save_load_save_is_stable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");

    let mut db = MetadataDatabase::from_records(sample_records());
    db.save(Some(&first)).expect("Failed to save database");

    let mut loaded = MetadataDatabase::load(&first).expect("Failed to load database");
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.get(11), sample_records().first());
    assert_eq!(loaded.get(12).map(|m| m.comment.as_str()), Some("says \"check\""));
    loaded.save(Some(&second)).expect("Failed to save database again");

    let a = std::fs::read_to_string(&first).expect("Failed to read first file");
    let b = std::fs::read_to_string(&second).expect("Failed to read second file");
    println!("{}", a);
    assert_eq!(a, b);
    assert!(a.starts_with("filepath,ID,img_type,wavelength,"));
}

#[test]
fn test_save_keeps_backup() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("db.csv");
    let mut db = MetadataDatabase::from_records(sample_records());
    db.save(Some(&path)).expect("Failed to save database");
    let before = std::fs::read_to_string(&path).expect("Failed to read database");

    db.update_field(&[13], "location", "weissfluhjoch").expect("Failed to update field");
    db.save(None).expect("Failed to save database in place");
    let backup = std::fs::read_to_string(dir.path().join("db.csv.bak")).expect("Failed to read backup");
    assert_eq!(backup, before);
    assert!(std::fs::read_to_string(&path)
        .expect("Failed to read database")
        .contains("weissfluhjoch"));
}

#[test]
fn test_measurement_group_list_expands() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("db.csv");
    let mut reference = ImageMetadata::with_path(21, "ref-0001.bay");
    reference.img_type = ImageType::Reference;
    reference.wavelength = 940.0;
    reference.meas_group = "[1, 2, 5]".to_string();
    let mut db = MetadataDatabase::from_records(vec![reference]);
    db.save(Some(&path)).expect("Failed to save database");

    let loaded = MetadataDatabase::load(&path).expect("Failed to load database");
    assert_eq!(loaded.len(), 3);
    let mut groups: Vec<String> = loaded.records().map(|m| m.meas_group.clone()).collect();
    groups.sort();
    assert_eq!(groups, vec!["1", "2", "5"]);
    assert!(loaded.records().all(|m| m.img_type == ImageType::Reference));
    assert!(loaded.check_ids());
}

#[test]
fn test_add_images_and_copy_fields() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    std::fs::create_dir_all(dir.path().join("day1")).expect("Failed to create dir");
    for name in ["day1/a-0001.bay", "day1/a-0002.DNG", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"x").expect("Failed to write file");
    }

    let mut db = MetadataDatabase::from_records(sample_records());
    let added = db.add_images_from_dir(dir.path()).expect("Failed to scan directory");
    assert_eq!(added.len(), 2);
    assert_eq!(db.len(), 5);

    db.copy_fields(11, &["ID", "wavelength", "coords_mm", "comment"], &added)
        .expect("Failed to copy fields");
    for id in &added {
        let meta = db.get(*id).expect("Missing added record");
        assert_eq!(meta.id, *id);
        assert_eq!(meta.wavelength, 940.0);
        assert_eq!(meta.coords_mm, [12.5, -40.0]);
        assert_eq!(meta.comment, "wind crust, see notes");
    }
    assert!(db.update_field(&[11], "ID", "5").is_err());
}

#[test]
fn test_multi_line_comment_survives_reload() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");

    let mut record = ImageMetadata::with_path(1, "a-0001.bay");
    record.comment = "line one\nline two, with \"quotes\"".to_string();
    record.location = "Davos\nWeissfluhjoch".to_string();
    let mut db = MetadataDatabase::from_records(vec![record.clone(), ImageMetadata::with_path(2, "a-0002.bay")]);
    db.save(Some(&first)).expect("Failed to save database");

    let mut loaded = MetadataDatabase::load(&first).expect("Failed to load database");
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get(1), Some(&record));
    loaded.save(Some(&second)).expect("Failed to save database again");
    assert_eq!(
        std::fs::read_to_string(&first).expect("Failed to read first file"),
        std::fs::read_to_string(&second).expect("Failed to read second file")
    );
}
