use crate::io::literal::{
    format_float, format_float_list, format_nested_float_list, format_roi, parse_float_pair,
    parse_float_list, parse_literal, parse_nested_float_list, parse_roi, Literal,
};
use crate::types::{ImageId, ImageMetadata, RoiBox, SnowError, SnowResult};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Persisted column order
pub const FIELD_NAMES: [&str; 19] = [
    "filepath",
    "ID",
    "img_type",
    "wavelength",
    "drk_group",
    "ref_group",
    "meas_group",
    "location",
    "date",
    "stack",
    "ROI",
    "coords_pix",
    "coords_mm",
    "px_2_mm",
    "stitch_at_mm",
    "affine_points",
    "trafo_points",
    "aux_data",
    "comment",
];

// Columns that are always written inside quotes
const QUOTED_FIELDS: [&str; 8] = [
    "meas_group",
    "ROI",
    "coords_pix",
    "coords_mm",
    "stitch_at_mm",
    "affine_points",
    "trafo_points",
    "aux_data",
];

/// Extensions picked up when scanning directories for raw frames
pub const RAW_EXTENSIONS: [&str; 2] = ["bay", "dng"];

/// Fresh random 32-bit record ID
pub fn new_image_id() -> ImageId {
    (uuid::Uuid::new_v4().as_u128() & 0xFFFF_FFFF) as ImageId
}

/// Textual value of a field, as written to the database
pub fn field_text(meta: &ImageMetadata, field: &str) -> SnowResult<String> {
    let text = match field {
        "filepath" => meta.filepath.display().to_string(),
        "ID" => meta.id.to_string(),
        "img_type" => meta.img_type.to_string(),
        "wavelength" => format_float(meta.wavelength),
        "drk_group" => meta.drk_group.to_string(),
        "ref_group" => meta.ref_group.to_string(),
        "meas_group" => meta.meas_group.clone(),
        "location" => meta.location.clone(),
        "date" => meta.date.clone(),
        "stack" => meta.stack.clone(),
        "ROI" => format_roi(&meta.roi),
        "coords_pix" => format_float_list(&meta.coords_pix),
        "coords_mm" => format_float_list(&meta.coords_mm),
        "px_2_mm" => format_float(meta.px_2_mm),
        "stitch_at_mm" => format_float_list(&meta.stitch_at_mm),
        "affine_points" => format_nested_float_list(&meta.affine_points),
        "trafo_points" => format_nested_float_list(&meta.trafo_points),
        "aux_data" => meta.aux_data.clone(),
        "comment" => meta.comment.clone(),
        other => return Err(SnowError::Parse(format!("Unknown metadata field: {}", other))),
    };
    Ok(text)
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> SnowResult<T> {
    let trimmed = value.trim();
    trimmed
        .parse::<T>()
        .or_else(|_| {
            // integer columns written by spreadsheet tools as "3.0"
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.fract() == 0.0)
                .and_then(|v| format!("{}", v as i64).parse::<T>().ok())
                .ok_or(())
        })
        .map_err(|_| SnowError::Parse(format!("Invalid value {:?} for field {}", value, field)))
}

/// Set a field from its textual value
pub fn set_field(meta: &mut ImageMetadata, field: &str, value: &str) -> SnowResult<()> {
    match field {
        "filepath" => meta.filepath = PathBuf::from(value),
        "ID" => meta.id = parse_number(field, value)?,
        "img_type" => meta.img_type = value.parse()?,
        "wavelength" => meta.wavelength = parse_number(field, value)?,
        "drk_group" => meta.drk_group = parse_number(field, value)?,
        "ref_group" => meta.ref_group = parse_number(field, value)?,
        "meas_group" => meta.meas_group = value.trim().to_string(),
        "location" => meta.location = value.to_string(),
        "date" => meta.date = value.to_string(),
        "stack" => meta.stack = value.to_string(),
        "ROI" => meta.roi = parse_roi(value)?,
        "coords_pix" => meta.coords_pix = parse_float_pair(value)?,
        "coords_mm" => meta.coords_mm = parse_float_pair(value)?,
        "px_2_mm" => meta.px_2_mm = parse_number(field, value)?,
        "stitch_at_mm" => meta.stitch_at_mm = parse_float_list(value)?,
        "affine_points" => meta.affine_points = parse_nested_float_list(value)?,
        "trafo_points" => meta.trafo_points = parse_nested_float_list(value)?,
        "aux_data" => meta.aux_data = value.to_string(),
        "comment" => meta.comment = value.to_string(),
        other => return Err(SnowError::Parse(format!("Unknown metadata field: {}", other))),
    }
    Ok(())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// One database row, without line terminator
pub fn format_record(meta: &ImageMetadata) -> SnowResult<String> {
    let mut cells = Vec::with_capacity(FIELD_NAMES.len());
    for field in FIELD_NAMES {
        let text = field_text(meta, field)?;
        if QUOTED_FIELDS.contains(&field) || text.contains([',', '"', '\n']) {
            cells.push(quote(&text));
        } else {
            cells.push(text);
        }
    }
    Ok(cells.join(","))
}

/// Split one CSV row into cells, honouring double-quoted cells
pub fn split_record(line: &str) -> SnowResult<Vec<String>> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => cells.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    if in_quotes {
        return Err(SnowError::Parse(format!("Unterminated quote in row: {}", line)));
    }
    cells.push(current);
    Ok(cells)
}

/// Split CSV text into rows; line breaks inside quoted cells stay in the row
pub fn split_rows(text: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => rows.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        rows.push(current);
    }
    rows
}

/// Metadata records parsed from CSV text
pub fn parse_database(text: &str) -> SnowResult<Vec<ImageMetadata>> {
    let rows = split_rows(text);
    let mut lines = rows.iter().map(String::as_str).filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(h) => split_record(h.trim_start_matches('\u{feff}'))?,
        None => return Ok(Vec::new()),
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    if !header.iter().any(|h| h == "ID") {
        return Err(SnowError::Parse("Database header has no ID column".to_string()));
    }
    for name in &header {
        if !FIELD_NAMES.contains(&name.as_str()) {
            log::warn!("Ignoring unknown database column: {}", name);
        }
    }

    let mut records = Vec::new();
    for (row_idx, line) in lines.enumerate() {
        let cells = split_record(line)?;
        if cells.len() != header.len() {
            return Err(SnowError::Parse(format!(
                "Row {} has {} cells, header has {}",
                row_idx + 1,
                cells.len(),
                header.len()
            )));
        }
        let mut meta = ImageMetadata::default();
        for (name, value) in header.iter().zip(cells.iter()) {
            if FIELD_NAMES.contains(&name.as_str()) {
                set_field(&mut meta, name, value)?;
            }
        }
        records.push(meta);
    }
    Ok(records)
}

/// Replace every record whose `meas_group` is a list by one record per group
pub fn expand_by_meas_group(records: Vec<ImageMetadata>) -> SnowResult<Vec<ImageMetadata>> {
    let mut out = Vec::with_capacity(records.len());
    for meta in records {
        if !meta.meas_group.trim_start().starts_with('[') {
            out.push(meta);
            continue;
        }
        let groups = match parse_literal(&meta.meas_group)? {
            Literal::List(items) => items,
            other => vec![other],
        };
        for group in groups {
            let mut entry = meta.clone();
            entry.meas_group = match group {
                Literal::Int(v) => v.to_string(),
                Literal::Float(v) => format_float(v),
                Literal::List(_) => {
                    return Err(SnowError::Parse(format!(
                        "Nested measurement group in {:?}",
                        meta.meas_group
                    )))
                }
            };
            entry.id = new_image_id();
            log::debug!(
                "Expanded image {} into measurement group {} as {}",
                meta.id,
                entry.meas_group,
                entry.id
            );
            out.push(entry);
        }
    }
    Ok(out)
}

/// Recursively find raw frames (`.bay`, `.dng`, any case) below a directory
pub fn scan_for_images(dir: &Path) -> SnowResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| RAW_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// The metadata table of one survey
#[derive(Debug, Clone, Default)]
pub struct MetadataDatabase {
    path: Option<PathBuf>,
    records: BTreeMap<ImageId, ImageMetadata>,
}

impl MetadataDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ImageMetadata>) -> Self {
        let mut db = Self::new();
        for meta in records {
            if db.records.insert(meta.id, meta).is_some() {
                log::warn!("Duplicate image ID in database; keeping the last record");
            }
        }
        db
    }

    /// Load a database file and expand multi-group records
    pub fn load(path: &Path) -> SnowResult<Self> {
        log::info!("Loading metadata database from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let records = expand_by_meas_group(parse_database(&text)?)?;
        let mut db = Self::from_records(records);
        db.path = Some(path.to_path_buf());
        log::info!("Loaded {} image records", db.len());
        Ok(db)
    }

    /// Write the table to `path`, or back to the file it was loaded from.
    ///
    /// An existing file is first copied to `<name>.bak`.
    pub fn save(&mut self, path: Option<&Path>) -> SnowResult<PathBuf> {
        let target = match path.or(self.path.as_deref()) {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(SnowError::Processing(
                    "No database path to save to".to_string(),
                ))
            }
        };

        if target.exists() {
            let backup = backup_path(&target);
            std::fs::copy(&target, &backup)?;
            log::debug!("Backed up {} to {}", target.display(), backup.display());
        }

        let mut text = FIELD_NAMES.join(",");
        text.push('\n');
        for meta in self.records.values() {
            text.push_str(&format_record(meta)?);
            text.push('\n');
        }
        std::fs::write(&target, text)?;

        log::info!("Saved {} records to {}", self.records.len(), target.display());
        self.path = Some(target.clone());
        Ok(target)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: ImageId) -> Option<&ImageMetadata> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ImageId) -> Option<&mut ImageMetadata> {
        self.records.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ImageId> {
        self.records.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &ImageMetadata> {
        self.records.values()
    }

    pub fn insert(&mut self, meta: ImageMetadata) -> Option<ImageMetadata> {
        self.records.insert(meta.id, meta)
    }

    pub fn remove(&mut self, id: ImageId) -> Option<ImageMetadata> {
        self.records.remove(&id)
    }

    /// Add default records for all raw frames below `dir`; returns their IDs
    pub fn add_images_from_dir(&mut self, dir: &Path) -> SnowResult<Vec<ImageId>> {
        let files = scan_for_images(dir)?;
        log::info!("Found {} raw images in {}", files.len(), dir.display());
        let mut added = Vec::with_capacity(files.len());
        for filepath in files {
            let mut id = new_image_id();
            while self.records.contains_key(&id) {
                id = new_image_id();
            }
            self.records.insert(id, ImageMetadata::with_path(id, filepath));
            added.push(id);
        }
        Ok(added)
    }

    /// Copy the named fields of `source` onto every target record
    pub fn copy_fields(
        &mut self,
        source: ImageId,
        fields: &[&str],
        targets: &[ImageId],
    ) -> SnowResult<()> {
        let src = self
            .records
            .get(&source)
            .ok_or_else(|| SnowError::Processing(format!("No image with ID {}", source)))?;
        let clipboard: Vec<(&str, String)> = fields
            .iter()
            .map(|f| field_text(src, f).map(|v| (*f, v)))
            .collect::<SnowResult<_>>()?;

        for target in targets {
            let meta = self
                .records
                .get_mut(target)
                .ok_or_else(|| SnowError::Processing(format!("No image with ID {}", target)))?;
            for (field, value) in &clipboard {
                if *field == "ID" {
                    continue;
                }
                set_field(meta, field, value)?;
            }
        }
        Ok(())
    }

    /// Update one field of the given records from its textual value
    pub fn update_field(&mut self, ids: &[ImageId], field: &str, value: &str) -> SnowResult<()> {
        if field == "ID" {
            return Err(SnowError::Processing("Image IDs cannot be edited".to_string()));
        }
        for id in ids {
            let meta = self
                .records
                .get_mut(id)
                .ok_or_else(|| SnowError::Processing(format!("No image with ID {}", id)))?;
            set_field(meta, field, value)?;
        }
        Ok(())
    }

    /// Append one placeholder gray and one white target box
    pub fn add_default_roi(&mut self, id: ImageId) -> SnowResult<()> {
        let meta = self
            .records
            .get_mut(&id)
            .ok_or_else(|| SnowError::Processing(format!("No image with ID {}", id)))?;
        meta.roi.gray.push(RoiBox::new(0.5, 0.5, 0.6, 0.6));
        meta.roi.white.push(RoiBox::new(0.3, 0.3, 0.4, 0.4));
        Ok(())
    }

    /// True when every ID is unique. Keys are unique by construction, so
    /// this checks the records' own `id` against their key.
    pub fn check_ids(&self) -> bool {
        let mut seen = HashSet::new();
        let ok = self
            .records
            .iter()
            .all(|(key, meta)| *key == meta.id && seen.insert(meta.id));
        if ok {
            log::info!("Image IDs are unique");
        } else {
            log::warn!("Image IDs are not unique");
        }
        ok
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageType;

    #[test]
    fn test_split_record_quotes() {
        let cells = split_record(r#"a,"[1, 2]",,"say ""hi""""#).unwrap();
        assert_eq!(cells, vec!["a", "[1, 2]", "", r#"say "hi""#]);
        assert!(split_record(r#"a,"open"#).is_err());
    }

    #[test]
    fn test_split_rows_keeps_quoted_line_breaks() {
        let rows = split_rows("h1,h2\r\na,\"one\ntwo\"\nb,c\n");
        assert_eq!(rows, vec!["h1,h2", "a,\"one\ntwo\"", "b,c"]);
    }

    #[test]
    fn test_format_record_quoting() {
        let meta = ImageMetadata {
            id: 7,
            comment: "a, b".to_string(),
            ..Default::default()
        };
        let row = format_record(&meta).unwrap();
        assert!(row.starts_with(",7,ngr,0.0,0,0,\"0\",test,2024-01-01,vert,\"[[[["));
        assert!(row.ends_with(",\"[]\",\"[[]]\",\"[[]]\",\"[]\",\"a, b\""));
    }

    #[test]
    fn test_parse_database_with_reordered_columns() {
        let text = "ID,img_type,wavelength,coords_mm\n12,ref,940.0,\"[1.5, -2.0]\"\n";
        let records = parse_database(text).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 12);
        assert_eq!(records[0].img_type, ImageType::Reference);
        assert_eq!(records[0].coords_mm, [1.5, -2.0]);
        assert_eq!(records[0].location, "test");
    }

    #[test]
    fn test_parse_database_requires_id() {
        assert!(parse_database("filepath,comment\na,b\n").is_err());
    }

    #[test]
    fn test_bad_literal_is_parse_error() {
        let text = "ID,coords_pix\n1,\"[0.5, x]\"\n";
        assert!(matches!(parse_database(text), Err(SnowError::Parse(_))));
    }

    #[test]
    fn test_expand_by_meas_group() {
        let meta = ImageMetadata {
            id: 1,
            meas_group: "[1, 2, 3]".to_string(),
            ..Default::default()
        };
        let single = ImageMetadata {
            id: 2,
            ..Default::default()
        };
        let out = expand_by_meas_group(vec![meta, single]).unwrap();
        assert_eq!(out.len(), 4);
        let groups: Vec<&str> = out.iter().map(|m| m.meas_group.as_str()).collect();
        assert_eq!(groups, vec!["1", "2", "3", "0"]);
        assert_ne!(out[0].id, out[1].id);
        assert_eq!(out[3].id, 2);
    }

    #[test]
    fn test_copy_and_update_fields() {
        let mut db = MetadataDatabase::from_records(vec![
            ImageMetadata {
                id: 1,
                location: "Davos".to_string(),
                px_2_mm: 0.25,
                ..Default::default()
            },
            ImageMetadata {
                id: 2,
                ..Default::default()
            },
        ]);
        db.copy_fields(1, &["location", "px_2_mm", "ID"], &[2]).unwrap();
        assert_eq!(db.get(2).unwrap().location, "Davos");
        assert_eq!(db.get(2).unwrap().px_2_mm, 0.25);
        assert_eq!(db.get(2).unwrap().id, 2);

        db.update_field(&[1, 2], "drk_group", "3").unwrap();
        assert_eq!(db.get(1).unwrap().drk_group, 3);
        assert!(db.update_field(&[1], "ID", "5").is_err());
        assert!(db.update_field(&[1], "wavelength", "blue").is_err());
        assert!(db.check_ids());
    }

    #[test]
    fn test_add_default_roi() {
        let mut db = MetadataDatabase::from_records(vec![ImageMetadata::default()]);
        db.add_default_roi(0).unwrap();
        let roi = &db.get(0).unwrap().roi;
        assert_eq!(roi.gray.len(), 4);
        assert_eq!(roi.white.last(), Some(&RoiBox::new(0.3, 0.3, 0.4, 0.4)));
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(backup_path(Path::new("/a/db.csv")), PathBuf::from("/a/db.csv.bak"));
    }
}
