use crate::io::database::MetadataDatabase;
use crate::types::{ImageId, ImageMetadata, ImageType};
use std::collections::BTreeMap;

/// Flat-field partners of one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkEntry {
    /// Dark frame of the same dark and measurement group
    pub dark_id: Option<ImageId>,
    /// Reference frame of the same reference and measurement group
    pub ref_id: Option<ImageId>,
}

/// Mapping from each image to its dark and reference partners
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkTable {
    entries: BTreeMap<ImageId, LinkEntry>,
}

impl LinkTable {
    /// Derive the table from the database.
    ///
    /// Nothing is linked while the set has no reference frame. Lit frames
    /// get a dark partner; lit and dark non-reference frames get a
    /// reference partner. When several candidates qualify the lowest ID is
    /// taken.
    pub fn build(db: &MetadataDatabase) -> Self {
        let mut table = Self::default();
        if !db.records().any(|m| m.is_reference()) {
            log::debug!("No reference image in the set; link table left empty");
            return table;
        }

        for meta in db.records() {
            let mut entry = LinkEntry::default();

            if !meta.is_dark() {
                entry.dark_id = pick(meta, "dark", db.records().filter(|other| {
                    other.id != meta.id
                        && other.is_dark()
                        && other.drk_group == meta.drk_group
                        && other.meas_group == meta.meas_group
                }));
            }

            if meta.img_type != ImageType::Reference {
                entry.ref_id = pick(meta, "reference", db.records().filter(|other| {
                    other.is_reference()
                        && !other.is_dark()
                        && other.ref_group == meta.ref_group
                        && other.meas_group == meta.meas_group
                }));
            }

            table.entries.insert(meta.id, entry);
        }
        log::debug!("Link table built for {} images", table.entries.len());
        table
    }

    pub fn get(&self, id: ImageId) -> Option<&LinkEntry> {
        self.entries.get(&id)
    }

    pub fn dark_id(&self, id: ImageId) -> Option<ImageId> {
        self.get(id).and_then(|e| e.dark_id)
    }

    pub fn ref_id(&self, id: ImageId) -> Option<ImageId> {
        self.get(id).and_then(|e| e.ref_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageId, &LinkEntry)> {
        self.entries.iter()
    }
}

/// First candidate by ID; candidates arrive in ascending ID order
fn pick<'a>(
    meta: &ImageMetadata,
    role: &str,
    mut candidates: impl Iterator<Item = &'a ImageMetadata>,
) -> Option<ImageId> {
    let first = candidates.next()?.id;
    let others: Vec<ImageId> = candidates.map(|m| m.id).collect();
    if !others.is_empty() {
        log::warn!(
            "Image {} has {} {} candidates; using {}",
            meta.id,
            others.len() + 1,
            role,
            first
        );
    }
    Some(first)
}
