//! Label registry — named independent snapshot chains.
//!
//! Labels let several backup histories (different machines, different
//! configurations) share one library and its dedup pool without
//! intermingling.  The registry rides in descriptor 1 of every closing
//! volume; opening a library rebuilds it from the highest non-cancelled
//! volume.

use std::collections::BTreeMap;

/// Id reserved to mean "allocate a fresh id on write".
pub const LABEL_ID_ALLOCATE: u64 = 0;
/// Id of the built-in "Default" label.
pub const LABEL_ID_DEFAULT: u64 = 1;
/// Name of the built-in default label.
pub const DEFAULT_LABEL_NAME: &str = "Default";

/// One label: a name plus the location of its most recent snapshot's
/// descriptor 2.  A zero offset/volume pair means the label has no
/// snapshots yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: u64,
    pub name: String,
    pub last_backup_offset: u64,
    pub last_backup_volume: u64,
}

impl Label {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), last_backup_offset: 0, last_backup_volume: 0 }
    }
}

/// Registry keyed by id.  A `BTreeMap` keeps descriptor 1 output ordered
/// and deterministic.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    labels: BTreeMap<u64, Label>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&Label> {
        self.labels.get(&id)
    }

    pub fn insert(&mut self, label: Label) {
        self.labels.insert(label.id, label);
    }

    /// Merge `source` into this registry; incoming entries win on id
    /// collision.
    pub fn merge(&mut self, source: &LabelMap) {
        for label in source.iter() {
            self.insert(label.clone());
        }
    }

    /// Allocate an id for a new user label: `max(id) + 1`, or 2 when the
    /// registry is empty (0 and 1 are reserved).
    pub fn allocate_id(&self) -> u64 {
        match self.labels.keys().next_back() {
            Some(&max) => max.max(LABEL_ID_DEFAULT) + 1,
            None => LABEL_ID_DEFAULT + 1,
        }
    }

    /// Rename a label in place, preserving its id and snapshot chain.
    pub fn rename(&mut self, id: u64, name: impl Into<String>) -> bool {
        match self.labels.get_mut(&id) {
            Some(label) => {
                label.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Point a label at the descriptor 2 of its newest snapshot, creating
    /// the label if needed.
    pub fn set_last_backup(&mut self, id: u64, name: &str, volume: u64, offset: u64) {
        let label = self
            .labels
            .entry(id)
            .or_insert_with(|| Label::new(id, name));
        if !name.is_empty() {
            label.name = name.to_string();
        }
        label.last_backup_volume = volume;
        label.last_backup_offset = offset;
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate labels in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }
}
