//! Backup-plan sidecar: a small XML document describing a configured
//! backup so it can be re-run later.
//!
//! The document has a single `<backup>` root.  `type` is the UI-facing
//! enum (0 invalid, 1 full, 2 incremental, 3 differential) — note this
//! is not the on-disk `BackupType` encoding.  `volume_size_index` maps
//! to a fixed media-size table; `paths` records the user's selection,
//! both checked and unchecked, so the tree state round-trips.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::labels::LABEL_ID_ALLOCATE;
use crate::library::BackupOptions;
use crate::records::BackupType;

/// Media sizes for `volume_size_index`, in MiB.
pub const VOLUME_SIZES_MB: [u64; 4] = [100, 700, 4400, 15000];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PlanPaths {
    #[serde(default)]
    pub checked: Vec<String>,
    #[serde(default)]
    pub unchecked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename = "backup")]
pub struct BackupPlan {
    /// 0 invalid, 1 full, 2 incremental, 3 differential.
    #[serde(rename = "type")]
    pub backup_type: u32,
    pub description: String,
    pub destination: String,
    pub enable_compression: bool,
    pub split: bool,
    pub use_vss: bool,
    /// Index into [`VOLUME_SIZES_MB`].
    pub volume_size_index: u32,
    pub use_default_label: bool,
    pub label_id: u64,
    pub label_name: String,
    pub paths: PlanPaths,
}

impl Default for BackupPlan {
    fn default() -> Self {
        Self {
            backup_type: 0,
            description: String::new(),
            destination: String::new(),
            enable_compression: false,
            split: false,
            use_vss: false,
            volume_size_index: 0,
            use_default_label: true,
            label_id: LABEL_ID_ALLOCATE,
            label_name: String::new(),
            paths: PlanPaths::default(),
        }
    }
}

impl BackupPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NoSuchFile(path.display().to_string()));
        }
        let text = fs::read_to_string(path)?;
        quick_xml::de::from_str(&text)
            .map_err(|e| Error::CorruptBackup(format!("Malformed backup plan: {e}")))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let body = quick_xml::se::to_string_with_root("backup", self)
            .map_err(|e| Error::GenericError(format!("Could not serialize plan: {e}")))?;
        fs::write(path, body)?;
        Ok(())
    }

    /// Decode the UI-facing type enum.
    pub fn backup_type(&self) -> BackupType {
        match self.backup_type {
            1 => BackupType::Full,
            2 => BackupType::Incremental,
            3 => BackupType::Differential,
            _ => BackupType::Invalid,
        }
    }

    /// Maximum volume size in MB, or 0 when splitting is off.
    pub fn max_volume_size_mb(&self) -> u64 {
        if !self.split {
            return 0;
        }
        VOLUME_SIZES_MB
            .get(self.volume_size_index as usize)
            .copied()
            .unwrap_or(VOLUME_SIZES_MB[0])
    }

    /// Lower this plan into the library's backup options.
    pub fn to_backup_options(&self) -> BackupOptions {
        BackupOptions {
            description: self.description.clone(),
            backup_type: self.backup_type(),
            enable_compression: self.enable_compression,
            max_volume_size_mb: self.max_volume_size_mb(),
            label_id: if self.use_default_label { LABEL_ID_ALLOCATE } else { self.label_id },
            label_name: if self.use_default_label {
                String::new()
            } else {
                self.label_name.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BackupPlan {
        BackupPlan {
            backup_type: 2,
            description: "nightly".to_string(),
            destination: "/backups/home".to_string(),
            enable_compression: true,
            split: true,
            use_vss: false,
            volume_size_index: 1,
            use_default_label: false,
            label_id: 4,
            label_name: "laptop".to_string(),
            paths: PlanPaths {
                checked: vec!["/home/u".to_string(), "/etc".to_string()],
                unchecked: vec!["/home/u/.cache".to_string()],
            },
        }
    }

    #[test]
    fn xml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.plan");
        let plan = sample();
        plan.save(&path).unwrap();
        let loaded = BackupPlan::load(&path).unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn load_missing_is_no_such_file() {
        let err = BackupPlan::load("/definitely/not/here.plan").unwrap_err();
        assert!(matches!(err, Error::NoSuchFile(_)));
    }

    #[test]
    fn type_and_size_mapping() {
        let mut plan = sample();
        assert_eq!(plan.backup_type(), BackupType::Incremental);
        assert_eq!(plan.max_volume_size_mb(), 700);
        plan.split = false;
        assert_eq!(plan.max_volume_size_mb(), 0);
        plan.backup_type = 9;
        assert_eq!(plan.backup_type(), BackupType::Invalid);
    }

    #[test]
    fn options_honor_default_label() {
        let mut plan = sample();
        let options = plan.to_backup_options();
        assert_eq!(options.label_id, 4);
        assert_eq!(options.label_name, "laptop");
        plan.use_default_label = true;
        let options = plan.to_backup_options();
        assert_eq!(options.label_id, LABEL_ID_ALLOCATE);
        assert!(options.label_name.is_empty());
    }
}
