//! Manifest persistence.
//!
//! The manifest file is the only cross-run state the engine owns. Writes
//! are atomic (tmp + fsync + rename) so a crash never leaves a torn file;
//! a corrupt or newer-schema manifest aborts the run before any write.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::providers::generate_snapshot_id;
use stencil_common::manifest::{ManifestError, TemplateManifest};

/// Default location relative to the repository root.
pub const DEFAULT_MANIFEST_RELPATH: &str = "configs/template-manifest.json";

/// Path-injectable store for the template manifest.
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    /// Store at the conventional in-repo location.
    #[must_use]
    pub fn for_repo(repo_root: &Path) -> Self {
        Self::with_path(repo_root.join(DEFAULT_MANIFEST_RELPATH))
    }

    /// Store at an explicit path (used in tests).
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest, or start an empty one when the file is absent.
    ///
    /// Legacy version entries without a snapshot id get one backfilled.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Corrupt`] on unparseable JSON and
    /// [`ManifestError::UnsupportedSchema`] on a newer schema; neither
    /// case may be followed by a write.
    pub fn load(&self, base_template_vmid: u64, now: DateTime<Utc>) -> Result<TemplateManifest> {
        if !self.path.exists() {
            return Ok(TemplateManifest::empty(base_template_vmid, now));
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading manifest {}", self.path.display()))?;
        let mut manifest: TemplateManifest =
            serde_json::from_str(&content).map_err(|source| ManifestError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })?;
        manifest.check_schema()?;
        backfill_snapshot_ids(&mut manifest);
        Ok(manifest)
    }

    /// Write the manifest atomically: serialize to `<path>.tmp`, fsync,
    /// rename over the real file.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or any write
    /// step fails.
    pub fn save(&self, manifest: &TemplateManifest) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut content =
            serde_json::to_string_pretty(manifest).context("serializing manifest")?;
        content.push('\n');

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            file.write_all(content.as_bytes())
                .with_context(|| format!("writing {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

/// Give legacy version entries a snapshot id so the uniqueness invariant
/// holds for documents written before ids existed.
pub fn backfill_snapshot_ids(manifest: &mut TemplateManifest) {
    for preset in &mut manifest.presets {
        for version in &mut preset.versions {
            if version.snapshot_id.is_empty() {
                version.snapshot_id = generate_snapshot_id();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stencil_common::preset::PresetPlan;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, 12, 34, 56).unwrap()
    }

    fn store(dir: &tempfile::TempDir) -> ManifestStore {
        ManifestStore::with_path(dir.path().join("manifest.json"))
    }

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let manifest = store(&dir).load(9000, now()).expect("load");
        assert_eq!(manifest.base_template_vmid, 9000);
        assert!(manifest.presets.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let s = store(&dir);
        let mut manifest = TemplateManifest::empty(9000, now());
        let plan = PresetPlan::new("Standard workspace", 4, 8192, 32768);
        manifest.record_capture(&plan, 9001, "snapshot_ab12cd34", now(), "pve-01");
        s.save(&manifest).expect("save");
        let loaded = s.load(9000, now()).expect("load");
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_save_writes_two_space_indent_and_trailing_newline() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.save(&TemplateManifest::empty(9000, now())).expect("save");
        let content = std::fs::read_to_string(s.path()).expect("read");
        assert!(content.ends_with('\n'));
        assert!(content.contains("\n  \"schemaVersion\": 2"));
    }

    #[test]
    fn test_save_leaves_no_tmp_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let s = store(&dir);
        s.save(&TemplateManifest::empty(9000, now())).expect("save");
        assert!(!dir.path().join("manifest.json.tmp").exists());
        assert!(s.path().exists());
    }

    #[test]
    fn test_load_corrupt_json_errors_without_write() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"{not json").expect("write");
        let result = ManifestStore::with_path(path.clone()).load(9000, now());
        assert!(result.is_err());
        // The broken file stays untouched for inspection.
        assert_eq!(std::fs::read(&path).expect("read"), b"{not json");
    }

    #[test]
    fn test_load_newer_schema_is_refused() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            br#"{"schemaVersion":99,"updatedAt":"2024-11-03T12:34:56Z","baseTemplateVmid":9000,"node":"","presets":[]}"#,
        )
        .expect("write");
        let err = ManifestStore::with_path(path).load(9000, now()).expect_err("refuse");
        assert!(err.to_string().contains("schemaVersion 99"));
    }

    #[test]
    fn test_load_backfills_missing_snapshot_ids() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            br#"{
  "schemaVersion": 2,
  "updatedAt": "2024-11-03T12:34:56Z",
  "baseTemplateVmid": 9000,
  "node": "pve-01",
  "presets": [
    {
      "presetId": "4vcpu_8gb_32gb",
      "label": "Standard workspace",
      "cpu": "4 vCPU",
      "memory": "8 GB RAM",
      "disk": "32 GB SSD",
      "versions": [
        {"version": 1, "templateVmid": 9001, "capturedAt": "2024-11-03T12:34:56Z"}
      ]
    }
  ]
}"#,
        )
        .expect("write");
        let manifest = ManifestStore::with_path(path).load(9000, now()).expect("load");
        let snapshot_id = &manifest.presets[0].versions[0].snapshot_id;
        assert!(snapshot_id.starts_with("snapshot_"), "got {snapshot_id}");
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let nested = dir.path().join("configs").join("manifest.json");
        let s = ManifestStore::with_path(nested.clone());
        s.save(&TemplateManifest::empty(9000, now())).expect("save");
        assert!(nested.exists());
    }
}
