//! Template manifest schema (v2) and the pure update operations on it.
//!
//! The manifest is the only cross-run persistent state the engine owns. It
//! records, per preset, the ordered list of captured template versions.
//! Loading, atomic writing, and corruption handling live in the CLI crate;
//! this module is data in, data out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::preset::PresetPlan;

/// Manifest schema version written by this engine.
pub const SCHEMA_VERSION: u32 = 2;

/// Errors raised by manifest validation.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unsupported manifest schemaVersion {found} (this engine writes v{SCHEMA_VERSION})")]
    UnsupportedSchema { found: u32 },

    #[error("manifest at {path} is not valid JSON: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One captured template version within a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: u32,
    /// Stable capture id, unique across the whole manifest.
    #[serde(default)]
    pub snapshot_id: String,
    pub template_vmid: u64,
    pub captured_at: DateTime<Utc>,
    /// Fields written by newer schema revisions are preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A preset entry: the resource-shape identity plus its version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetEntry {
    pub preset_id: String,
    pub label: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub versions: Vec<VersionEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresetEntry {
    /// The active version is the last entry (versions are sorted ascending).
    #[must_use]
    pub fn active_version(&self) -> Option<&VersionEntry> {
        self.versions.last()
    }

    fn next_version(&self) -> u32 {
        self.versions
            .iter()
            .map(|entry| entry.version)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Append a new version entry, allocating `max + 1` and keeping the
    /// ascending sort invariant.
    pub fn add_version(
        &mut self,
        template_vmid: u64,
        snapshot_id: &str,
        captured_at: DateTime<Utc>,
    ) -> u32 {
        let version = self.next_version();
        self.versions.push(VersionEntry {
            version,
            snapshot_id: snapshot_id.to_string(),
            template_vmid,
            captured_at,
            extra: Map::new(),
        });
        self.versions.sort_by_key(|entry| entry.version);
        version
    }
}

/// The manifest document (schema v2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateManifest {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    /// Base template the preset templates were built from.
    pub base_template_vmid: u64,
    /// Provider-locality hint (e.g. the PVE node name).
    pub node: String,
    pub presets: Vec<PresetEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TemplateManifest {
    /// An empty manifest bound to a base template.
    #[must_use]
    pub fn empty(base_template_vmid: u64, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: now,
            base_template_vmid,
            node: String::new(),
            presets: Vec::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn find_preset(&self, preset_id: &str) -> Option<&PresetEntry> {
        self.presets
            .iter()
            .find(|preset| preset.preset_id == preset_id)
    }

    /// Find the preset entry that recorded a given template VMID, if any.
    #[must_use]
    pub fn find_preset_for_vmid(&mut self, template_vmid: u64) -> Option<&mut PresetEntry> {
        self.presets.iter_mut().find(|preset| {
            preset
                .versions
                .iter()
                .any(|entry| entry.template_vmid == template_vmid)
        })
    }

    /// Record a newly captured template for `plan`, creating the preset
    /// entry if this is the first capture for that shape. Returns the
    /// allocated version number.
    pub fn record_capture(
        &mut self,
        plan: &PresetPlan,
        template_vmid: u64,
        snapshot_id: &str,
        captured_at: DateTime<Utc>,
        node: &str,
    ) -> u32 {
        self.node = node.to_string();
        self.updated_at = captured_at;

        let index = match self
            .presets
            .iter()
            .position(|preset| preset.preset_id == plan.preset_id)
        {
            Some(index) => index,
            None => {
                self.presets.push(PresetEntry {
                    preset_id: plan.preset_id.clone(),
                    label: plan.label.clone(),
                    cpu: plan.cpu_display.clone(),
                    memory: plan.memory_display.clone(),
                    disk: plan.disk_display.clone(),
                    versions: Vec::new(),
                    extra: Map::new(),
                });
                self.presets.len() - 1
            }
        };
        let preset = &mut self.presets[index];
        // Refresh display metadata; the shape is identical but the labels
        // may have been reworded since the last run.
        preset.label = plan.label.clone();
        preset.cpu = plan.cpu_display.clone();
        preset.memory = plan.memory_display.clone();
        preset.disk = plan.disk_display.clone();
        preset.add_version(template_vmid, snapshot_id, captured_at)
    }

    /// Refuse manifests written by a newer engine.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::UnsupportedSchema`] when `schemaVersion` is
    /// greater than the version this engine writes.
    pub fn check_schema(&self) -> Result<(), ManifestError> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedSchema {
                found: self.schema_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 3, 12, 34, secs).unwrap()
    }

    fn plan() -> PresetPlan {
        PresetPlan::new("Standard workspace", 4, 8192, 32768)
    }

    #[test]
    fn test_record_capture_creates_preset_with_version_one() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        let version = manifest.record_capture(&plan(), 9001, "snapshot_ab12cd34", ts(1), "pve-01");
        assert_eq!(version, 1);
        assert_eq!(manifest.node, "pve-01");
        let preset = manifest.find_preset("4vcpu_8gb_32gb").expect("preset");
        assert_eq!(preset.versions.len(), 1);
        assert_eq!(preset.versions[0].template_vmid, 9001);
    }

    #[test]
    fn test_record_capture_appends_strictly_increasing_versions() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        manifest.record_capture(&plan(), 9001, "snapshot_aa", ts(1), "pve-01");
        manifest.record_capture(&plan(), 9002, "snapshot_bb", ts(2), "pve-01");
        let preset = manifest.find_preset("4vcpu_8gb_32gb").expect("preset");
        let versions: Vec<u32> = preset.versions.iter().map(|entry| entry.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(preset.active_version().expect("active").template_vmid, 9002);
    }

    #[test]
    fn test_record_capture_refreshes_display_metadata() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        manifest.record_capture(&plan(), 9001, "snapshot_aa", ts(1), "pve-01");
        let mut renamed = plan();
        renamed.label = "Default workspace".to_string();
        manifest.record_capture(&renamed, 9002, "snapshot_bb", ts(2), "pve-01");
        let preset = manifest.find_preset("4vcpu_8gb_32gb").expect("preset");
        assert_eq!(preset.label, "Default workspace");
        assert_eq!(manifest.presets.len(), 1, "same shape must not fork a preset");
    }

    #[test]
    fn test_find_preset_for_vmid() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        manifest.record_capture(&plan(), 9001, "snapshot_aa", ts(1), "pve-01");
        assert!(manifest.find_preset_for_vmid(9001).is_some());
        assert!(manifest.find_preset_for_vmid(9999).is_none());
    }

    #[test]
    fn test_check_schema_rejects_newer_schema() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        manifest.schema_version = SCHEMA_VERSION + 1;
        assert!(manifest.check_schema().is_err());
    }

    #[test]
    fn test_check_schema_accepts_current_and_older() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        assert!(manifest.check_schema().is_ok());
        manifest.schema_version = 1;
        assert!(manifest.check_schema().is_ok());
    }

    #[test]
    fn test_serde_uses_camel_case_field_names() {
        let mut manifest = TemplateManifest::empty(9000, ts(0));
        manifest.record_capture(&plan(), 9001, "snapshot_ab12cd34", ts(1), "pve-01");
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert!(json.get("schemaVersion").is_some());
        assert!(json.get("baseTemplateVmid").is_some());
        let version = &json["presets"][0]["versions"][0];
        assert!(version.get("snapshotId").is_some());
        assert!(version.get("templateVmid").is_some());
        assert!(version.get("capturedAt").is_some());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        // A future schema revision may add fields; they must survive a
        // read-modify-write cycle.
        let raw = r#"{
          "schemaVersion": 2,
          "updatedAt": "2024-11-03T12:34:56Z",
          "baseTemplateVmid": 9000,
          "node": "pve-01",
          "futureField": {"nested": true},
          "presets": [
            {
              "presetId": "4vcpu_8gb_32gb",
              "label": "Standard workspace",
              "cpu": "4 vCPU",
              "memory": "8 GB RAM",
              "disk": "32 GB SSD",
              "presetExtra": 7,
              "versions": [
                {
                  "version": 1,
                  "snapshotId": "snapshot_ab12cd34",
                  "templateVmid": 9001,
                  "capturedAt": "2024-11-03T12:34:56Z",
                  "buildHost": "ci-03"
                }
              ]
            }
          ]
        }"#;
        let manifest: TemplateManifest = serde_json::from_str(raw).expect("parse");
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(json["futureField"]["nested"], true);
        assert_eq!(json["presets"][0]["presetExtra"], 7);
        assert_eq!(json["presets"][0]["versions"][0]["buildHost"], "ci-03");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn arb_plan() -> impl Strategy<Value = PresetPlan> {
        (1u32..32, 1024u64..65536, 8192u64..262_144)
            .prop_map(|(vcpus, mem, disk)| PresetPlan::new("workspace", vcpus, mem, disk))
    }

    proptest! {
        /// After N captures of the same shape, versions are exactly 1..=N.
        #[test]
        fn prop_versions_are_contiguous(plan in arb_plan(), count in 1usize..8) {
            let now = Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap();
            let mut manifest = TemplateManifest::empty(9000, now);
            for run in 0..count {
                let vmid = 9001 + run as u64;
                manifest.record_capture(&plan, vmid, &format!("snapshot_{run:08x}"), now, "pve-01");
            }
            let preset = manifest.find_preset(&plan.preset_id).expect("preset");
            let versions: Vec<u32> = preset.versions.iter().map(|entry| entry.version).collect();
            let expected: Vec<u32> = (1..=u32::try_from(count).expect("small")).collect();
            prop_assert_eq!(versions, expected);
        }

        /// Serialize → deserialize is the identity.
        #[test]
        fn prop_manifest_serde_roundtrip(plan in arb_plan(), count in 0usize..4) {
            let now = Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap();
            let mut manifest = TemplateManifest::empty(9000, now);
            for run in 0..count {
                manifest.record_capture(&plan, 9001 + run as u64, &format!("snapshot_{run:08x}"), now, "pve-01");
            }
            let json = serde_json::to_string(&manifest).expect("serialize");
            let back: TemplateManifest = serde_json::from_str(&json).expect("parse");
            prop_assert_eq!(back, manifest);
        }

        /// Snapshot ids stay unique across the document when each capture
        /// uses a fresh id.
        #[test]
        fn prop_snapshot_ids_unique(plans in proptest::collection::vec(arb_plan(), 1..4)) {
            let now = Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap();
            let mut manifest = TemplateManifest::empty(9000, now);
            let mut counter = 0u64;
            for plan in &plans {
                counter += 1;
                manifest.record_capture(plan, 9000 + counter, &format!("snapshot_{counter:08x}"), now, "pve-01");
            }
            let mut seen = std::collections::HashSet::new();
            for preset in &manifest.presets {
                for entry in &preset.versions {
                    prop_assert!(seen.insert(entry.snapshot_id.clone()));
                }
            }
        }
    }
}
