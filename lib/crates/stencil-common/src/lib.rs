#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod manifest;
pub mod ports;
pub mod preset;

pub use manifest::{ManifestError, PresetEntry, TemplateManifest, VersionEntry, SCHEMA_VERSION};
pub use preset::{preset_id_from_resources, PresetPlan};
