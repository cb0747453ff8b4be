//! Preset plans — the resource shape of a template to be produced.

use serde::{Deserialize, Serialize};

/// Resource shape for a template preset.
///
/// `preset_id` is derived deterministically from the resources so that
/// equivalent shapes collapse to one identity across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetPlan {
    pub preset_id: String,
    pub label: String,
    pub cpu_display: String,
    pub memory_display: String,
    pub disk_display: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_size_mib: u64,
}

impl PresetPlan {
    /// Build a plan from raw resources; the id and display strings are derived.
    #[must_use]
    pub fn new(label: &str, vcpus: u32, memory_mib: u64, disk_size_mib: u64) -> Self {
        Self {
            preset_id: preset_id_from_resources(vcpus, memory_mib, disk_size_mib),
            label: label.to_string(),
            cpu_display: format_cpu_display(vcpus),
            memory_display: format_memory_display(memory_mib),
            disk_display: format_disk_display(disk_size_mib),
            vcpus,
            memory_mib,
            disk_size_mib,
        }
    }
}

/// Derive a stable preset id from a resource shape, e.g. `4vcpu_8gb_32gb`.
///
/// Memory and disk are rounded down to whole GiB with a floor of 1, so two
/// shapes that differ only below GiB granularity share an id.
#[must_use]
pub fn preset_id_from_resources(vcpus: u32, memory_mib: u64, disk_size_mib: u64) -> String {
    let memory_gb = (memory_mib / 1024).max(1);
    let disk_gb = (disk_size_mib / 1024).max(1);
    format!("{vcpus}vcpu_{memory_gb}gb_{disk_gb}gb")
}

#[must_use]
pub fn format_cpu_display(vcpus: u32) -> String {
    format!("{vcpus} vCPU")
}

#[must_use]
pub fn format_memory_display(memory_mib: u64) -> String {
    let memory_gb = (memory_mib / 1024).max(1);
    format!("{memory_gb} GB RAM")
}

#[must_use]
pub fn format_disk_display(disk_size_mib: u64) -> String {
    let disk_gb = (disk_size_mib / 1024).max(1);
    format!("{disk_gb} GB SSD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_id_from_standard_resources() {
        assert_eq!(preset_id_from_resources(4, 8192, 32768), "4vcpu_8gb_32gb");
    }

    #[test]
    fn test_preset_id_rounds_memory_down_to_gib() {
        assert_eq!(preset_id_from_resources(2, 1536, 10240), "2vcpu_1gb_10gb");
    }

    #[test]
    fn test_preset_id_floors_at_one_gib() {
        assert_eq!(preset_id_from_resources(1, 512, 512), "1vcpu_1gb_1gb");
    }

    #[test]
    fn test_plan_new_derives_id_and_displays() {
        let plan = PresetPlan::new("Standard workspace", 4, 8192, 32768);
        assert_eq!(plan.preset_id, "4vcpu_8gb_32gb");
        assert_eq!(plan.cpu_display, "4 vCPU");
        assert_eq!(plan.memory_display, "8 GB RAM");
        assert_eq!(plan.disk_display, "32 GB SSD");
    }

    #[test]
    fn test_equivalent_shapes_collapse_to_one_id() {
        // Sub-GiB differences must not create distinct presets.
        let a = preset_id_from_resources(4, 8192, 32768);
        let b = preset_id_from_resources(4, 8200, 33000);
        assert_eq!(a, b);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The id is a pure function of the resource shape.
        #[test]
        fn prop_preset_id_is_deterministic(
            vcpus in 1u32..128,
            memory in 128u64..1_048_576,
            disk in 128u64..4_194_304,
        ) {
            prop_assert_eq!(
                preset_id_from_resources(vcpus, memory, disk),
                preset_id_from_resources(vcpus, memory, disk),
            );
        }

        /// Every generated id has the `<n>vcpu_<m>gb_<d>gb` shape.
        #[test]
        fn prop_preset_id_shape(
            vcpus in 1u32..128,
            memory in 128u64..1_048_576,
            disk in 128u64..4_194_304,
        ) {
            let id = preset_id_from_resources(vcpus, memory, disk);
            let parts: Vec<&str> = id.split('_').collect();
            prop_assert_eq!(parts.len(), 3);
            prop_assert!(parts[0].ends_with("vcpu"));
            prop_assert!(parts[1].ends_with("gb"));
            prop_assert!(parts[2].ends_with("gb"));
        }

        /// Display strings never report zero GB.
        #[test]
        fn prop_displays_floor_at_one(memory in 1u64..1024, disk in 1u64..1024) {
            prop_assert_eq!(format_memory_display(memory), "1 GB RAM");
            prop_assert_eq!(format_disk_display(disk), "1 GB SSD");
        }
    }
}
