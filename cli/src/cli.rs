//! CLI argument parsing with clap derive

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::app;
use crate::ide::IdeProvider;
use crate::providers::ProviderKind;
use stencil_common::preset::PresetPlan;

/// Sandbox template provisioning engine
#[derive(Parser)]
#[command(name = "stencil", version, arg_required_else_help = true)]
#[allow(clippy::struct_excessive_bools)] // Clap CLI struct — bools map to flags, not state
pub struct Cli {
    /// Backend to provision against
    #[arg(long, value_enum)]
    pub provider: ProviderKind,

    /// Template/snapshot id the first preset is cloned from
    #[arg(long)]
    pub base_template: Option<String>,

    /// Repository root uploaded into each workspace
    #[arg(long, default_value = ".")]
    pub repo_root: PathBuf,

    /// vCPU count for the standard preset
    #[arg(long, default_value_t = 4)]
    pub standard_vcpus: u32,

    /// Memory (MiB) for the standard preset
    #[arg(long, default_value_t = 8192)]
    pub standard_memory: u64,

    /// Disk size (MiB) for the standard preset
    #[arg(long, default_value_t = 32768)]
    pub standard_disk_size: u64,

    /// vCPU count for the boosted preset
    #[arg(long, default_value_t = 6)]
    pub boosted_vcpus: u32,

    /// Memory (MiB) for the boosted preset
    #[arg(long, default_value_t = 8192)]
    pub boosted_memory: u64,

    /// Disk size (MiB) for the boosted preset
    #[arg(long, default_value_t = 40960)]
    pub boosted_disk_size: u64,

    /// Delete created workspaces on failure (default)
    #[arg(long, conflicts_with = "no_cleanup_on_failure")]
    pub cleanup_on_failure: bool,

    /// Keep created workspaces on failure for debugging
    #[arg(long)]
    pub no_cleanup_on_failure: bool,

    /// Clone from the git remote and apply local changes (default)
    #[arg(long, conflicts_with = "no_use_git_diff")]
    pub use_git_diff: bool,

    /// Upload the source tree as a full archive
    #[arg(long)]
    pub no_use_git_diff: bool,

    /// Update mode: refresh an existing template (skips one-time installs)
    #[arg(long, requires = "update_vmid")]
    pub update: bool,

    /// VMID of the template/container to update
    #[arg(long)]
    pub update_vmid: Option<u64>,

    /// Print the dependency graph and exit
    #[arg(long)]
    pub print_deps: bool,

    /// IDE server baked into the template
    #[arg(long, value_enum, default_value_t = IdeProvider::CmuxCode)]
    pub ide_provider: IdeProvider,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Effective cleanup flag (on unless explicitly disabled).
    #[must_use]
    pub fn effective_cleanup_on_failure(&self) -> bool {
        !self.no_cleanup_on_failure
    }

    /// Effective git-diff flag (on unless explicitly disabled).
    #[must_use]
    pub fn effective_use_git_diff(&self) -> bool {
        !self.no_use_git_diff
    }

    /// The two default presets in build order.
    #[must_use]
    pub fn preset_plans(&self) -> Vec<PresetPlan> {
        vec![
            PresetPlan::new(
                "Standard workspace",
                self.standard_vcpus,
                self.standard_memory,
                self.standard_disk_size,
            ),
            PresetPlan::new(
                "Performance workspace",
                self.boosted_vcpus,
                self.boosted_memory,
                self.boosted_disk_size,
            ),
        ]
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error when the run fails; the process then exits 1.
    pub async fn run(self) -> Result<()> {
        app::run(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn test_defaults_match_standard_and_boosted_shapes() {
        let cli = parse(&["stencil", "--provider", "pve", "--base-template", "9000"]);
        let plans = cli.preset_plans();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].preset_id, "4vcpu_8gb_32gb");
        assert_eq!(plans[0].label, "Standard workspace");
        assert_eq!(plans[1].preset_id, "6vcpu_8gb_40gb");
        assert_eq!(plans[1].label, "Performance workspace");
    }

    #[test]
    fn test_flags_default_to_cleanup_and_git_diff() {
        let cli = parse(&["stencil", "--provider", "pve"]);
        assert!(cli.effective_cleanup_on_failure());
        assert!(cli.effective_use_git_diff());
    }

    #[test]
    fn test_negative_flags_disable_defaults() {
        let cli = parse(&[
            "stencil",
            "--provider",
            "pve",
            "--no-cleanup-on-failure",
            "--no-use-git-diff",
        ]);
        assert!(!cli.effective_cleanup_on_failure());
        assert!(!cli.effective_use_git_diff());
    }

    #[test]
    fn test_provider_is_required() {
        assert!(Cli::try_parse_from(["stencil", "--print-deps"]).is_err());
    }

    #[test]
    fn test_update_requires_update_vmid() {
        assert!(Cli::try_parse_from(["stencil", "--provider", "pve", "--update"]).is_err());
        let cli = parse(&[
            "stencil",
            "--provider",
            "pve",
            "--update",
            "--update-vmid",
            "9001",
        ]);
        assert!(cli.update);
        assert_eq!(cli.update_vmid, Some(9001));
    }

    #[test]
    fn test_conflicting_cleanup_flags_rejected() {
        assert!(Cli::try_parse_from([
            "stencil",
            "--provider",
            "pve",
            "--cleanup-on-failure",
            "--no-cleanup-on-failure",
        ])
        .is_err());
    }

    #[test]
    fn test_custom_shape_changes_preset_identity() {
        let cli = parse(&[
            "stencil",
            "--provider",
            "pve",
            "--standard-vcpus",
            "8",
            "--standard-memory",
            "16384",
            "--standard-disk-size",
            "65536",
        ]);
        assert_eq!(cli.preset_plans()[0].preset_id, "8vcpu_16gb_64gb");
    }
}
