//! CLI-level tests: argument validation and the offline surfaces
//! (`--print-deps`, `--help`). Nothing here touches a provider API.

#![allow(clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn stencil() -> Command {
    Command::cargo_bin("stencil").expect("binary built")
}

#[test]
fn test_no_args_shows_help_and_exits_nonzero() {
    stencil().assert().failure().code(2);
}

#[test]
fn test_missing_provider_is_an_argument_error() {
    stencil()
        .arg("--print-deps")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--provider"));
}

#[test]
fn test_update_without_vmid_is_an_argument_error() {
    stencil()
        .args(["--provider", "pve", "--update"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--update-vmid"));
}

#[test]
fn test_print_deps_renders_full_graph() {
    stencil()
        .args(["--provider", "pve", "--print-deps"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("apt-bootstrap")
                .and(predicate::str::contains("install-base-packages"))
                .and(predicate::str::contains("cleanup-build-artifacts"))
                .and(predicate::str::contains("├─").or(predicate::str::contains("└─"))),
        );
}

#[test]
fn test_print_deps_update_mode_skips_installs() {
    stencil()
        .args([
            "--provider",
            "pve",
            "--update",
            "--update-vmid",
            "9001",
            "--print-deps",
        ])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("upload-repo")
                .and(predicate::str::contains("apt-bootstrap").not()),
        );
}

#[test]
fn test_missing_base_template_is_a_runtime_error() {
    stencil()
        .args(["--provider", "pve"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--base-template"));
}

#[test]
fn test_unknown_provider_is_rejected() {
    stencil()
        .args(["--provider", "ec2", "--print-deps"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_help_lists_the_preset_flags() {
    stencil()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--standard-vcpus")
                .and(predicate::str::contains("--boosted-disk-size"))
                .and(predicate::str::contains("--ide-provider"))
                .and(predicate::str::contains("--no-use-git-diff")),
        );
}
