//! Source upload strategy.
//!
//! Two modes. Git-delta clones the repo from its origin inside the
//! workspace at the upstream commit, then applies a single `git diff
//! --binary` patch covering unpushed commits and uncommitted changes —
//! only the delta crosses the wire. Full-archive packs tracked+untracked
//! files into an uncompressed tar and unpacks it remotely. Git-delta
//! falls back to the archive automatically when the repo has no usable
//! remote shape or the remote clone fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::command_runner::{CommandRunner, TokioCommandRunner};
use crate::engine::context::TaskContext;
use crate::exec::shell_quote;
use crate::output::Console;
use crate::providers::RemoteHost;

const REMOTE_PATCH_PATH: &str = "/tmp/cmux-full.patch";
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_CLONE_ATTEMPTS: u32 = 3;

/// Everything the delta path needs to know about the local repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitFacts {
    pub remote_url: String,
    pub branch: String,
    /// Upstream tracking ref, e.g. `origin/main`.
    pub upstream: String,
    pub upstream_commit: String,
}

/// Upload the repository into the workspace, choosing the mode from the
/// context and falling back from delta to archive when needed.
///
/// # Errors
///
/// Returns an error when the chosen path fails terminally (transport
/// errors, archive extraction failure).
pub async fn sync_repo(ctx: &TaskContext) -> Result<()> {
    if ctx.use_git_diff {
        if upload_repo_via_diff(ctx).await? {
            return Ok(());
        }
        ctx.console
            .info("[git-diff] Falling back to full archive upload");
    }
    upload_repo_archive(ctx).await
}

// ── Git-delta path ────────────────────────────────────────────────────────────

async fn git(runner: &TokioCommandRunner, root: &Path, args: &[&str]) -> Option<String> {
    let mut full_args = vec!["-c", "core.quotepath=off"];
    full_args.extend_from_slice(args);
    match runner.run_in_dir("git", &full_args, root).await {
        Ok(output) if output.success() => Some(output.stdout),
        _ => None,
    }
}

/// Resolve the remote/branch/upstream facts, or `None` when the repo
/// cannot serve as a delta base (no remote, detached HEAD, unresolvable
/// upstream).
pub async fn resolve_git_facts(
    runner: &TokioCommandRunner,
    root: &Path,
    console: &Console,
) -> Option<GitFacts> {
    let remote_url = git(runner, root, &["remote", "get-url", "origin"]).await?;
    let remote_url = remote_url.trim().to_string();
    if remote_url.is_empty() {
        console.info("[git-diff] No git remote URL found, falling back to full upload");
        return None;
    }

    let branch = git(runner, root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let branch = branch.trim().to_string();
    if branch == "HEAD" || branch.is_empty() {
        console.info("[git-diff] Not on a branch (detached HEAD), falling back to full upload");
        return None;
    }

    let upstream = match git(runner, root, &["rev-parse", "--abbrev-ref", "@{upstream}"]).await {
        Some(output) if !output.trim().is_empty() => output.trim().to_string(),
        _ => {
            let assumed = format!("origin/{branch}");
            console.info(&format!(
                "[git-diff] No upstream tracking branch, assuming {assumed}"
            ));
            assumed
        }
    };

    let upstream_commit = git(runner, root, &["rev-parse", &upstream]).await?;
    let upstream_commit = upstream_commit.trim().to_string();
    if upstream_commit.is_empty() {
        console.info(&format!(
            "[git-diff] Cannot find upstream branch {upstream}, falling back to full upload"
        ));
        return None;
    }

    Some(GitFacts {
        remote_url,
        branch,
        upstream,
        upstream_commit,
    })
}

/// Branch name without its remote prefix: `origin/feature/foo` → `feature/foo`.
#[must_use]
pub fn remote_branch_name(upstream: &str) -> String {
    upstream
        .split_once('/')
        .map_or_else(|| upstream.to_string(), |(_, rest)| rest.to_string())
}

/// Script that ensures a clone of `remote_url` at `target_commit` exists
/// at `repo_dir`: fetch-and-reset when a clone is present, fresh
/// single-branch clone otherwise.
#[must_use]
pub fn build_clone_script(
    repo_dir: &str,
    remote_url: &str,
    branch: &str,
    target_commit: &str,
) -> String {
    format!(
        r#"set -euo pipefail
REPO_DIR={repo_dir}
REMOTE_URL={remote_url}
BRANCH={branch}
TARGET_COMMIT={target_commit}

if [ -d "$REPO_DIR/.git" ]; then
    echo "[git-diff] Existing repo found, fetching updates..."
    cd "$REPO_DIR"
    git fetch origin "$BRANCH"
    git checkout -f "$TARGET_COMMIT"
    git clean -fd
else
    echo "[git-diff] Cloning repository..."
    rm -rf "$REPO_DIR"
    git clone --branch "$BRANCH" --single-branch "$REMOTE_URL" "$REPO_DIR" || {{
        echo "[git-diff] Branch clone failed, trying full clone..."
        git clone "$REMOTE_URL" "$REPO_DIR"
    }}
    cd "$REPO_DIR"
    git checkout -f "$TARGET_COMMIT"
    git clean -fd
fi
echo "[git-diff] Repository at commit $(git rev-parse --short HEAD)""#,
        repo_dir = shell_quote(repo_dir),
        remote_url = shell_quote(remote_url),
        branch = shell_quote(branch),
        target_commit = shell_quote(target_commit),
    )
}

/// Script applying the uploaded patch and removing it.
#[must_use]
pub fn build_apply_script(repo_dir: &str) -> String {
    format!(
        "set -euo pipefail\ncd {}\ngit apply --whitespace=nowarn {REMOTE_PATCH_PATH}\nrm -f {REMOTE_PATCH_PATH}\necho \"[git-diff] Patch applied successfully\"",
        shell_quote(repo_dir)
    )
}

/// Whether a failed remote clone is worth retrying.
#[must_use]
pub fn is_transient_clone_error(stderr: &str) -> bool {
    [
        "502",
        "503",
        "504",
        "Bad Gateway",
        "Service Unavailable",
        "Gateway Timeout",
    ]
    .iter()
    .any(|marker| stderr.contains(marker))
}

/// Write `git diff --binary <base>` (base → working tree) to a temp file.
/// Covers unpushed commits and uncommitted changes in one patch. `None`
/// when there is no difference.
async fn create_diff_patch(
    runner: &TokioCommandRunner,
    root: &Path,
    base_ref: &str,
) -> Result<Option<tempfile::NamedTempFile>> {
    let patch = tempfile::Builder::new()
        .prefix("stencil-diff-")
        .suffix(".patch")
        .tempfile()
        .context("creating patch temp file")?;
    let patch_path = patch.path().display().to_string();
    // --output keeps binary patch bytes out of the captured (lossy) stdout.
    let output = runner
        .run_in_dir(
            "git",
            &["diff", "--binary", &format!("--output={patch_path}"), base_ref],
            root,
        )
        .await?;
    if !output.success() {
        anyhow::bail!("git diff failed: {}", output.stderr.trim());
    }
    let size = patch.as_file().metadata().context("patch metadata")?.len();
    if size == 0 {
        return Ok(None);
    }
    Ok(Some(patch))
}

/// Clone-from-origin plus local patch. Returns `Ok(false)` when the
/// archive fallback should run instead.
///
/// # Errors
///
/// Returns an error on transport failures; remote-side clone failures
/// report `Ok(false)`.
pub async fn upload_repo_via_diff(ctx: &TaskContext) -> Result<bool> {
    let Some(facts) = resolve_git_facts(&ctx.runner, &ctx.repo_root, &ctx.console).await else {
        return Ok(false);
    };

    ctx.console
        .info(&format!("[git-diff] Remote: {}", facts.remote_url));
    ctx.console
        .info(&format!("[git-diff] Branch: {}", facts.branch));
    ctx.console.info(&format!(
        "[git-diff] Upstream: {} ({})",
        facts.upstream,
        &facts.upstream_commit[..facts.upstream_commit.len().min(12)]
    ));

    let branch = remote_branch_name(&facts.upstream);
    let script = build_clone_script(
        &ctx.remote_repo_root,
        &facts.remote_url,
        &branch,
        &facts.upstream_commit,
    );

    ctx.console.info(&format!(
        "[git-diff] Cloning/fetching branch {branch} in the workspace..."
    ));
    let mut delay = Duration::from_secs(5);
    let mut clone_output = None;
    for attempt in 1..=MAX_CLONE_ATTEMPTS {
        let output = ctx.host.exec(&script, CLONE_TIMEOUT).await?;
        if output.success() {
            clone_output = Some(output);
            break;
        }
        if !is_transient_clone_error(&output.stderr) || attempt == MAX_CLONE_ATTEMPTS {
            ctx.console
                .info(&format!("[git-diff] Clone/fetch failed: {}", output.stderr));
            return Ok(false);
        }
        ctx.console.info(&format!(
            "[git-diff] Clone attempt {attempt}/{MAX_CLONE_ATTEMPTS} failed with a transient error, retrying in {}s...",
            delay.as_secs()
        ));
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    let Some(clone_output) = clone_output else {
        return Ok(false);
    };
    for line in clone_output.stdout.lines().filter(|line| !line.trim().is_empty()) {
        ctx.console.info(&format!("  {line}"));
    }

    match create_diff_patch(&ctx.runner, &ctx.repo_root, &facts.upstream).await? {
        Some(patch) => {
            let size = patch.as_file().metadata().map(|meta| meta.len()).unwrap_or(0);
            ctx.console.info(&format!(
                "[git-diff] Full patch size (unpushed + uncommitted): {size} bytes"
            ));
            ctx.push_file(patch.path(), REMOTE_PATCH_PATH).await?;

            ctx.console.info("[git-diff] Applying full patch...");
            let apply = ctx
                .host
                .exec(&build_apply_script(&ctx.remote_repo_root), APPLY_TIMEOUT)
                .await?;
            if apply.success() {
                ctx.console
                    .info("[git-diff] Full patch applied (unpushed commits + uncommitted changes)");
            } else {
                ctx.console
                    .warn(&format!("[git-diff] Patch apply failed: {}", apply.stderr));
                ctx.console
                    .info("[git-diff] Continuing with the upstream commit only (no local changes)");
            }
        }
        None => {
            ctx.console
                .info("[git-diff] No local changes to apply (working tree matches upstream)");
        }
    }

    ctx.console
        .info("[git-diff] Repository updated via clone + patch");
    Ok(true)
}

// ── Full-archive path ─────────────────────────────────────────────────────────

/// Tracked and untracked files (gitignore respected); falls back to a
/// tree walk when git is unavailable.
pub async fn list_repo_files(runner: &TokioCommandRunner, root: &Path) -> Vec<PathBuf> {
    if let Some(output) = git(
        runner,
        root,
        &["ls-files", "--cached", "--others", "--exclude-standard", "-z"],
    )
    .await
    {
        return output
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect();
    }
    walk_tree(root)
}

/// Every file under `root` except the `.git` directory, relative paths.
pub(crate) fn walk_tree(root: &Path) -> Vec<PathBuf> {
    fn visit(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let path = entry.path();
            if path.file_name().is_some_and(|name| name == ".git") {
                continue;
            }
            if path.is_dir() {
                visit(&path, root, files);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    let mut files = Vec::new();
    visit(root, root, &mut files);
    files
}

/// Pack `files` (relative to `root`) into an uncompressed tar; returns
/// the temp file and its SHA-256.
///
/// # Errors
///
/// Returns an error when the archive cannot be written.
pub fn create_repo_archive(
    root: &Path,
    files: &[PathBuf],
) -> Result<(tempfile::NamedTempFile, String)> {
    let archive = tempfile::Builder::new()
        .prefix("cmux-repo-")
        .suffix(".tar")
        .tempfile()
        .context("creating archive temp file")?;
    {
        let mut builder = tar::Builder::new(archive.as_file());
        for relative in files {
            let full = root.join(relative);
            if !full.is_file() {
                continue;
            }
            builder
                .append_path_with_name(&full, relative)
                .with_context(|| format!("archiving {}", relative.display()))?;
        }
        builder.finish().context("finishing archive")?;
    }

    let bytes = std::fs::read(archive.path()).context("reading archive back")?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    Ok((archive, digest))
}

/// Script that unpacks the uploaded archive over the remote repo root.
#[must_use]
pub fn build_extract_script(repo_dir: &str, archive_path: &str) -> String {
    let dir = shell_quote(repo_dir);
    let archive = shell_quote(archive_path);
    format!("set -euo pipefail\nrm -rf {dir}\nmkdir -p {dir}\ntar -xf {archive} -C {dir}\nrm -f {archive}")
}

/// Archive-mode upload: pack, push, unpack.
///
/// # Errors
///
/// Returns an error when packing, pushing or unpacking fails.
pub async fn upload_repo_archive(ctx: &TaskContext) -> Result<()> {
    ctx.console.info("Creating repository archive...");
    let files = list_repo_files(&ctx.runner, &ctx.repo_root).await;
    let (archive, digest) = create_repo_archive(&ctx.repo_root, &files)?;
    ctx.console.info(&format!(
        "Archive ready: {} files, sha256 {}",
        files.len(),
        &digest[..12]
    ));

    ctx.console.info(&format!(
        "Uploading repository archive to {}...",
        ctx.remote_archive_path
    ));
    ctx.push_file(archive.path(), &ctx.remote_archive_path)
        .await?;

    let script = build_extract_script(&ctx.remote_repo_root, &ctx.remote_archive_path);
    let output = ctx.host.exec(&script, Duration::from_secs(300)).await?;
    if !output.success() {
        anyhow::bail!(
            "archive extraction failed (exit {}): {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    ctx.console
        .info(&format!("Repository unpacked into {}", ctx.remote_repo_root));
    Ok(())
}
