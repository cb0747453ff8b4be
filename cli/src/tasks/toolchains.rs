//! Toolchain installation tasks.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::context::TaskContext;
use crate::engine::TaskFuture;
use crate::providers::RemoteHost;

const LONG_INSTALL_TIMEOUT: Duration = Duration::from_secs(1200);

// Configure apt to wait for dpkg locks instead of failing immediately
// when parallel tasks hit the package manager at once.
const APT_LOCK_WAIT: &str = r#"export APT_LOCK_WAIT_OPTS="-o DPkg::Lock::Timeout=120""#;

pub(super) fn apt_bootstrap(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux

cat > /etc/apt/apt.conf.d/99parallel << 'EOF'
Acquire::Queue-Mode "host";
APT::Acquire::Max-Parallel-Downloads "16";
Acquire::http::Pipeline-Depth "10";
Acquire::https::Pipeline-Depth "10";
EOF

DEBIAN_FRONTEND=noninteractive apt-get update
DEBIAN_FRONTEND=noninteractive apt-get install -y \
    ca-certificates curl wget jq git gnupg lsb-release \
    tar unzip xz-utils zip bzip2 gzip htop lsof

install -m 0755 -d /usr/share/keyrings
curl -fsSL https://cli.github.com/packages/githubcli-archive-keyring.gpg \
    | dd of=/usr/share/keyrings/githubcli-archive-keyring.gpg
chmod go+r /usr/share/keyrings/githubcli-archive-keyring.gpg
arch="$(dpkg --print-architecture)"
echo "deb [arch=${arch} signed-by=/usr/share/keyrings/githubcli-archive-keyring.gpg] https://cli.github.com/packages stable main" \
    > /etc/apt/sources.list.d/github-cli.list

rm -rf /var/lib/apt/lists/*"#;
        ctx.run("apt-bootstrap", cmd).await?;
        Ok(())
    })
}

pub(super) fn install_base_packages(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux

DEBIAN_FRONTEND=noninteractive apt-get update
DEBIAN_FRONTEND=noninteractive apt-get install -y \
    build-essential make pkg-config g++ libssl-dev \
    tigervnc-standalone-server tigervnc-common xvfb \
    x11-xserver-utils xterm novnc dbus-x11 openbox \
    tmux gh zsh zsh-autosuggestions ripgrep ffmpeg xdotool

arch="$(dpkg --print-architecture)"
case "${arch}" in
  amd64) chrome_url="https://dl.google.com/linux/direct/google-chrome-stable_current_amd64.deb" ;;
  arm64) chrome_url="https://dl.google.com/linux/direct/google-chrome-stable_current_arm64.deb" ;;
  *) echo "Unsupported architecture: ${arch}" >&2; exit 1 ;;
esac
cd /tmp
curl -fsSL -o chrome.deb "${chrome_url}"
DEBIAN_FRONTEND=noninteractive apt-get install -y ./chrome.deb || true
DEBIAN_FRONTEND=noninteractive apt-get install -yf
rm -f chrome.deb

rm -rf /var/lib/apt/lists/*"#;
        ctx.run_with_timeout("install-base-packages", cmd, LONG_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn ensure_docker(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"{APT_LOCK_WAIT}
set -euo pipefail

echo "[docker] ensuring Docker APT repository"
DEBIAN_FRONTEND=noninteractive apt-get $APT_LOCK_WAIT_OPTS update
DEBIAN_FRONTEND=noninteractive apt-get $APT_LOCK_WAIT_OPTS install -y ca-certificates curl
. /etc/os-release
distro_codename="${{UBUNTU_CODENAME:-${{VERSION_CODENAME:-stable}}}}"
case "${{ID:-debian}}" in
  ubuntu|Ubuntu) repo_id="ubuntu" ;;
  *) repo_id="debian" ;;
esac
install -m 0755 -d /etc/apt/keyrings
curl -fsSL "https://download.docker.com/linux/${{repo_id}}/gpg" -o /etc/apt/keyrings/docker.asc
chmod a+r /etc/apt/keyrings/docker.asc
printf 'deb [arch=%s signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/%s %s stable\n' \
  "$(dpkg --print-architecture)" "$repo_id" "$distro_codename" \
  > /etc/apt/sources.list.d/docker.list

echo "[docker] installing engine and CLI plugins"
DEBIAN_FRONTEND=noninteractive apt-get $APT_LOCK_WAIT_OPTS update
DEBIAN_FRONTEND=noninteractive apt-get $APT_LOCK_WAIT_OPTS install -y \
  docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin

# The workspace dockerd unit owns the daemon; the stock services would race it.
systemctl disable docker.service docker.socket || true
systemctl stop docker.service docker.socket || true

docker --version || true
docker compose version || true"#
        );
        ctx.run_with_timeout("ensure-docker", &cmd, LONG_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_node_runtime(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux
NODE_VERSION="24.9.0"
arch="$(uname -m)"
case "${arch}" in
  x86_64) node_arch="x64" ;;
  aarch64|arm64) node_arch="arm64" ;;
  *) echo "Unsupported architecture: ${arch}" >&2; exit 1 ;;
esac
tmp_dir="$(mktemp -d)"
trap 'rm -rf "${tmp_dir}"' EXIT
cd "${tmp_dir}"
curl -fsSLO "https://nodejs.org/dist/v${NODE_VERSION}/node-v${NODE_VERSION}-linux-${node_arch}.tar.xz"
curl -fsSLO "https://nodejs.org/dist/v${NODE_VERSION}/SHASUMS256.txt"
grep " node-v${NODE_VERSION}-linux-${node_arch}.tar.xz$" SHASUMS256.txt | sha256sum -c -
tar -xJf "node-v${NODE_VERSION}-linux-${node_arch}.tar.xz" -C /usr/local --strip-components=1
cd /
ln -sf /usr/local/bin/node /usr/bin/node
ln -sf /usr/local/bin/npm /usr/bin/npm
ln -sf /usr/local/bin/npx /usr/bin/npx
npm install -g node-gyp
corepack enable
corepack prepare pnpm@10.14.0 --activate"#;
        ctx.run("install-node-runtime", cmd).await?;
        Ok(())
    })
}

pub(super) fn install_nvm(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux
export NVM_DIR="/root/.nvm"
mkdir -p "${NVM_DIR}"
curl -fsSL "https://raw.githubusercontent.com/nvm-sh/nvm/v0.39.7/install.sh" | bash
cat <<'PROFILE' > /etc/profile.d/nvm.sh
export NVM_DIR="$HOME/.nvm"
[ -s "$NVM_DIR/nvm.sh" ] && . "$NVM_DIR/nvm.sh"
[ -s "$NVM_DIR/bash_completion" ] && . "$NVM_DIR/bash_completion"
PROFILE
bash -lc 'source /etc/profile.d/nvm.sh && nvm --version'"#;
        ctx.run("install-nvm", cmd).await?;
        Ok(())
    })
}

pub(super) fn install_bun(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        // The base template may carry bun already.
        if let Ok(output) = ctx
            .host
            .exec("command -v bun && bun --version", Duration::from_secs(15))
            .await
        {
            if output.success() && output.stdout.to_lowercase().contains("bun") {
                let version = output.stdout.trim().lines().last().unwrap_or("").to_string();
                ctx.console
                    .info(&format!("[install-bun] Bun already installed: {version}"));
                return Ok(());
            }
        }

        // The download runs in the background and is polled so no single
        // exec call outlives the gateway's idle timeout.
        let start = r#"set -eux
arch="$(uname -m)"
case "${arch}" in
  x86_64) bun_arch="x64" ;;
  aarch64|arm64) bun_arch="aarch64" ;;
  *) echo "Unsupported architecture: ${arch}" >&2; exit 1 ;;
esac
BUN_VERSION="$(curl -fsSL https://api.github.com/repos/oven-sh/bun/releases/latest | jq -r '.tag_name' | sed 's/^bun-v//')"
echo "${bun_arch}" > /tmp/bun-arch
echo "${BUN_VERSION}" > /tmp/bun-version
rm -f /tmp/bun.zip /tmp/bun-download-done
nohup sh -c "curl -fsSL -o /tmp/bun.zip \
  https://github.com/oven-sh/bun/releases/download/bun-v${BUN_VERSION}/bun-linux-${bun_arch}.zip \
  && touch /tmp/bun-download-done" >/tmp/bun-download.log 2>&1 &
echo "[install-bun] download started (v${BUN_VERSION}, ${bun_arch})""#;
        ctx.run("install-bun", start).await?;

        let finish = r#"set -eux
for attempt in $(seq 1 60); do
  if [ -f /tmp/bun-download-done ]; then
    break
  fi
  if [ "$attempt" -eq 60 ]; then
    echo "bun download did not finish" >&2
    cat /tmp/bun-download.log >&2 || true
    exit 1
  fi
  sleep 5
done
mkdir -p /root/.bun/bin
unzip -o /tmp/bun.zip -d /tmp/bun-extract
mv "/tmp/bun-extract/bun-linux-$(cat /tmp/bun-arch)/bun" /root/.bun/bin/bun
chmod +x /root/.bun/bin/bun
ln -sf /root/.bun/bin/bun /usr/local/bin/bun
ln -sf /root/.bun/bin/bun /usr/local/bin/bunx
rm -rf /tmp/bun.zip /tmp/bun-extract /tmp/bun-download-done
bun --version"#;
        ctx.run_with_timeout("install-bun-finish", finish, LONG_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_go_toolchain(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux
GO_VERSION="1.23.4"
arch="$(uname -m)"
case "${arch}" in
  x86_64) go_arch="amd64" ;;
  aarch64|arm64) go_arch="arm64" ;;
  *) echo "Unsupported architecture: ${arch}" >&2; exit 1 ;;
esac
curl -fsSL -o /tmp/go.tar.gz "https://go.dev/dl/go${GO_VERSION}.linux-${go_arch}.tar.gz"
rm -rf /usr/local/go
tar -C /usr/local -xzf /tmp/go.tar.gz
rm -f /tmp/go.tar.gz
mkdir -p /usr/local/go-workspace /usr/local/go-cache
/usr/local/go/bin/go version"#;
        ctx.run_with_timeout("install-go-toolchain", cmd, LONG_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_uv_python(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux
curl -LsSf https://astral.sh/uv/install.sh | sh
export PATH="/root/.local/bin:$PATH"
uv python install 3.12
uv --version"#;
        ctx.run("install-uv-python", cmd).await?;
        Ok(())
    })
}

pub(super) fn install_rust_toolchain(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -eux
export RUSTUP_HOME=/usr/local/rustup
export CARGO_HOME=/usr/local/cargo
curl --proto '=https' --tlsv1.2 -fsSL https://sh.rustup.rs \
  | sh -s -- -y --no-modify-path --default-toolchain stable
/usr/local/cargo/bin/cargo --version
/usr/local/cargo/bin/rustc --version"#;
        ctx.run_with_timeout("install-rust-toolchain", cmd, LONG_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}
