//! Build and service-wiring tasks.

use std::sync::Arc;
use std::time::Duration;

use stencil_common::ports::{CDP_PORT, EXEC_DAEMON_PORT, VNC_PORT, WORKER_DAEMON_PORT, WORKER_PORT};

use crate::engine::context::TaskContext;
use crate::engine::TaskFuture;

const BUILD_TIMEOUT: Duration = Duration::from_secs(1200);

pub(super) fn build_cdp_proxy(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/apps/cdp-proxy
go build -o /usr/local/bin/cdp-proxy ./cmd/cdp-proxy
/usr/local/bin/cdp-proxy --help >/dev/null 2>&1 || true
echo "cdp-proxy built (port {CDP_PORT})""#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("build-cdp-proxy", &cmd, BUILD_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn build_execd(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/apps/execd
go build -o /usr/local/bin/cmux-execd ./cmd/execd
echo "cmux-execd built (port {EXEC_DAEMON_PORT})""#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("build-execd", &cmd, BUILD_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn restart_execd_early(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        // The restart drops the very connection carrying this command, so
        // it is detached and the exit event may never arrive. That is
        // fine: stream truncation counts as success and the daemon comes
        // back within seconds.
        let cmd = r#"set -eux
if systemctl list-unit-files | grep -q cmux-execd; then
  nohup systemctl restart cmux-execd >/dev/null 2>&1 &
else
  pkill -f cmux-execd || true
  nohup /usr/local/bin/cmux-execd >/var/log/cmux-execd.log 2>&1 &
fi
sleep 1
echo restarted"#;
        ctx.run_with_timeout("restart-execd-early", cmd, Duration::from_secs(60))
            .await?;
        Ok(())
    })
}

pub(super) fn build_worker_daemon(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/apps/worker-daemon
go build -o /usr/local/bin/worker-daemon ./cmd/worker-daemon
echo "worker-daemon built (port {WORKER_DAEMON_PORT})""#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("build-worker-daemon", &cmd, BUILD_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn build_worker(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/apps/worker
bun run build
mkdir -p /builtins/build
cp -r build/. /builtins/build/
test -f /builtins/build/index.js"#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("build-worker", &cmd, BUILD_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn build_rust_binaries(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/apps/envd
cargo build --release --locked
ls target/release"#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("build-rust-binaries", &cmd, BUILD_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn link_rust_binaries(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
for bin in envd envctl; do
  install -m 0755 {repo}/apps/envd/target/release/$bin /usr/local/bin/$bin
done
envctl --version || true"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("link-rust-binaries", &cmd).await?;
        Ok(())
    })
}

pub(super) fn install_systemd_units(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail

cat > /etc/systemd/system/cmux-worker.service << 'EOF'
[Unit]
Description=Workspace worker service
After=network.target

[Service]
ExecStart=/usr/bin/node /builtins/build/index.js
Environment=PORT={WORKER_PORT}
Restart=always

[Install]
WantedBy=multi-user.target
EOF

cat > /etc/systemd/system/cmux-worker-daemon.service << 'EOF'
[Unit]
Description=Workspace worker daemon (SSH/PTY proxy)
After=network.target

[Service]
ExecStart=/usr/local/bin/worker-daemon
Environment=PORT={WORKER_DAEMON_PORT}
Restart=always

[Install]
WantedBy=multi-user.target
EOF

cat > /etc/systemd/system/cmux-vnc.service << 'EOF'
[Unit]
Description=Workspace VNC server
After=network.target

[Service]
ExecStart=/usr/local/bin/start-vnc
Environment=PORT={VNC_PORT}
Restart=always

[Install]
WantedBy=multi-user.target
EOF

systemctl daemon-reload
systemctl enable cmux-worker.service cmux-worker-daemon.service cmux-vnc.service"#
        );
        ctx.run("install-systemd-units", &cmd).await?;
        Ok(())
    })
}

pub(super) fn cleanup_build_artifacts(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -eux
rm -rf {repo}/apps/envd/target
rm -rf /usr/local/go-cache/* || true
rm -rf /root/.bun/install/cache || true
rm -rf /root/.npm /root/.cache/pip || true
DEBIAN_FRONTEND=noninteractive apt-get clean
rm -rf /var/lib/apt/lists/*
journalctl --vacuum-size=1M || true
df -h /"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("cleanup-build-artifacts", &cmd).await?;
        Ok(())
    })
}
