//! Leaf sanity checks run after cleanup, before the verifier.

use std::sync::Arc;

use crate::engine::context::TaskContext;
use crate::engine::TaskFuture;

pub(super) fn check_cargo(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        ctx.run("check-cargo", "command -v cargo && cargo --version")
            .await?;
        Ok(())
    })
}

pub(super) fn check_node(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        ctx.run("check-node", "command -v node && node --version")
            .await?;
        Ok(())
    })
}

pub(super) fn check_bun(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        ctx.run("check-bun", "command -v bun && bun --version").await?;
        Ok(())
    })
}

pub(super) fn check_uv(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        ctx.run("check-uv", "command -v uv && uv --version").await?;
        Ok(())
    })
}

pub(super) fn check_gh(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        ctx.run("check-gh", "command -v gh && gh --version").await?;
        Ok(())
    })
}

pub(super) fn check_systemd_services(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -euo pipefail
for unit in cmux-worker cmux-worker-daemon cmux-vnc; do
  systemctl is-enabled "$unit" >/dev/null
done
echo "all services enabled""#;
        ctx.run("check-systemd-services", cmd).await?;
        Ok(())
    })
}
