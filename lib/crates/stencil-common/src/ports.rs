//! Provider-uniform port assignments for services baked into every template.
//!
//! These are fixed across all backends so that exposed-service URLs can be
//! constructed without querying the workspace.

/// Exec daemon (HTTP exec transport).
pub const EXEC_DAEMON_PORT: u16 = 39375;

/// Worker service (node bundle).
pub const WORKER_PORT: u16 = 39376;

/// Go worker daemon (SSH/PTY proxy).
pub const WORKER_DAEMON_PORT: u16 = 39377;

/// IDE server (HTTP).
pub const IDE_PORT: u16 = 39378;

/// Outbound proxy.
pub const PROXY_PORT: u16 = 39379;

/// VNC server.
pub const VNC_PORT: u16 = 39380;

/// Chrome DevTools protocol proxy.
pub const CDP_PORT: u16 = 39381;

/// Xterm service.
pub const XTERM_PORT: u16 = 39383;
