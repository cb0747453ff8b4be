//! Provider configuration from the environment.
//!
//! Each backend reads `{PREFIX}_API_URL` / `{PREFIX}_API_TOKEN` plus the
//! shared optional variables: `PUBLIC_DOMAIN` (HTTP-exec URL assembly),
//! `SSH_HOST` (SSH fallback) and `NODE` (provider-locality hint).

use anyhow::{bail, Result};

use crate::providers::ProviderKind;

/// Environment-derived configuration for one backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub api_token: String,
    /// Tunnel domain for exec-daemon URLs (`port-{port}-{id}.{domain}`).
    pub public_domain: Option<String>,
    /// SSH host for the fallback transport (`root@<host>`).
    pub ssh_host: Option<String>,
    /// Preferred node; auto-detected when unset.
    pub node: Option<String>,
}

impl ProviderConfig {
    /// Read configuration for `kind` from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when the API URL or token is missing, with an
    /// example export block for the chosen provider.
    pub fn from_env(kind: ProviderKind) -> Result<Self> {
        let prefix = kind.env_prefix();
        let url_var = format!("{prefix}_API_URL");
        let token_var = format!("{prefix}_API_TOKEN");

        let api_url = env_non_empty(&url_var);
        let api_token = env_non_empty(&token_var);
        let (Some(api_url), Some(api_token)) = (api_url, api_token) else {
            bail!(
                "{url_var} and {token_var} must be set\n\n\
                 Example:\n  export {url_var}=https://api.example.com\n  \
                 export {token_var}=your-secret"
            );
        };

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token,
            public_domain: env_non_empty("PUBLIC_DOMAIN"),
            ssh_host: env_non_empty("SSH_HOST"),
            node: env_non_empty("NODE"),
        })
    }

    /// Whether at least one exec transport can be built from this config.
    #[must_use]
    pub fn has_exec_transport(&self) -> bool {
        self.public_domain.is_some() || self.ssh_host.is_some()
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
