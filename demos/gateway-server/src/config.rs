//! Server configuration.

use std::{net::SocketAddr, path::Path};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use wa_gateway_session::ManagerConfig;

/// Names a TOML config file.
pub const CONFIG_ENV: &str = "WA_GATEWAY_CONFIG";
/// Overrides `listen_addr`.
pub const LISTEN_ENV: &str = "WA_GATEWAY_LISTEN";
/// Overrides `database_url`.
pub const DATABASE_URL_ENV: &str = "WA_GATEWAY_DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// SQLite URL; sessions are kept in memory when unset.
    pub database_url: Option<String>,
    pub manager: ManagerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: None,
            manager: ManagerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from the file named by `WA_GATEWAY_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(
            std::env::var(LISTEN_ENV).ok(),
            std::env::var(DATABASE_URL_ENV).ok(),
        )?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn apply_overrides(
        &mut self,
        listen: Option<String>,
        database_url: Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(listen) = listen {
            self.listen_addr = listen
                .parse()
                .with_context(|| format!("invalid {LISTEN_ENV}: {listen}"))?;
        }
        if let Some(url) = database_url.filter(|u| !u.is_empty()) {
            self.database_url = Some(url);
        }
        Ok(())
    }
}
