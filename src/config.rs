//! Pool policy configuration. Grounded on the teacher's `NovaConfig`:
//! TOML-backed, `serde(default)` throughout, loaded via `from_file`/`from_str`.

use crate::error::MigrateError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Force the destination master/xenops URLs to `https://` when
    /// bootstrapping cross-cluster, regardless of the scheme the handshake
    /// blob supplied. Consulted by the destination resolver.
    #[serde(default)]
    pub use_tls_for_dest: bool,

    /// Cross-cluster migration between SRs that share the same backing UUID.
    /// Always `false` — see Open Questions: no semantics are implemented for
    /// this mode, and the feasibility checker rejects any attempt to enable it.
    #[serde(default)]
    pub shared_sr_migration_allowed: bool,

    #[serde(default)]
    pub compress_default: bool,

    #[serde(default = "default_max_concurrent_storage_migrations")]
    pub max_concurrent_storage_migrations: u32,

    #[serde(default = "default_wait_for_task_poll_interval_ms")]
    pub wait_for_task_poll_interval_ms: u64,

    /// How long a named fist-point (test-injection hook) sleeps when present.
    #[serde(default = "default_fist_point_delay_secs")]
    pub fist_point_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_tls_for_dest: false,
            shared_sr_migration_allowed: false,
            compress_default: false,
            max_concurrent_storage_migrations: default_max_concurrent_storage_migrations(),
            wait_for_task_poll_interval_ms: default_wait_for_task_poll_interval_ms(),
            fist_point_delay_secs: default_fist_point_delay_secs(),
        }
    }
}

fn default_max_concurrent_storage_migrations() -> u32 {
    3
}

fn default_wait_for_task_poll_interval_ms() -> u64 {
    1000
}

fn default_fist_point_delay_secs() -> u64 {
    5
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        if config.shared_sr_migration_allowed {
            return Err(MigrateError::ConfigError(
                "shared_sr_migration_allowed cannot be enabled: unimplemented mode".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|_| MigrateError::InvalidConfig)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
