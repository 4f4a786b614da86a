//! Engine configuration.
//!
//! Loaded from a TOML file when one exists, with environment-variable
//! overrides on top; every field has a working default so the engine runs
//! with no configuration at all.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Process names that crawl the filesystem and must never trigger
    /// hydration (search indexers and friends).
    pub crawler_process_names: Vec<String>,

    /// Whether the kernel delivers a will-rename notification before the
    /// delete-class check. Without it, every delete is conservatively
    /// treated as a possible rename.
    pub rename_detection: bool,

    /// Processes owned by UIDs below this (with no ancestor above it) are
    /// system services and may not trigger hydration.
    pub service_uid_ceiling: u32,

    /// Service processes that may hydrate regardless, e.g. the code-signing
    /// validator: blocking it would fail application launches outright.
    pub exempt_hydrators: Vec<String>,

    /// Kernel vnode-table size hint used to size the resolution cache.
    /// Zero means "use the minimum capacity".
    pub cache_capacity_hint: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            crawler_process_names: vec![
                "mds".to_string(),
                "mdworker".to_string(),
                "mds_stores".to_string(),
                "fseventsd".to_string(),
                "Spotlight".to_string(),
            ],
            rename_detection: true,
            service_uid_ceiling: 500,
            exempt_hydrators: vec!["amfid".to_string()],
            cache_capacity_hint: 0,
        }
    }
}

impl GateConfig {
    /// Load from `path` if it exists, otherwise start from defaults; apply
    /// environment overrides either way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            debug!(path = %path.display(), "loading gate config");
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            GateConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(hint) = std::env::var("MIRAGE_CACHE_CAPACITY_HINT") {
            if let Ok(n) = hint.parse() {
                self.cache_capacity_hint = n;
            }
        }
        if let Ok(value) = std::env::var("MIRAGE_RENAME_DETECTION") {
            self.rename_detection = value != "0";
        }
    }

    pub fn is_crawler(&self, process_name: &str) -> bool {
        self.crawler_process_names
            .iter()
            .any(|crawler| crawler == process_name)
    }

    pub fn is_exempt_hydrator(&self, process_name: &str) -> bool {
        self.exempt_hydrators
            .iter()
            .any(|exempt| exempt == process_name)
    }
}
