// File: rusty-collections/src/config.rs
// Purpose: Engine configuration and TOML manifest loading

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::schema::{EntitySchema, SchemaCatalog};
use crate::wire::Json;

/// Runtime configuration shared by every collection of a registry.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound for waiting on a confirming sync batch; `None` waits forever.
    pub settle_timeout: Option<Duration>,

    /// Debounce window for paced updates.
    pub pace_window: Duration,

    /// Wire value marking a field as intentionally cleared.
    pub unset_sentinel: Json,

    /// Buffer size of each collection's change broadcast.
    pub change_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_timeout: Some(Duration::from_secs(30)),
            pace_window: Duration::from_millis(250),
            unset_sentinel: default_sentinel(),
            change_capacity: 1000,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn with_pace_window(mut self, window: Duration) -> Self {
        self.pace_window = window;
        self
    }

    pub fn with_unset_sentinel(mut self, sentinel: Json) -> Self {
        self.unset_sentinel = sentinel;
        self
    }
}

fn default_sentinel() -> Json {
    json!({"$unset": true})
}

fn default_settle_timeout_ms() -> u64 {
    30_000
}

fn default_pace_window_ms() -> u64 {
    250
}

fn default_change_capacity() -> usize {
    1000
}

/// `[sync]` table of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTomlConfig {
    /// Settle bound in milliseconds; `0` disables the bound.
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,

    #[serde(default = "default_pace_window_ms")]
    pub pace_window_ms: u64,

    #[serde(default)]
    pub unset_sentinel: Option<toml::Value>,

    #[serde(default = "default_change_capacity")]
    pub change_capacity: usize,
}

impl Default for SyncTomlConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: default_settle_timeout_ms(),
            pace_window_ms: default_pace_window_ms(),
            unset_sentinel: None,
            change_capacity: default_change_capacity(),
        }
    }
}

impl SyncTomlConfig {
    /// Convert TOML config to runtime config
    pub fn to_runtime_config(&self) -> Result<SyncConfig> {
        let unset_sentinel = match &self.unset_sentinel {
            Some(value) => serde_json::to_value(value).context("Invalid unset_sentinel")?,
            None => default_sentinel(),
        };

        if self.change_capacity == 0 {
            anyhow::bail!("change_capacity must be greater than zero");
        }

        Ok(SyncConfig {
            settle_timeout: match self.settle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            pace_window: Duration::from_millis(self.pace_window_ms),
            unset_sentinel,
            change_capacity: self.change_capacity,
        })
    }
}

/// A sync manifest: engine settings plus the entity catalog.
///
/// ```toml
/// [sync]
/// settle_timeout_ms = 10000
///
/// [[entities]]
/// name = "widget"
/// key = ["widgetId"]
/// list = "widgets.v1.WidgetService/ListWidgets"
/// sync = "widgets.v1.WidgetService/SyncWidgets"
/// fields = [
///     { name = "widgetId", kind = "id" },
///     { name = "name", kind = "string" },
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub sync: SyncTomlConfig,

    #[serde(default)]
    pub entities: Vec<EntitySchema>,
}

impl Manifest {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sync manifest")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid manifest: {}", path.display()))
    }

    /// Split into runtime config and a validated catalog.
    pub fn into_parts(self) -> Result<(SyncConfig, SchemaCatalog)> {
        let config = self.sync.to_runtime_config()?;
        let catalog = SchemaCatalog::new(self.entities).context("Invalid entity catalog")?;
        Ok((config, catalog))
    }
}
