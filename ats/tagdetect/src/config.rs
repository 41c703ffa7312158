//! Detector configuration
//!
//! Everything that varies between builds of the native library lives here
//! rather than in code: the tag families to try, the dialect order, and the
//! init handshake bound.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binding::Dialect;

/// Tag families tried in order until one both resolves and constructs.
pub const DEFAULT_FAMILIES: &[&str] = &[
    "tag36h11",
    "tag25h9",
    "tag16h5",
    "tagStandard41h12",
    "tagCircle21h7",
    "tagStandard52h13",
    "tagCustom48h12",
    "tagCircle49h12",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Family identifiers; constructors are looked up as `{family}_create`
    #[serde(default = "default_families")]
    pub families: Vec<String>,
    /// Dialects tried in order during binding resolution
    #[serde(default = "default_dialects")]
    pub dialects: Vec<Dialect>,
    /// How long the capture side waits for `ready` after `init`
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Emit a `debug` image-info message before each detection
    #[serde(default)]
    pub debug_images: bool,
    /// Additional export names to probe on modules that cannot enumerate
    /// their own exports
    #[serde(default)]
    pub extra_exports: Vec<String>,
}

fn default_families() -> Vec<String> {
    DEFAULT_FAMILIES.iter().map(|s| s.to_string()).collect()
}

fn default_dialects() -> Vec<Dialect> {
    vec![Dialect::Canonical, Dialect::Adapter]
}

fn default_init_timeout_ms() -> u64 {
    10_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            families: default_families(),
            dialects: default_dialects(),
            init_timeout_ms: default_init_timeout_ms(),
            debug_images: false,
            extra_exports: Vec::new(),
        }
    }
}

impl DetectorConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.families.is_empty() {
            return Err("at least one tag family must be configured".to_string());
        }
        if self.dialects.is_empty() {
            return Err("at least one dialect must be configured".to_string());
        }
        if self.init_timeout_ms == 0 {
            return Err("init_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}
