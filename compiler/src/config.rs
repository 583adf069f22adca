// config.rs — Target description and tuning-parameter overrides
//
// Both are plain serde types read from JSON. Missing target fields fall
// back to the defaults of a 32-lane SIMT device with 48 KiB of shared
// memory per block.
//
// Preconditions: none.
// Postconditions: a loaded `TargetConfig` has passed `validate`.
// Failure modes: unreadable file, malformed JSON, zero or non-power-of-two
//                warp size, block limit below one warp.
// Side effects: reads files from disk (`load`, `ParamOverrides::load`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ParamError};
use crate::tune::Tuner;

// ── Target ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Lanes executing in lock-step.
    pub warp_size: u32,
    pub max_threads_per_block: u32,
    /// Shared-memory budget per block, in bytes.
    pub shared_memory_bytes: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_block: 1024,
            shared_memory_bytes: 49152,
        }
    }
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TargetConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warp_size == 0 || !self.warp_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "warp_size must be a power of two, got {}",
                self.warp_size
            )));
        }
        if self.max_threads_per_block < self.warp_size {
            return Err(ConfigError::Invalid(format!(
                "max_threads_per_block ({}) is smaller than one warp ({})",
                self.max_threads_per_block, self.warp_size
            )));
        }
        Ok(())
    }
}

// ── Parameter overrides ────────────────────────────────────────────────────

/// Tuning values supplied by the user: either a positional list in
/// enumeration order or a map from parameter name to value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamOverrides {
    List(Vec<u32>),
    Named(BTreeMap<String, u32>),
}

impl ParamOverrides {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&self, tuner: &mut Tuner) -> Result<(), ParamError> {
        match self {
            ParamOverrides::List(values) => tuner.apply_overrides(values),
            ParamOverrides::Named(map) => {
                for (name, &value) in map {
                    tuner.set_by_name(name, value)?;
                }
                Ok(())
            }
        }
    }
}

/// Parse a comma-separated list such as `2,8,1,4,4,1`.
pub fn parse_param_list(text: &str) -> Result<Vec<u32>, ParamError> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| ParamError::Syntax(format!("`{}` is not a non-negative integer", s)))
        })
        .collect()
}
