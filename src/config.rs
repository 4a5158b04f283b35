//! Bridge configuration (`vmbridge.toml`).
//!
//! ```toml
//! [tooling]
//! debug = "off"      # off | step | error
//! profile = "off"    # off | on | <mode>, e.g. "fi10"
//! jit = "on"         # on | off
//!
//! [limits]
//! max_array_size = 134217729
//! max_string_bytes = 2147483392
//! max_stack = 65500
//! max_call_depth = 200
//!
//! [profiler]
//! max_depth = 8
//! chunk_size = 1024
//! max_chunks = 64
//! ```
//!
//! Every field is optional. Limits flow into each instance a
//! [`Bridge`](crate::bridge::Bridge) creates; tooling and profiler settings
//! are process-wide and take effect on [`BridgeConfig::apply`].

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::bridge::profiler::ProfileLimits;
use crate::bridge::tooling::{set_mode, set_profile_limits};
use crate::bridge::types::{BridgeError, BridgeResult};
use crate::vm::VmConfig;

/// `[tooling]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolingConfig {
    pub debug: String,
    pub profile: String,
    pub jit: String,
}

impl Default for ToolingConfig {
    fn default() -> Self {
        Self {
            debug: "off".to_string(),
            profile: "off".to_string(),
            jit: "on".to_string(),
        }
    }
}

/// `[limits]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_array_size: usize,
    pub max_string_bytes: usize,
    pub max_stack: usize,
    pub max_call_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let vm = VmConfig::default();
        Self {
            max_array_size: vm.max_array_size,
            max_string_bytes: vm.max_string_bytes,
            max_stack: vm.max_stack,
            max_call_depth: vm.max_call_depth,
        }
    }
}

/// `[profiler]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub max_depth: usize,
    pub chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        let limits = ProfileLimits::default();
        Self {
            max_depth: limits.max_depth,
            chunk_size: limits.chunk_size,
            max_chunks: limits.max_chunks,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub tooling: ToolingConfig,
    pub limits: LimitsConfig,
    pub profiler: ProfilerConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        debug!(target: "vmbridge::config", path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> BridgeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BridgeResult<()> {
        let zero = |field: &str| BridgeError::Config(format!("{} must be positive", field));
        let l = &self.limits;
        if l.max_array_size == 0 {
            return Err(zero("limits.max_array_size"));
        }
        if l.max_string_bytes == 0 {
            return Err(zero("limits.max_string_bytes"));
        }
        if l.max_stack == 0 {
            return Err(zero("limits.max_stack"));
        }
        if l.max_call_depth == 0 {
            return Err(zero("limits.max_call_depth"));
        }
        let p = &self.profiler;
        if p.max_depth == 0 || p.chunk_size == 0 || p.max_chunks == 0 {
            return Err(zero("profiler limits"));
        }
        Ok(())
    }

    /// Capacity ceilings for new VM instances
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            max_array_size: self.limits.max_array_size,
            max_string_bytes: self.limits.max_string_bytes,
            max_stack: self.limits.max_stack,
            max_call_depth: self.limits.max_call_depth,
        }
    }

    pub fn profile_limits(&self) -> ProfileLimits {
        ProfileLimits {
            max_depth: self.profiler.max_depth,
            chunk_size: self.profiler.chunk_size,
            max_chunks: self.profiler.max_chunks,
        }
    }

    /// Install the tooling modes and profiler limits process-wide.
    pub fn apply(&self) -> BridgeResult<()> {
        let t = &self.tooling;
        set_mode(t.debug.as_str(), t.profile.as_str(), t.jit.as_str())?;
        set_profile_limits(self.profile_limits());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        let config = BridgeConfig::parse("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.vm_config(), VmConfig::default());
        assert_eq!(config.profile_limits(), ProfileLimits::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = BridgeConfig::parse(
            r#"
            [tooling]
            jit = "off"

            [limits]
            max_array_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.tooling.jit, "off");
        assert_eq!(config.tooling.debug, "off");
        assert_eq!(config.vm_config().max_array_size, 16);
        assert_eq!(config.vm_config().max_stack, VmConfig::default().max_stack);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            BridgeConfig::parse("[limits]\nmax_stack = \"big\""),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            BridgeConfig::parse("[limits]\nmax_call_depth = 0"),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = BridgeConfig::load("/nonexistent/vmbridge.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
