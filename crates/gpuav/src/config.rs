//! Engine configuration.
//!
//! Settings are read once when the engine is created. They can come from JSON text, from
//! `GPUAV_*` environment variables, or both (environment wins).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GpuAvError;

pub const ENV_ENABLE: &str = "GPUAV_ENABLE";
pub const ENV_SAFE_MODE: &str = "GPUAV_SAFE_MODE";
pub const ENV_BUFFER_CAPACITY: &str = "GPUAV_BUFFER_CAPACITY";
/// Comma separated list of shader name patterns.
pub const ENV_SHADER_FILTER: &str = "GPUAV_SHADER_FILTER";

/// Upper bound on records per output buffer (keeps a buffer under 64 MiB).
pub const MAX_BUFFER_CAPACITY: u32 = 1 << 20;

bitflags! {
    /// Classes of runtime checks the instrumentation pass may insert.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CheckSet: u32 {
        const BUFFER_OOB = 1 << 0;
        const DESCRIPTOR_INDEXING = 1 << 1;
        const BUFFER_ADDRESS = 1 << 2;
        const PUSH_CONSTANT = 1 << 3;
        const IMAGE_OOB = 1 << 4;
        const DEBUG_PRINTF = 1 << 5;
    }
}

impl Default for CheckSet {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuAvConfig {
    /// When `false` every entry point forwards to the driver untouched.
    pub enabled: bool,
    pub checks: CheckSet,
    /// Skip faulting accesses instead of only reporting them.
    pub safe_mode: bool,
    /// Record slots per diagnostic output buffer.
    pub buffer_capacity: u32,
    /// Shader name patterns (`*` wildcards). Empty means every shader.
    pub shader_filter: Vec<String>,
    /// Shaders larger than this are run uninstrumented.
    pub max_shader_words: usize,
    /// Descriptor array elements tracked per binding in the input buffer.
    pub max_tracked_descriptors: u32,
    /// Buffer device address ranges copied into each input buffer.
    pub max_address_ranges: u32,
    /// Descriptor set index to reserve. Defaults to the last bindable set.
    pub reserved_set: Option<u32>,
}

impl Default for GpuAvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checks: CheckSet::all(),
            safe_mode: true,
            buffer_capacity: 1024,
            shader_filter: Vec::new(),
            max_shader_words: 1 << 22,
            max_tracked_descriptors: 4096,
            max_address_ranges: 1024,
            reserved_set: None,
        }
    }
}

fn truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

impl GpuAvConfig {
    pub fn from_json_str(json: &str) -> Result<Self, GpuAvError> {
        serde_json::from_str(json).map_err(|e| GpuAvError::InvalidConfig(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Applies `GPUAV_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    ///
    /// Malformed numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_ENABLE) {
            self.enabled = truthy(&raw);
        }
        if let Some(raw) = lookup(ENV_SAFE_MODE) {
            self.safe_mode = truthy(&raw);
        }
        if let Some(raw) = lookup(ENV_BUFFER_CAPACITY) {
            match raw.trim().parse::<u32>() {
                Ok(capacity) => self.buffer_capacity = capacity,
                Err(_) => warn!(value = %raw, "ignoring malformed {ENV_BUFFER_CAPACITY}"),
            }
        }
        if let Some(raw) = lookup(ENV_SHADER_FILTER) {
            self.shader_filter = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), GpuAvError> {
        if self.buffer_capacity == 0 || self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(GpuAvError::InvalidConfig(format!(
                "buffer_capacity must be in 1..={MAX_BUFFER_CAPACITY}, got {}",
                self.buffer_capacity
            )));
        }
        if self.max_shader_words == 0 {
            return Err(GpuAvError::InvalidConfig(
                "max_shader_words must be non-zero".into(),
            ));
        }
        if self.shader_filter.iter().any(|p| p.is_empty()) {
            return Err(GpuAvError::InvalidConfig(
                "shader_filter patterns must be non-empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether a shader with the given debug name should be instrumented.
    /// Unnamed shaders are matched as the empty string.
    pub fn shader_selected(&self, name: Option<&str>) -> bool {
        self.shader_filter.is_empty()
            || self
                .shader_filter
                .iter()
                .any(|pattern| glob_match(pattern, name.unwrap_or("")))
    }
}

/// Matches `text` against a pattern where `*` matches any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = GpuAvConfig::from_json_str(r#"{"safe_mode": false, "buffer_capacity": 8}"#)
            .unwrap();
        assert!(cfg.enabled);
        assert!(!cfg.safe_mode);
        assert_eq!(cfg.buffer_capacity, 8);
        assert_eq!(cfg.checks, CheckSet::all());
        cfg.validate().unwrap();
    }

    #[test]
    fn check_set_serializes_as_flag_names() {
        let cfg = GpuAvConfig::from_json_str(r#"{"checks": "BUFFER_OOB | DEBUG_PRINTF"}"#)
            .unwrap();
        assert_eq!(cfg.checks, CheckSet::BUFFER_OOB | CheckSet::DEBUG_PRINTF);
        let back = GpuAvConfig::from_json_str(&cfg.to_json()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_json_is_an_error() {
        assert!(matches!(
            GpuAvConfig::from_json_str("{not json"),
            Err(GpuAvError::InvalidConfig(_))
        ));
    }

    #[test]
    fn overrides_use_truthy_parsing() {
        let vars: HashMap<&str, &str> = [
            (ENV_ENABLE, "off"),
            (ENV_SAFE_MODE, " YES "),
            (ENV_BUFFER_CAPACITY, "16"),
            (ENV_SHADER_FILTER, "post_*, ,blur"),
        ]
        .into_iter()
        .collect();
        let mut cfg = GpuAvConfig {
            safe_mode: false,
            ..GpuAvConfig::default()
        };
        cfg.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert!(!cfg.enabled);
        assert!(cfg.safe_mode);
        assert_eq!(cfg.buffer_capacity, 16);
        assert_eq!(cfg.shader_filter, vec!["post_*", "blur"]);
    }

    #[test]
    fn malformed_capacity_override_is_ignored() {
        let mut cfg = GpuAvConfig::default();
        cfg.apply_overrides(|name| (name == ENV_BUFFER_CAPACITY).then(|| "lots".to_string()));
        assert_eq!(cfg.buffer_capacity, 1024);
    }

    #[test]
    fn validate_rejects_out_of_range_capacity() {
        let cfg = GpuAvConfig {
            buffer_capacity: 0,
            ..GpuAvConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = GpuAvConfig {
            buffer_capacity: MAX_BUFFER_CAPACITY + 1,
            ..GpuAvConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("post_*", "post_blur"));
        assert!(!glob_match("post_*", "pre_blur"));
        assert!(glob_match("*_cs", "cull_cs"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXcYYb"));
        assert!(!glob_match("ab*ba", "aba"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn filter_selects_by_name() {
        let cfg = GpuAvConfig {
            shader_filter: vec!["cull_*".into()],
            ..GpuAvConfig::default()
        };
        assert!(cfg.shader_selected(Some("cull_main")));
        assert!(!cfg.shader_selected(Some("shade")));
        assert!(!cfg.shader_selected(None));
        assert!(GpuAvConfig::default().shader_selected(None));
    }
}
