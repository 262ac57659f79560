//! Conductor configuration

use serde::{Deserialize, Serialize};

/// Conductor configuration
///
/// Loadable from TOML:
///
/// ```toml
/// thread_name_prefix = "step-"
/// persist_procedures = false
/// event_capacity = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Prefix of instruction thread names; the path is appended
    pub thread_name_prefix: String,
    /// Stack size of instruction threads, platform default when unset
    pub thread_stack_size: Option<usize>,
    /// Write the live procedure to root storage on every conduct
    pub persist_procedures: bool,
    /// Capacity of each output's event channel
    pub event_capacity: usize,
}

impl ConductorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML
    ///
    /// # Errors
    /// Returns the TOML decode error.
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// With thread name prefix
    #[inline]
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// With thread stack size
    #[inline]
    #[must_use]
    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// With procedure persistence on or off
    #[inline]
    #[must_use]
    pub fn with_persist_procedures(mut self, persist: bool) -> Self {
        self.persist_procedures = persist;
        self
    }

    /// With event channel capacity
    #[inline]
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "instruction-".to_string(),
            thread_stack_size: None,
            persist_procedures: true,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConductorConfig::from_toml_str("persist_procedures = false\n").unwrap();
        assert!(!config.persist_procedures);
        assert_eq!(config.thread_name_prefix, "instruction-");
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_builder() {
        let config = ConductorConfig::new()
            .with_thread_name_prefix("step-")
            .with_event_capacity(0)
            .with_thread_stack_size(1 << 20);
        assert_eq!(config.thread_name_prefix, "step-");
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.thread_stack_size, Some(1 << 20));
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(ConductorConfig::from_toml_str("event_capacity = \"many\"").is_err());
    }
}
