//! Allocator configuration
//!
//! [`SaverConfig`] controls how virtualized allocations are backed. The
//! defaults match what the framework integration expects; the environment
//! can override the page attribute for experiments.

use crate::backend::MemoryAttr;
use crate::error::{SaverError, SaverResult};

/// Environment variable selecting the physical page attribute
pub const MEM_ATTR_ENV: &str = "NPU_MEMORY_SAVER_MEM_ATTR";

/// Allocator configuration variables checked for incompatible settings
const ALLOC_CONF_ENVS: [&str; 2] = ["PYTORCH_NPU_ALLOC_CONF", "PYTORCH_CUDA_ALLOC_CONF"];

/// Configuration for the memory saver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaverConfig {
    /// Page attribute for physical backing created on malloc and resume
    pub memory_attr: MemoryAttr,

    /// Refuse to start when the framework allocator uses expandable segments
    pub check_alloc_conf: bool,
}

impl Default for SaverConfig {
    fn default() -> Self {
        SaverConfig {
            memory_attr: MemoryAttr::Huge,
            check_alloc_conf: true,
        }
    }
}

impl SaverConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the physical page attribute
    pub fn with_memory_attr(mut self, memory_attr: MemoryAttr) -> Self {
        self.memory_attr = memory_attr;
        self
    }

    /// Enable or disable the allocator-configuration check
    pub fn with_check_alloc_conf(mut self, check_alloc_conf: bool) -> Self {
        self.check_alloc_conf = check_alloc_conf;
        self
    }

    /// Defaults overridden by `NPU_MEMORY_SAVER_MEM_ATTR`, then validated
    /// against the process environment.
    pub fn from_env() -> SaverResult<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(MEM_ATTR_ENV) {
            config.memory_attr = MemoryAttr::from_str(&value).ok_or_else(|| {
                SaverError::InvalidConfiguration(format!("{}={}", MEM_ATTR_ENV, value))
            })?;
        }
        config.validate_environment()?;
        Ok(config)
    }

    /// Reject environments the virtualized path cannot serve.
    ///
    /// Expandable segments make the framework allocator grow blocks in place
    /// with its own virtual memory calls, which bypass the hooks.
    pub fn validate_environment(&self) -> SaverResult<()> {
        if !self.check_alloc_conf {
            return Ok(());
        }
        for key in ALLOC_CONF_ENVS {
            let value = std::env::var(key).unwrap_or_default();
            if value.contains("expandable_segments:True") {
                return Err(SaverError::UnsupportedEnvironment(format!(
                    "expandable_segments is not supported ({}={})",
                    key, value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(MEM_ATTR_ENV);
        for key in ALLOC_CONF_ENVS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = SaverConfig::new()
            .with_memory_attr(MemoryAttr::Normal)
            .with_check_alloc_conf(false);
        assert_eq!(config.memory_attr, MemoryAttr::Normal);
        assert!(!config.check_alloc_conf);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        assert_eq!(SaverConfig::from_env().unwrap(), SaverConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_memory_attr() {
        clear_env();
        std::env::set_var(MEM_ATTR_ENV, "normal");
        let config = SaverConfig::from_env().unwrap();
        assert_eq!(config.memory_attr, MemoryAttr::Normal);

        std::env::set_var(MEM_ATTR_ENV, "gigantic");
        assert!(matches!(
            SaverConfig::from_env(),
            Err(SaverError::InvalidConfiguration(_))
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_expandable_segments() {
        clear_env();
        std::env::set_var("PYTORCH_NPU_ALLOC_CONF", "expandable_segments:True");
        assert!(matches!(
            SaverConfig::from_env(),
            Err(SaverError::UnsupportedEnvironment(_))
        ));

        let unchecked = SaverConfig::new().with_check_alloc_conf(false);
        assert!(unchecked.validate_environment().is_ok());
        clear_env();
    }
}
