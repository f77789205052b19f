//! Compiler configuration files.
//!
//! A single TOML document selects the hardware variant, the compiler and
//! estimation options, and the strategy and block-config search lists. Every
//! table and field is optional; missing ones take the built-in defaults.
//!
//! ```toml
//! strategies = ["strategy3", "strategy6"]
//! block_configs = [{ width = 8, height = 8 }]
//!
//! [capabilities]
//! total_sram_size = 262144
//!
//! [options]
//! enable_winograd = false
//! ```

use super::capabilities::{CompilerOptions, EstimationOptions, HardwareCapabilities};
use super::error::ConfigError;
use crate::pass::block_config::{default_block_configs, BlockConfig};
use crate::pass::strategy::{StrategyId, StrategyRegistry, DEFAULT_STRATEGY_PRIORITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub capabilities: HardwareCapabilities,
    pub options: CompilerOptions,
    pub estimation: EstimationOptions,
    /// Strategy search order for non fully-connected operations.
    pub strategies: Vec<StrategyId>,
    /// Block config search order, before filtering.
    pub block_configs: Vec<BlockConfig>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            capabilities: HardwareCapabilities::default(),
            options: CompilerOptions::default(),
            estimation: EstimationOptions::default(),
            strategies: DEFAULT_STRATEGY_PRIORITY.to_vec(),
            block_configs: default_block_configs(),
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CompilerConfig = toml::from_str(content)?;
        log::debug!(
            "configuration: {} bytes SRAM, strategies {:?}, {} block configs",
            config.capabilities.total_sram_size,
            config.strategies,
            config.block_configs.len()
        );
        Ok(config)
    }

    pub fn strategy_registry(&self) -> StrategyRegistry {
        StrategyRegistry::from_ids(&self.strategies)
    }
}

/// Load a configuration from a TOML file.
pub fn load_config_file(path: &Path) -> Result<CompilerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    CompilerConfig::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        assert_eq!(CompilerConfig::from_toml_str("").unwrap(), CompilerConfig::default());
    }

    #[test]
    fn test_partial_tables_keep_other_defaults() {
        let config = CompilerConfig::from_toml_str(
            r#"
            strategies = ["strategy6", "none", "strategy0"]
            block_configs = [{ width = 8, height = 8 }]

            [capabilities]
            total_sram_size = 4096

            [options]
            enable_winograd = false
            "#,
        )
        .unwrap();

        assert_eq!(config.capabilities.total_sram_size, 4096);
        assert_eq!(config.capabilities.num_srams, HardwareCapabilities::default().num_srams);
        assert!(!config.options.enable_winograd);
        assert_eq!(config.block_configs, vec![BlockConfig::new(8, 8)]);
        assert_eq!(
            config.strategy_registry().ids(),
            vec![StrategyId::Strategy6, StrategyId::Strategy0]
        );
    }

    #[test]
    fn test_unknown_strategy_is_a_parse_error() {
        let err = CompilerConfig::from_toml_str(r#"strategies = ["strategy2"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config_file(Path::new("/nonexistent/npupass.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/npupass.toml"));
    }
}
