//! Engine configuration, loadable from YAML or JSON.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::estimator::DEFAULT_DEGENERATE_SKIP_THRESHOLD;

/// Adapter selection hint.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(value: PowerPreference) -> Self {
        match value {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub power_preference: PowerPreference,
    /// Retry with a software adapter when no hardware adapter is found.
    pub allow_fallback_adapter: bool,
    /// Fraction of total weight that may be skipped by the interpolated
    /// binned model before a frequency is reported degenerate.
    pub degenerate_skip_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::default(),
            allow_fallback_adapter: false,
            degenerate_skip_threshold: DEFAULT_DEGENERATE_SKIP_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Loads a config file; the format follows the extension.
    pub fn load(path: &str) -> Result<Self> {
        let config = common::load_file(path)?;
        tracing::debug!(path, ?config, "loaded engine config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.power_preference, PowerPreference::HighPerformance);
        assert!(!config.allow_fallback_adapter);
        assert_eq!(config.degenerate_skip_threshold, 0.5);
    }

    #[test]
    fn test_partial_yaml() {
        let config: EngineConfig =
            serde_yml::from_str("power_preference: low-power\n").unwrap();
        assert_eq!(config.power_preference, PowerPreference::LowPower);
        assert_eq!(config.degenerate_skip_threshold, 0.5);
    }

    #[test]
    fn test_load_json_file() {
        let path = std::env::temp_dir().join(format!("pdm_engine_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "allow_fallback_adapter": true, "degenerate_skip_threshold": 0.25 }"#,
        )
        .unwrap();

        let config = EngineConfig::load(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(config.allow_fallback_adapter);
        assert_eq!(config.degenerate_skip_threshold, 0.25);
    }

    #[test]
    fn test_load_unknown_extension() {
        let err = EngineConfig::load("engine.toml").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/pdm/engine.yaml").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
