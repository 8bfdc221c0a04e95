//! Configuration management for Authguard.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{AuthguardError, Result};
use crate::ratelimit::{PolicyFile, PolicySet};

/// Main configuration for Authguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthguardConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a policy file; the built-in policies are used when unset
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Idle bucket eviction
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// Idle bucket eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Whether to run the background sweeper
    #[serde(default = "default_eviction_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Refill intervals a bucket must sit untouched before it is dropped
    #[serde(default = "default_idle_multiplier")]
    pub idle_multiplier: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_eviction_enabled(),
            sweep_interval_secs: default_sweep_interval(),
            idle_multiplier: default_idle_multiplier(),
        }
    }
}

fn default_eviction_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_multiplier() -> u32 {
    4
}

impl EvictionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AuthguardConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AuthguardConfig =
            serde_yaml::from_str(yaml).map_err(|e| AuthguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let eviction = &self.rate_limiting.eviction;
        if eviction.enabled && eviction.sweep_interval_secs == 0 {
            return Err(AuthguardError::Config(
                "eviction.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if eviction.enabled && eviction.idle_multiplier == 0 {
            return Err(AuthguardError::Config(
                "eviction.idle_multiplier must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the policy set this configuration selects.
    pub fn load_policies(&self) -> Result<PolicySet> {
        match &self.rate_limiting.policies_path {
            Some(path) => PolicyFile::from_file(path)?.into_policy_set(),
            None => {
                info!("No policy file configured, using built-in policies");
                Ok(PolicySet::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthguardConfig::default();
        assert!(config.rate_limiting.policies_path.is_none());
        assert!(config.rate_limiting.eviction.enabled);
        assert_eq!(
            config.rate_limiting.eviction.sweep_interval(),
            Duration::from_secs(300)
        );
        assert_eq!(config.rate_limiting.eviction.idle_multiplier, 4);
        assert_eq!(config.load_policies().unwrap().len(), 5);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
rate_limiting:
  eviction:
    idle_multiplier: 8
"#;
        let config = AuthguardConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limiting.eviction.enabled);
        assert_eq!(config.rate_limiting.eviction.sweep_interval_secs, 300);
        assert_eq!(config.rate_limiting.eviction.idle_multiplier, 8);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = AuthguardConfig::from_yaml("{}").unwrap();
        assert!(config.rate_limiting.policies_path.is_none());
    }

    #[test]
    fn test_invalid_eviction_settings() {
        let yaml = r#"
rate_limiting:
  eviction:
    sweep_interval_secs: 0
"#;
        assert!(matches!(
            AuthguardConfig::from_yaml(yaml),
            Err(AuthguardError::Config(_))
        ));

        let disabled = r#"
rate_limiting:
  eviction:
    enabled: false
    sweep_interval_secs: 0
"#;
        assert!(AuthguardConfig::from_yaml(disabled).is_ok());
    }

    #[test]
    fn test_load_policies_from_file() {
        let dir = std::env::temp_dir().join(format!("authguard-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policies.yaml");
        std::fs::write(
            &path,
            "policies:\n  - name: login\n    capacity: 2\n    unit: minute\n",
        )
        .unwrap();

        let yaml = format!("rate_limiting:\n  policies_path: {}\n", path.display());
        let config = AuthguardConfig::from_yaml(&yaml).unwrap();
        let policies = config.load_policies().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies.resolve("login").unwrap().capacity(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_policy_file() {
        let mut config = AuthguardConfig::default();
        config.rate_limiting.policies_path = Some("/nonexistent/authguard/policies.yaml".to_string());
        assert!(matches!(config.load_policies(), Err(AuthguardError::Io(_))));
    }
}
