//! Policy file loading.
//!
//! Policies can be declared in YAML instead of using the built-in set:
//!
//! ```yaml
//! policies:
//!   - name: login
//!     capacity: 5
//!     interval: 15
//!     unit: minute
//!   - name: resendVerification
//!     capacity: 3
//!     unit: hour
//!     identity: email
//!     aliases: [resend-verification]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::policy::{IdentitySource, Policy, PolicySet};
use crate::error::{AuthguardError, Result};

/// Contents of a policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// One policy as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Canonical policy name
    pub name: String,
    /// Bucket capacity
    pub capacity: u32,
    /// Tokens added per elapsed interval; defaults to `capacity`
    #[serde(default)]
    pub refill_amount: Option<u32>,
    /// Number of `unit`s in one refill interval
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Which caller attribute buckets are keyed on
    #[serde(default)]
    pub identity: IdentitySource,
    /// Alternative names
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_interval() -> u64 {
    1
}

/// Time unit for refill intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl PolicyRule {
    /// Convert to a validated policy.
    pub fn to_policy(&self) -> Result<Policy> {
        let count = u32::try_from(self.interval).map_err(|_| AuthguardError::InvalidPolicy {
            name: self.name.clone(),
            reason: format!("interval {} is too large", self.interval),
        })?;
        let refill_interval = self
            .unit
            .duration()
            .checked_mul(count)
            .ok_or_else(|| AuthguardError::InvalidPolicy {
                name: self.name.clone(),
                reason: "refill interval overflows".to_string(),
            })?;

        let policy = Policy::new(
            self.name.clone(),
            self.capacity,
            self.refill_amount.unwrap_or(self.capacity),
            refill_interval,
        )?
        .with_identity_source(self.identity)
        .with_aliases(self.aliases.iter().cloned());

        policy.validate()?;
        Ok(policy)
    }
}

impl PolicyFile {
    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AuthguardError::Config(format!("Failed to parse policy file: {}", e)))
    }

    /// Validate every rule and build the policy set.
    pub fn into_policy_set(self) -> Result<PolicySet> {
        if self.policies.is_empty() {
            return Err(AuthguardError::Config(
                "policy file declares no policies".to_string(),
            ));
        }

        let policies = self
            .policies
            .iter()
            .map(PolicyRule::to_policy)
            .collect::<Result<Vec<_>>>()?;
        PolicySet::new(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy_file() {
        let yaml = r#"
policies:
  - name: login
    capacity: 5
    interval: 15
    unit: minute
  - name: resendVerification
    capacity: 3
    unit: hour
    identity: email
    aliases: [resend-verification]
"#;
        let set = PolicyFile::from_yaml(yaml).unwrap().into_policy_set().unwrap();
        assert_eq!(set.len(), 2);

        let login = set.resolve("login").unwrap();
        assert_eq!(login.capacity(), 5);
        assert_eq!(login.refill_amount(), 5);
        assert_eq!(login.refill_interval(), Duration::from_secs(900));
        assert_eq!(login.identity_source(), IdentitySource::ClientIp);

        let resend = set.resolve("resend-verification").unwrap();
        assert_eq!(resend.name(), "resendVerification");
        assert_eq!(resend.refill_interval(), Duration::from_secs(3600));
        assert_eq!(resend.identity_source(), IdentitySource::Email);
    }

    #[test]
    fn test_explicit_refill_amount() {
        let yaml = r#"
policies:
  - name: api
    capacity: 10
    refill_amount: 2
    unit: second
"#;
        let set = PolicyFile::from_yaml(yaml).unwrap().into_policy_set().unwrap();
        let api = set.resolve("api").unwrap();
        assert_eq!(api.capacity(), 10);
        assert_eq!(api.refill_amount(), 2);
        assert_eq!(api.refill_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let zero_capacity = r#"
policies:
  - name: login
    capacity: 0
    unit: minute
"#;
        let err = PolicyFile::from_yaml(zero_capacity)
            .unwrap()
            .into_policy_set()
            .unwrap_err();
        assert!(matches!(err, AuthguardError::InvalidPolicy { .. }));

        let zero_interval = r#"
policies:
  - name: login
    capacity: 5
    interval: 0
    unit: minute
"#;
        assert!(PolicyFile::from_yaml(zero_interval)
            .unwrap()
            .into_policy_set()
            .is_err());

        let duplicate = r#"
policies:
  - name: login
    capacity: 5
    unit: minute
  - name: Login
    capacity: 3
    unit: hour
"#;
        assert!(PolicyFile::from_yaml(duplicate)
            .unwrap()
            .into_policy_set()
            .is_err());
    }

    #[test]
    fn test_empty_file_rejected() {
        let err = PolicyFile::from_yaml("policies: []")
            .unwrap()
            .into_policy_set()
            .unwrap_err();
        assert!(matches!(err, AuthguardError::Config(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = PolicyFile::from_yaml("policies: [name: login").unwrap_err();
        assert!(matches!(err, AuthguardError::Config(_)));

        let unknown_unit = r#"
policies:
  - name: login
    capacity: 5
    unit: fortnight
"#;
        assert!(PolicyFile::from_yaml(unknown_unit).is_err());
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
