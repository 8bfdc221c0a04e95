//! Rate limit policy definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AuthguardError, Result};

/// Canonical names of the built-in policies.
pub mod names {
    pub const LOGIN: &str = "login";
    pub const SIGNUP: &str = "signup";
    pub const PASSWORD_CHANGE: &str = "passwordChange";
    pub const EMAIL_VERIFICATION: &str = "emailVerification";
    pub const RESEND_VERIFICATION: &str = "resendVerification";
}

/// Which attribute of the caller a policy keys its buckets on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// The client IP address, as extracted by the request layer
    #[default]
    ClientIp,
    /// The email address submitted with the request
    Email,
}

impl IdentitySource {
    /// Pick the identity string for this source out of a caller.
    pub fn select<'a>(&self, caller: &'a Caller) -> Option<&'a str> {
        match self {
            IdentitySource::ClientIp => Some(caller.client_ip.as_str()),
            IdentitySource::Email => caller.email.as_deref(),
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::ClientIp => write!(f, "client_ip"),
            IdentitySource::Email => write!(f, "email"),
        }
    }
}

/// The identifying attributes of whoever is attempting an action.
///
/// Values are opaque; any normalization happens before they get here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub client_ip: String,
    pub email: Option<String>,
}

impl Caller {
    pub fn new(client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Immutable description of one limit.
///
/// A bucket under this policy starts with `capacity` tokens and receives
/// `refill_amount` tokens (capped at `capacity`) each time a full
/// `refill_interval` elapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    name: String,
    capacity: u32,
    refill_amount: u32,
    #[serde(rename = "refill_interval_secs", with = "duration_secs")]
    refill_interval: Duration,
    identity_source: IdentitySource,
    aliases: Vec<String>,
}

impl Policy {
    /// Create a validated policy keyed by client IP.
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        refill_amount: u32,
        refill_interval: Duration,
    ) -> Result<Self> {
        let policy = Self {
            name: name.into(),
            capacity,
            refill_amount,
            refill_interval,
            identity_source: IdentitySource::ClientIp,
            aliases: Vec::new(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Key this policy's buckets on a different caller attribute.
    pub fn with_identity_source(mut self, source: IdentitySource) -> Self {
        self.identity_source = source;
        self
    }

    /// Add alternative names this policy answers to.
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Check the policy invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AuthguardError::InvalidPolicy {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.capacity == 0 {
            return Err(invalid("capacity must be greater than zero"));
        }
        if self.refill_amount == 0 {
            return Err(invalid("refill amount must be greater than zero"));
        }
        if self.refill_amount > self.capacity {
            return Err(invalid("refill amount must not exceed capacity"));
        }
        if self.refill_interval.is_zero() {
            return Err(invalid("refill interval must be greater than zero"));
        }
        // Window arithmetic is done in u64 nanoseconds.
        if self.refill_interval.as_nanos() > u128::from(u64::MAX) {
            return Err(invalid("refill interval is too large"));
        }
        if self.aliases.iter().any(|a| a.trim().is_empty()) {
            return Err(invalid("aliases must not be empty"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_amount(&self) -> u32 {
        self.refill_amount
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn identity_source(&self) -> IdentitySource {
        self.identity_source
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Whether `name` refers to this policy, by canonical name or alias.
    ///
    /// Matching ignores ASCII case.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Number of refill intervals an empty bucket needs to become full again.
    pub fn intervals_to_full(&self) -> u32 {
        self.capacity.div_ceil(self.refill_amount)
    }

    /// The five built-in authentication policies.
    pub fn defaults() -> Vec<Policy> {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;

        let builtin = |name: &str, amount: u32, secs: u64| Policy {
            name: name.to_string(),
            capacity: amount,
            refill_amount: amount,
            refill_interval: Duration::from_secs(secs),
            identity_source: IdentitySource::ClientIp,
            aliases: Vec::new(),
        };

        vec![
            builtin(names::LOGIN, 5, 15 * MINUTE),
            builtin(names::SIGNUP, 3, HOUR),
            builtin(names::PASSWORD_CHANGE, 3, 15 * MINUTE).with_aliases(["password"]),
            builtin(names::EMAIL_VERIFICATION, 10, HOUR).with_aliases(["email-verification"]),
            builtin(names::RESEND_VERIFICATION, 3, HOUR)
                .with_identity_source(IdentitySource::Email)
                .with_aliases(["resend-verification"]),
        ]
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// A validated, immutable collection of policies.
///
/// Names and aliases are unique across the whole set, ignoring ASCII case.
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: Vec<Arc<Policy>>,
}

impl PolicySet {
    /// Build a set, validating each policy and rejecting name collisions.
    pub fn new(policies: Vec<Policy>) -> Result<Self> {
        let mut seen: Vec<String> = Vec::new();

        for policy in &policies {
            policy.validate()?;
            for name in std::iter::once(&policy.name).chain(policy.aliases.iter()) {
                let lowered = name.to_ascii_lowercase();
                if seen.contains(&lowered) {
                    return Err(AuthguardError::InvalidPolicy {
                        name: policy.name.clone(),
                        reason: format!("name or alias '{}' is already in use", name),
                    });
                }
                seen.push(lowered);
            }
        }

        Ok(Self {
            policies: policies.into_iter().map(Arc::new).collect(),
        })
    }

    /// Find a policy by canonical name or alias.
    pub fn resolve(&self, name: &str) -> Option<&Arc<Policy>> {
        self.policies.iter().find(|p| p.answers_to(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: Policy::defaults().into_iter().map(Arc::new).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies_match_published_limits() {
        let set = PolicySet::default();
        assert_eq!(set.len(), 5);

        let expect = |name: &str, capacity: u32, secs: u64, source: IdentitySource| {
            let policy = set.resolve(name).unwrap();
            assert_eq!(policy.capacity(), capacity, "{}", name);
            assert_eq!(policy.refill_amount(), capacity, "{}", name);
            assert_eq!(policy.refill_interval(), Duration::from_secs(secs), "{}", name);
            assert_eq!(policy.identity_source(), source, "{}", name);
        };

        expect(names::LOGIN, 5, 900, IdentitySource::ClientIp);
        expect(names::SIGNUP, 3, 3600, IdentitySource::ClientIp);
        expect(names::PASSWORD_CHANGE, 3, 900, IdentitySource::ClientIp);
        expect(names::EMAIL_VERIFICATION, 10, 3600, IdentitySource::ClientIp);
        expect(names::RESEND_VERIFICATION, 3, 3600, IdentitySource::Email);
    }

    #[test]
    fn test_default_set_passes_validation() {
        assert!(PolicySet::new(Policy::defaults()).is_ok());
    }

    #[test]
    fn test_resolve_by_alias_ignores_case() {
        let set = PolicySet::default();
        assert_eq!(set.resolve("password").unwrap().name(), names::PASSWORD_CHANGE);
        assert_eq!(set.resolve("PASSWORDCHANGE").unwrap().name(), names::PASSWORD_CHANGE);
        assert_eq!(
            set.resolve("Resend-Verification").unwrap().name(),
            names::RESEND_VERIFICATION
        );
        assert!(set.resolve("comments").is_none());
    }

    #[test]
    fn test_policy_validation() {
        let hour = Duration::from_secs(3600);
        assert!(Policy::new("ok", 3, 3, hour).is_ok());
        assert!(Policy::new("ok", 10, 1, hour).is_ok());

        assert!(matches!(
            Policy::new("zero", 0, 0, hour),
            Err(AuthguardError::InvalidPolicy { .. })
        ));
        assert!(Policy::new("no-refill", 3, 0, hour).is_err());
        assert!(Policy::new("over", 3, 4, hour).is_err());
        assert!(Policy::new("instant", 3, 3, Duration::ZERO).is_err());
        assert!(Policy::new("  ", 3, 3, hour).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let hour = Duration::from_secs(3600);
        let a = Policy::new("login", 5, 5, hour).unwrap();
        let b = Policy::new("LOGIN", 3, 3, hour).unwrap();
        assert!(PolicySet::new(vec![a.clone(), b]).is_err());

        let c = Policy::new("signin", 3, 3, hour).unwrap().with_aliases(["login"]);
        assert!(PolicySet::new(vec![a, c]).is_err());
    }

    #[test]
    fn test_identity_source_select() {
        let caller = Caller::new("10.0.0.1");
        assert_eq!(IdentitySource::ClientIp.select(&caller), Some("10.0.0.1"));
        assert_eq!(IdentitySource::Email.select(&caller), None);

        let caller = caller.with_email("user@example.com");
        assert_eq!(IdentitySource::Email.select(&caller), Some("user@example.com"));
    }

    #[test]
    fn test_intervals_to_full() {
        let hour = Duration::from_secs(3600);
        assert_eq!(Policy::new("a", 5, 5, hour).unwrap().intervals_to_full(), 1);
        assert_eq!(Policy::new("b", 10, 3, hour).unwrap().intervals_to_full(), 4);
    }
}
