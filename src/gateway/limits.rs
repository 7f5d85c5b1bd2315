use std::fmt;

use serde::{Deserialize, Serialize};

use super::Identity;
use super::config::ConfigSnapshot;

/// A ceiling that is either absent or a concrete count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Bounded(u64),
}

impl Limit {
    /// Rate-limit fields use `0`/absent for "no limit".
    pub fn from_rate(value: Option<u64>) -> Self {
        match value {
            None | Some(0) => Limit::Unlimited,
            Some(n) => Limit::Bounded(n),
        }
    }

    /// Budget ceilings use an absent value or anything at/above the sentinel for "no limit".
    pub fn from_budget(value: Option<u64>, unlimited_sentinel: u64) -> Self {
        match value {
            None => Limit::Unlimited,
            Some(n) if n >= unlimited_sentinel => Limit::Unlimited,
            Some(n) => Limit::Bounded(n),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// True once `used` has reached the ceiling.
    pub fn is_exhausted_by(&self, used: u64) -> bool {
        match self {
            Limit::Unlimited => false,
            Limit::Bounded(limit) => used >= *limit,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => f.write_str("unlimited"),
            Limit::Bounded(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Rpm,
    Tpm,
    Tph,
    Tpd,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Rpm,
        WindowKind::Tpm,
        WindowKind::Tph,
        WindowKind::Tpd,
    ];

    pub const TOKEN_WINDOWS: [WindowKind; 3] = [WindowKind::Tpm, WindowKind::Tph, WindowKind::Tpd];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Rpm => "rpm",
            WindowKind::Tpm => "tpm",
            WindowKind::Tph => "tph",
            WindowKind::Tpd => "tpd",
        }
    }

    pub fn window_seconds(&self) -> u64 {
        match self {
            WindowKind::Rpm | WindowKind::Tpm => 60,
            WindowKind::Tph => 60 * 60,
            WindowKind::Tpd => 24 * 60 * 60,
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tph: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpd: Option<u64>,
}

impl RateLimitConfig {
    pub fn field(&self, window: WindowKind) -> Option<u64> {
        match window {
            WindowKind::Rpm => self.rpm,
            WindowKind::Tpm => self.tpm,
            WindowKind::Tph => self.tph,
            WindowKind::Tpd => self.tpd,
        }
    }
}

/// Which configuration level produced an effective limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Token,
    Department,
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub window: WindowKind,
    pub limit: Limit,
    pub source: LimitSource,
}

/// Merges token overrides, department settings and the global default into
/// the effective limit for one window.
#[derive(Clone, Copy, Debug)]
pub struct LimitResolver<'a> {
    config: &'a ConfigSnapshot,
}

impl<'a> LimitResolver<'a> {
    pub fn new(config: &'a ConfigSnapshot) -> Self {
        Self { config }
    }

    pub fn resolve(&self, identity: &Identity, window: WindowKind) -> ResolvedLimit {
        let token_override = self
            .config
            .token(&identity.token_id)
            .and_then(|token| token.rate_limits.field(window))
            .filter(|value| *value > 0);
        if let Some(value) = token_override {
            return ResolvedLimit {
                window,
                limit: Limit::Bounded(value),
                source: LimitSource::Token,
            };
        }

        let department = identity
            .department_id
            .as_deref()
            .and_then(|id| self.config.department(id))
            .filter(|department| department.rate_limit_enabled);
        if let Some(department) = department {
            return ResolvedLimit {
                window,
                limit: Limit::from_rate(department.rate_limits.field(window)),
                source: LimitSource::Department,
            };
        }

        ResolvedLimit {
            window,
            limit: Limit::from_rate(self.config.config().rate_limits.field(window)),
            source: LimitSource::Global,
        }
    }

    pub fn resolve_all(&self, identity: &Identity) -> [ResolvedLimit; 4] {
        WindowKind::ALL.map(|window| self.resolve(identity, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::config::{DepartmentConfig, GatewayConfig, TokenConfig, UserConfig};

    fn snapshot(department_enabled: bool) -> ConfigSnapshot {
        let mut config = GatewayConfig::default();
        config.rate_limits = RateLimitConfig {
            rpm: Some(100),
            tpm: Some(10_000),
            tph: None,
            tpd: Some(0),
        };
        config.departments.push(DepartmentConfig {
            id: "eng".to_string(),
            rate_limit_enabled: department_enabled,
            rate_limits: RateLimitConfig {
                rpm: Some(50),
                tpm: None,
                tph: Some(7_000),
                tpd: None,
            },
            monthly_output_tokens: None,
        });
        config.users.push(UserConfig {
            id: "alice".to_string(),
            department_id: Some("eng".to_string()),
            monthly_output_tokens: None,
        });
        let mut token = TokenConfig::new("tok-1", "sk-1", "alice");
        token.rate_limits.rpm = Some(10);
        token.rate_limits.tpm = Some(0);
        config.tokens.push(token);
        ConfigSnapshot::new(config).expect("valid config")
    }

    fn identity(snapshot: &ConfigSnapshot) -> Identity {
        snapshot.identity_for_token("tok-1").expect("identity")
    }

    #[test]
    fn token_override_wins_when_non_zero() {
        let snapshot = snapshot(true);
        let resolved = LimitResolver::new(&snapshot).resolve(&identity(&snapshot), WindowKind::Rpm);
        assert_eq!(resolved.limit, Limit::Bounded(10));
        assert_eq!(resolved.source, LimitSource::Token);
    }

    #[test]
    fn zero_token_override_falls_through_to_enabled_department() {
        let snapshot = snapshot(true);
        let resolver = LimitResolver::new(&snapshot);
        let identity = identity(&snapshot);

        // Department is the final level here, so its missing tpm means unlimited.
        let tpm = resolver.resolve(&identity, WindowKind::Tpm);
        assert_eq!(tpm.source, LimitSource::Department);
        assert_eq!(tpm.limit, Limit::Unlimited);

        let tph = resolver.resolve(&identity, WindowKind::Tph);
        assert_eq!(tph.limit, Limit::Bounded(7_000));
    }

    #[test]
    fn disabled_department_falls_back_to_global() {
        let snapshot = snapshot(false);
        let resolver = LimitResolver::new(&snapshot);
        let identity = identity(&snapshot);

        let [rpm, tpm, tph, tpd] = resolver.resolve_all(&identity);
        assert_eq!(rpm.limit, Limit::Bounded(10));
        assert_eq!(tpm.source, LimitSource::Global);
        assert_eq!(tpm.limit, Limit::Bounded(10_000));
        assert_eq!(tph.limit, Limit::Unlimited);
        assert_eq!(tpd.limit, Limit::Unlimited);
    }

    #[test]
    fn budget_sentinel_is_unlimited() {
        assert_eq!(Limit::from_budget(Some(999), 1_000), Limit::Bounded(999));
        assert_eq!(Limit::from_budget(Some(1_000), 1_000), Limit::Unlimited);
        assert_eq!(Limit::from_budget(None, 1_000), Limit::Unlimited);
        assert!(!Limit::Unlimited.is_exhausted_by(u64::MAX));
        assert!(Limit::Bounded(5).is_exhausted_by(5));
        assert!(!Limit::Bounded(5).is_exhausted_by(4));
    }
}
