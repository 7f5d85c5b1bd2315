use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use super::Identity;
use super::limits::RateLimitConfig;
use super::router::EndpointPool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Global default applied when neither token nor department decide.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub departments: Vec<DepartmentConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Ceilings at or above this value mean "no cap".
    #[serde(default = "default_unlimited_sentinel")]
    pub unlimited_sentinel: u64,
}

fn default_unlimited_sentinel() -> u64 {
    999_999_999
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            unlimited_sentinel: default_unlimited_sentinel(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepartmentConfig {
    pub id: String,
    #[serde(default)]
    pub rate_limit_enabled: bool,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_output_tokens: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_output_tokens: Option<u64>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub id: String,
    pub secret: String,
    pub user_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_output_tokens: Option<u64>,
}

impl TokenConfig {
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            user_id: user_id.into(),
            enabled: true,
            rate_limits: RateLimitConfig::default(),
            monthly_output_tokens: None,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("enabled", &self.enabled)
            .field("rate_limits", &self.rate_limits)
            .field("monthly_output_tokens", &self.monthly_output_tokens)
            .finish()
    }
}

/// A logical model. Its own endpoint is the primary pool member; `sub_models`
/// are interchangeable replicas used for load distribution and failover.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub sub_models: Vec<SubModelConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubModelConfig {
    pub id: String,
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Model name sent upstream when it differs from the gateway model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: String::new(),
            headers: BTreeMap::new(),
            upstream_model: None,
            sort_order: 0,
            enabled: true,
        }
    }
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("headers", &"<redacted>")
            .field("upstream_model", &self.upstream_model)
            .field("sort_order", &self.sort_order)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Upper bound for the doubled cooldown after failed half-open probes.
    #[serde(default = "default_max_cooldown_seconds")]
    pub max_cooldown_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_max_cooldown_seconds() -> u64 {
    10 * 60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            max_cooldown_seconds: default_max_cooldown_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Caps endpoint attempts per request; `None` tries the whole pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
}

fn default_request_timeout_seconds() -> u64 {
    120
}

fn default_probe_timeout_seconds() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Admit unmetered traffic when the counter store is down.
    #[serde(default)]
    pub fail_open: bool,
}

/// Indexed, validated view of a [`GatewayConfig`].
#[derive(Debug)]
pub struct ConfigSnapshot {
    config: GatewayConfig,
    departments: HashMap<String, usize>,
    users: HashMap<String, usize>,
    tokens: HashMap<String, usize>,
    tokens_by_secret: HashMap<String, usize>,
    pools: HashMap<String, EndpointPool>,
}

impl ConfigSnapshot {
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if config.upstream.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "upstream.max_attempts must be at least 1".to_string(),
            ));
        }

        let departments = index_by(&config.departments, "department", |d| d.id.as_str())?;
        let users = index_by(&config.users, "user", |u| u.id.as_str())?;
        let tokens = index_by(&config.tokens, "token", |t| t.id.as_str())?;

        let mut tokens_by_secret = HashMap::with_capacity(config.tokens.len());
        for (idx, token) in config.tokens.iter().enumerate() {
            if token.secret.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "token {} has an empty secret",
                    token.id
                )));
            }
            if tokens_by_secret.insert(token.secret.clone(), idx).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "token {} reuses another token's secret",
                    token.id
                )));
            }
        }

        let mut pools = HashMap::with_capacity(config.models.len());
        let mut endpoint_ids = HashSet::new();
        for model in &config.models {
            let pool = EndpointPool::from_model(model);
            for member in pool.members() {
                if !endpoint_ids.insert(member.endpoint_id.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate endpoint id: {}",
                        member.endpoint_id
                    )));
                }
            }
            if pools.insert(model.id.clone(), pool).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model id: {}",
                    model.id
                )));
            }
        }

        Ok(Self {
            config,
            departments,
            users,
            tokens,
            tokens_by_secret,
            pools,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn department(&self, id: &str) -> Option<&DepartmentConfig> {
        self.departments
            .get(id)
            .map(|idx| &self.config.departments[*idx])
    }

    pub fn user(&self, id: &str) -> Option<&UserConfig> {
        self.users.get(id).map(|idx| &self.config.users[*idx])
    }

    pub fn token(&self, id: &str) -> Option<&TokenConfig> {
        self.tokens.get(id).map(|idx| &self.config.tokens[*idx])
    }

    pub fn token_by_secret(&self, secret: &str) -> Option<&TokenConfig> {
        self.tokens_by_secret
            .get(secret)
            .map(|idx| &self.config.tokens[*idx])
    }

    pub fn pool(&self, model_id: &str) -> Option<&EndpointPool> {
        self.pools.get(model_id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &EndpointPool> {
        self.pools.values()
    }

    /// Builds the caller identity for an enabled token.
    pub fn identity_for_token(&self, token_id: &str) -> Option<Identity> {
        self.token(token_id)
            .filter(|token| token.enabled)
            .map(|token| self.identity_of(token))
    }

    pub fn identity_for_secret(&self, secret: &str) -> Option<Identity> {
        self.token_by_secret(secret)
            .filter(|token| token.enabled)
            .map(|token| self.identity_of(token))
    }

    fn identity_of(&self, token: &TokenConfig) -> Identity {
        let department_id = self
            .user(&token.user_id)
            .and_then(|user| user.department_id.clone());
        Identity {
            token_id: token.id.clone(),
            user_id: token.user_id.clone(),
            department_id,
        }
    }
}

fn index_by<T>(
    items: &[T],
    kind: &str,
    id: impl Fn(&T) -> &str,
) -> Result<HashMap<String, usize>, ConfigError> {
    let mut out = HashMap::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let id = id(item);
        if id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{kind} id must not be empty")));
        }
        if out.insert(id.to_string(), idx).is_some() {
            return Err(ConfigError::Invalid(format!("duplicate {kind} id: {id}")));
        }
    }
    Ok(out)
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<GatewayConfig, ConfigError>;
}

#[derive(Clone, Debug)]
pub struct StaticConfigSource {
    config: GatewayConfig,
}

impl StaticConfigSource {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<GatewayConfig, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Reads the config file on every load; the format follows the extension.
#[derive(Clone, Debug)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<GatewayConfig, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_config(&self.path, &raw)
    }
}

pub fn parse_config(path: &Path, raw: &str) -> Result<GatewayConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(raw).map_err(|err| parse_err(err.to_string())),
        #[cfg(feature = "gateway-config-yaml")]
        Some("yaml" | "yml") => serde_yaml::from_str(raw).map_err(|err| parse_err(err.to_string())),
        #[cfg(not(feature = "gateway-config-yaml"))]
        Some("yaml" | "yml") => Err(parse_err(
            "yaml config requires the gateway-config-yaml feature".to_string(),
        )),
        _ => toml::from_str(raw).map_err(|err| parse_err(err.to_string())),
    }
}

struct CachedSnapshot {
    snapshot: Arc<ConfigSnapshot>,
    // `None` forces a reload on the next read.
    fetched_at: Option<Instant>,
}

impl CachedSnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

/// Short-TTL cache in front of a [`ConfigSource`], so admission does not hit
/// the admin store on every request.
pub struct CachedConfig {
    source: Arc<dyn ConfigSource>,
    ttl: Duration,
    state: RwLock<CachedSnapshot>,
}

impl CachedConfig {
    pub async fn load(source: Arc<dyn ConfigSource>, ttl: Duration) -> Result<Self, ConfigError> {
        let snapshot = ConfigSnapshot::new(source.load().await?)?;
        Ok(Self {
            source,
            ttl,
            state: RwLock::new(CachedSnapshot {
                snapshot: Arc::new(snapshot),
                fetched_at: Some(Instant::now()),
            }),
        })
    }

    /// A cache that never refreshes.
    pub fn fixed(config: GatewayConfig) -> Result<Self, ConfigError> {
        let snapshot = ConfigSnapshot::new(config.clone())?;
        Ok(Self {
            source: Arc::new(StaticConfigSource::new(config)),
            ttl: Duration::MAX,
            state: RwLock::new(CachedSnapshot {
                snapshot: Arc::new(snapshot),
                fetched_at: Some(Instant::now()),
            }),
        })
    }

    pub async fn snapshot(&self) -> Arc<ConfigSnapshot> {
        {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                return state.snapshot.clone();
            }
        }

        let mut state = self.state.write().await;
        if state.is_fresh(self.ttl) {
            return state.snapshot.clone();
        }

        match self
            .source
            .load()
            .await
            .and_then(ConfigSnapshot::new)
        {
            Ok(snapshot) => {
                tracing::debug!("gateway config refreshed");
                state.snapshot = Arc::new(snapshot);
            }
            Err(err) => {
                tracing::warn!(error = %err, "config refresh failed; keeping previous snapshot");
            }
        }
        state.fetched_at = Some(Instant::now());
        state.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = r#"
[rate_limits]
rpm = 100

[budget]
unlimited_sentinel = 1000000

[[departments]]
id = "eng"
rate_limit_enabled = true
rate_limits = { rpm = 40 }
monthly_output_tokens = 500000

[[users]]
id = "alice"
department_id = "eng"

[[tokens]]
id = "tok-1"
secret = "sk-alice"
user_id = "alice"
rate_limits = { rpm = 10 }

[[models]]
id = "gpt-4o"
url = "http://primary.local/v1/chat/completions"
api_key = "k1"

[[models.sub_models]]
id = "gpt-4o-replica"
url = "http://replica.local/v1/chat/completions"
sort_order = 1
"#;

    #[test]
    fn parses_toml_and_derives_identity() {
        let config = parse_config(Path::new("gateway.toml"), SAMPLE).expect("parse");
        let snapshot = ConfigSnapshot::new(config).expect("snapshot");

        let identity = snapshot.identity_for_secret("sk-alice").expect("identity");
        assert_eq!(identity.token_id, "tok-1");
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.department_id.as_deref(), Some("eng"));

        let pool = snapshot.pool("gpt-4o").expect("pool");
        assert_eq!(pool.members().len(), 2);
        assert_eq!(pool.members()[0].endpoint_id, "gpt-4o");
        assert_eq!(snapshot.config().budget.unlimited_sentinel, 1_000_000);
    }

    #[test]
    fn example_config_is_valid() {
        let raw = include_str!("../../tollgate.example.toml");
        let config = parse_config(Path::new("tollgate.example.toml"), raw).expect("parse");
        let snapshot = ConfigSnapshot::new(config).expect("snapshot");
        let identity = snapshot
            .identity_for_secret("sk-tollgate-alice")
            .expect("identity");
        assert_eq!(identity.department_id.as_deref(), Some("research"));
        assert_eq!(snapshot.pool("gpt-4o").expect("pool").members().len(), 2);
    }

    #[test]
    fn disabled_token_has_no_identity() {
        let mut config = GatewayConfig::default();
        let mut token = TokenConfig::new("tok-1", "sk-1", "bob");
        token.enabled = false;
        config.tokens.push(token);
        let snapshot = ConfigSnapshot::new(config).expect("snapshot");
        assert!(snapshot.identity_for_secret("sk-1").is_none());
    }

    #[test]
    fn rejects_duplicate_endpoint_ids() {
        let mut config = GatewayConfig::default();
        config.models.push(ModelConfig {
            id: "m".to_string(),
            endpoint: EndpointConfig::new("http://a"),
            sub_models: vec![SubModelConfig {
                id: "m".to_string(),
                endpoint: EndpointConfig::new("http://b"),
            }],
        });
        let err = ConfigSnapshot::new(config).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate endpoint id"));
    }

    #[test]
    fn token_debug_redacts_secret() {
        let token = TokenConfig::new("tok-1", "sk-very-secret", "alice");
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("sk-very-secret"));
    }

    struct CountingSource {
        loads: AtomicUsize,
        fail_after_first: bool,
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn load(&self) -> Result<GatewayConfig, ConfigError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_first && n > 0 {
                return Err(ConfigError::Invalid("store offline".to_string()));
            }
            let mut config = GatewayConfig::default();
            config.rate_limits.rpm = Some(n as u64 + 1);
            Ok(config)
        }
    }

    #[tokio::test]
    async fn cached_config_reuses_snapshot_within_ttl() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            fail_after_first: false,
        });
        let cache = CachedConfig::load(source.clone(), Duration::from_secs(60))
            .await
            .expect("load");
        let _ = cache.snapshot().await;
        let _ = cache.snapshot().await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_config_keeps_last_good_snapshot_on_refresh_failure() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            fail_after_first: true,
        });
        let cache = CachedConfig::load(source.clone(), Duration::ZERO)
            .await
            .expect("load");
        let snapshot = cache.snapshot().await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.config().rate_limits.rpm, Some(1));
    }
}
