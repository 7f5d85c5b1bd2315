use std::collections::BTreeMap;

use serde::Serialize;

use super::config::{EndpointConfig, ModelConfig};
use super::health::HealthRegistry;

/// One upstream replica of a logical model.
#[derive(Clone, Serialize)]
pub struct EndpointMember {
    pub endpoint_id: String,
    pub url: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    pub sort_order: i32,
    pub enabled: bool,
}

impl EndpointMember {
    fn from_config(endpoint_id: &str, endpoint: &EndpointConfig) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            url: endpoint.url.clone(),
            api_key: endpoint.api_key.clone(),
            headers: endpoint.headers.clone(),
            upstream_model: endpoint.upstream_model.clone(),
            sort_order: endpoint.sort_order,
            enabled: endpoint.enabled,
        }
    }
}

impl std::fmt::Debug for EndpointMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointMember")
            .field("endpoint_id", &self.endpoint_id)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("upstream_model", &self.upstream_model)
            .field("sort_order", &self.sort_order)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Member 0 is the model's own definition; the rest are its sub-models in
/// configuration order.
#[derive(Clone, Debug, Serialize)]
pub struct EndpointPool {
    pub model_id: String,
    members: Vec<EndpointMember>,
}

impl EndpointPool {
    pub fn new(model_id: impl Into<String>, members: Vec<EndpointMember>) -> Self {
        Self {
            model_id: model_id.into(),
            members,
        }
    }

    pub fn from_model(model: &ModelConfig) -> Self {
        let mut members = Vec::with_capacity(1 + model.sub_models.len());
        members.push(EndpointMember::from_config(&model.id, &model.endpoint));
        members.extend(
            model
                .sub_models
                .iter()
                .map(|sub| EndpointMember::from_config(&sub.id, &sub.endpoint)),
        );
        Self::new(model.id.clone(), members)
    }

    pub fn members(&self) -> &[EndpointMember] {
        &self.members
    }

    pub fn member(&self, endpoint_id: &str) -> Option<&EndpointMember> {
        self.members
            .iter()
            .find(|member| member.endpoint_id == endpoint_id)
    }
}

/// Ranks a pool for one request. Selection reads health but never writes it.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointSelector;

impl EndpointSelector {
    /// Enabled and eligible members, lowest `sort_order` first. Ties keep pool
    /// order, so the primary wins against an equally ranked replica.
    pub fn candidates<'a>(
        &self,
        pool: &'a EndpointPool,
        health: &HealthRegistry,
        now_ms: i64,
    ) -> Vec<&'a EndpointMember> {
        let mut out: Vec<&EndpointMember> = pool
            .members
            .iter()
            .filter(|member| member.enabled && health.is_eligible(&member.endpoint_id, now_ms))
            .collect();
        out.sort_by_key(|member| member.sort_order);
        out
    }

    pub fn select<'a>(
        &self,
        pool: &'a EndpointPool,
        health: &HealthRegistry,
        now_ms: i64,
    ) -> Option<&'a EndpointMember> {
        self.candidates(pool, health, now_ms).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::config::{CircuitBreakerConfig, SubModelConfig};

    fn endpoint(url: &str, sort_order: i32) -> EndpointConfig {
        let mut endpoint = EndpointConfig::new(url);
        endpoint.sort_order = sort_order;
        endpoint
    }

    fn pool() -> EndpointPool {
        EndpointPool::from_model(&ModelConfig {
            id: "gpt".to_string(),
            endpoint: endpoint("http://primary", 5),
            sub_models: vec![
                SubModelConfig {
                    id: "gpt-b".to_string(),
                    endpoint: endpoint("http://b", 1),
                },
                SubModelConfig {
                    id: "gpt-c".to_string(),
                    endpoint: endpoint("http://c", 5),
                },
            ],
        })
    }

    fn ids(members: Vec<&EndpointMember>) -> Vec<&str> {
        members
            .into_iter()
            .map(|member| member.endpoint_id.as_str())
            .collect()
    }

    #[test]
    fn candidates_sort_by_order_and_keep_pool_order_on_ties() {
        let pool = pool();
        let health = HealthRegistry::new();
        let got = EndpointSelector.candidates(&pool, &health, 0);
        assert_eq!(ids(got), vec!["gpt-b", "gpt", "gpt-c"]);
    }

    #[test]
    fn disabled_and_cooling_members_are_skipped() {
        let mut pool = pool();
        pool.members[1].enabled = false;
        let health = HealthRegistry::new();
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        health.record_failure("gpt", 0, &breaker, "boom");

        let got = EndpointSelector.candidates(&pool, &health, 1_000);
        assert_eq!(ids(got), vec!["gpt-c"]);
        assert_eq!(
            EndpointSelector
                .select(&pool, &health, 1_000)
                .map(|m| m.endpoint_id.as_str()),
            Some("gpt-c")
        );
    }

    #[test]
    fn api_key_is_not_rendered() {
        let mut config = endpoint("http://a", 0);
        config.api_key = "sk-upstream".to_string();
        let member = EndpointMember::from_config("a", &config);
        assert!(!format!("{member:?}").contains("sk-upstream"));
        let json = serde_json::to_string(&member).expect("json");
        assert!(!json.contains("sk-upstream"));
    }
}
