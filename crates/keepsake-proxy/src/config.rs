use arc_swap::ArcSwap;
use keepsake::{CacheConfig, PolicySpec, PolicyTable, RouteRule};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Service-level call policy.
    #[serde(default)]
    pub defaults: PolicySpec,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    /// Deadline for calls whose policy sets no timeouts.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Config {
    /// Parse `path` and check that every route resolves.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.policy_table().validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
            defaults: PolicySpec::default(),
            routes: Vec::new(),
        }
    }

    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::new(self.defaults.clone(), self.routes.clone())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            max_request_body_bytes: default_max_request_body(),
        }
    }
}

/// Compare old and new config and apply what is safe at runtime.
///
/// - Defaults or routes changed: swap in the new policy table.
/// - Cache, upstream or listen addresses changed: WARN, ignored until restart.
///
/// Returns true if the policy table was replaced.
pub fn diff_and_apply(old: &Config, new: &Config, policies: &ArcSwap<PolicyTable>) -> bool {
    if old.cache != new.cache {
        tracing::warn!(
            old_dir = %old.cache.directory.display(),
            new_dir = %new.cache.directory.display(),
            "cache section changed, ignoring. Restart to reopen the store"
        );
    }
    if old.upstream != new.upstream {
        tracing::warn!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "upstream change detected, ignoring. Restart to apply"
        );
    }
    if old.server != new.server {
        tracing::warn!("server section changed, ignoring. Restart to rebind");
    }

    if old.defaults == new.defaults && old.routes == new.routes {
        return false;
    }
    let table = new.policy_table();
    if let Err(e) = table.validate() {
        tracing::error!(error = %e, "rejected route table, keeping the previous one");
        return false;
    }
    policies.store(Arc::new(table));
    tracing::info!(
        old_routes = old.routes.len(),
        new_routes = new.routes.len(),
        "config reloaded: route table updated"
    );
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_max_request_body() -> usize {
    1_048_576
}
fn default_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake::Strategy;
    use axum::http::Method;

    const GET: Method = Method::GET;

    const SAMPLE: &str = r#"
        [upstream]
        url = "http://127.0.0.1:3000"

        [cache]
        directory = "/tmp/keepsake"
        max_size_bytes = 1048576

        [defaults]
        strategy = "if_network_else_cache"
        ttl = 1
        ttl_unit = "hours"

        [[routes]]
        path_prefix = "/items"
        strategy = "cache_and_network"
        ignored_keys = ["ts"]

        [[routes]]
        path_prefix = "/search"
        upstream = "http://127.0.0.1:3100"
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.upstream.timeout_ms, 5000);
        assert_eq!(config.cache.max_size_bytes, 1_048_576);

        let table = config.policy_table();
        let policy = table.resolve(&GET, "/items/1").unwrap();
        assert_eq!(policy.strategy, Strategy::CacheAndNetwork);
        assert_eq!(policy.ignored_keys, vec!["ts".to_string()]);
        assert_eq!(
            table.resolve(&GET, "/other").unwrap().strategy,
            Strategy::IfNetworkElseCache
        );
        assert_eq!(table.resolve(&GET, "/other").unwrap().upstream, None);
        let search = table.resolve(&GET, "/search?q=1").unwrap();
        assert_eq!(search.upstream.unwrap().as_str(), "http://127.0.0.1:3100/");
        assert_eq!(search.strategy, Strategy::IfNetworkElseCache);
    }

    #[test]
    fn test_load_rejects_reserved_strategy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[upstream]\nurl = \"http://x\"\n[defaults]\nstrategy = \"cache_and_network_diff\"\n",
        )
        .unwrap();
        assert!(Config::load(&path).is_err());

        std::fs::write(&path, SAMPLE).unwrap();
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn test_diff_and_apply_swaps_routes_only() {
        let old: Config = toml::from_str(SAMPLE).unwrap();
        let policies = ArcSwap::from_pointee(old.policy_table());

        let mut unchanged_routes = old.clone();
        unchanged_routes.cache.max_size_bytes = 1;
        assert!(!diff_and_apply(&old, &unchanged_routes, &policies));

        let mut new = old.clone();
        new.routes[0].policy.strategy = Some(Strategy::ForceCache);
        assert!(diff_and_apply(&old, &new, &policies));
        assert_eq!(
            policies.load().resolve(&GET, "/items").unwrap().strategy,
            Strategy::ForceCache
        );

        let mut broken = new.clone();
        broken.defaults.strategy = Some(Strategy::CacheAndNetworkDiff);
        assert!(!diff_and_apply(&new, &broken, &policies));
        assert_eq!(
            policies.load().resolve(&GET, "/items").unwrap().strategy,
            Strategy::ForceCache
        );
    }
}
