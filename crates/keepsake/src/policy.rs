//! Per-call cache policy.
//!
//! A [`PolicyTable`] holds a service-level default and route overrides.
//! Resolution precedence is: ignore-cache flag, then the longest matching
//! route, then the default, then built-in defaults (no cache, 24 hours).

use crate::error::ConfigError;
use crate::expiry::{TimeUnit, Ttl};
use crate::strategy::Strategy;
use http::Method;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Network timeouts for one call. Zero means "use the executor default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Timeouts {
    #[serde(default)]
    pub connect: u64,
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
    #[serde(default = "default_timeout_unit")]
    pub unit: TimeUnit,
}

fn default_timeout_unit() -> TimeUnit {
    TimeUnit::Seconds
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: 0,
            read: 0,
            write: 0,
            unit: default_timeout_unit(),
        }
    }
}

impl Timeouts {
    fn get(&self, amount: u64) -> Option<Duration> {
        (amount > 0).then(|| self.unit.to_duration(amount))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.get(self.connect)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.get(self.read)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.get(self.write)
    }
}

/// Fully resolved settings for one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallPolicy {
    pub strategy: Strategy,
    pub ttl: Ttl,
    pub ignored_keys: Vec<String>,
    pub timeouts: Timeouts,
    /// Base URL that replaces the service's default upstream.
    pub upstream: Option<Url>,
}

impl CallPolicy {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_upstream(mut self, upstream: Url) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

/// Partial policy as written in configuration. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub ttl_unit: Option<TimeUnit>,
    #[serde(default)]
    pub ignored_keys: Vec<String>,
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
    /// Bypass the cache entirely, whatever the strategy says.
    #[serde(default)]
    pub ignore_cache: bool,
    /// Base URL (scheme, host, optional path) requests are sent to.
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Matches any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    pub path_prefix: String,
    #[serde(flatten)]
    pub policy: PolicySpec,
}

impl RouteRule {
    fn matches(&self, method: &Method, path: &str) -> bool {
        let method_ok = self
            .method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method.as_str()));
        method_ok && path.starts_with(&self.path_prefix)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    default: PolicySpec,
    routes: Vec<RouteRule>,
}

impl PolicyTable {
    pub fn new(default: PolicySpec, routes: Vec<RouteRule>) -> Self {
        Self { default, routes }
    }

    pub fn routes(&self) -> &[RouteRule] {
        &self.routes
    }

    /// The route that governs `method path`: longest prefix, first declared on ties.
    fn route_for(&self, method: &Method, path: &str) -> Option<&RouteRule> {
        let mut best: Option<&RouteRule> = None;
        for route in self.routes.iter().filter(|r| r.matches(method, path)) {
            if best.map_or(true, |b| route.path_prefix.len() > b.path_prefix.len()) {
                best = Some(route);
            }
        }
        best
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Result<CallPolicy, ConfigError> {
        let empty = PolicySpec::default();
        let route = self.route_for(method, path).map_or(&empty, |r| &r.policy);
        let default = &self.default;

        let strategy = if route.ignore_cache || default.ignore_cache {
            Strategy::NoCache
        } else {
            route
                .strategy
                .or(default.strategy)
                .unwrap_or_default()
                .check_implemented()?
        };

        let builtin = Ttl::default();
        let ttl = Ttl::new(
            route.ttl.or(default.ttl).unwrap_or(builtin.duration),
            route.ttl_unit.or(default.ttl_unit).unwrap_or(builtin.unit),
        );

        let mut ignored_keys = default.ignored_keys.clone();
        for key in &route.ignored_keys {
            if !ignored_keys.contains(key) {
                ignored_keys.push(key.clone());
            }
        }

        let upstream = match route.upstream.as_deref().or(default.upstream.as_deref()) {
            Some(base) => Some(parse_upstream(base)?),
            None => None,
        };

        Ok(CallPolicy {
            strategy,
            ttl,
            ignored_keys,
            timeouts: route.timeouts.or(default.timeouts).unwrap_or_default(),
            upstream,
        })
    }

    /// Resolve every route once so misconfiguration surfaces at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for route in &self.routes {
            let method = match route.method.as_deref() {
                Some(m) => Method::from_bytes(m.as_bytes())
                    .map_err(|_| ConfigError::Invalid(format!("bad method `{m}`")))?,
                None => Method::GET,
            };
            self.resolve(&method, &route.path_prefix)?;
        }
        self.resolve(&Method::GET, "/").map(|_| ())
    }
}

fn parse_upstream(base: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(base)
        .map_err(|e| ConfigError::Invalid(format!("bad upstream `{base}`: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(ConfigError::Invalid(format!("upstream `{base}` is not an http(s) base URL")));
    }
    Ok(url)
}
