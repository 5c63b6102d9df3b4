//! Cache/network strategy engine.
//!
//! Each dispatched call runs as its own task. Disk work (lookups, expiry
//! removal, write-back) runs on the blocking pool; the network leg goes
//! through a [`NetworkExecutor`]. Deliveries flow to the caller's
//! [`CallHandle`] and the channel closes only after write-back finished.

use crate::delivery::{self, CallHandle, Delivery, Deliverer};
use crate::error::{EngineError, NetworkError, RecordError};
use crate::expiry::{is_fresh, Clock, SystemClock};
use crate::key::{CacheKey, CacheKeyer, IgnoreList};
use crate::message::{CacheRequest, HttpResponse, ResponseSource};
use crate::policy::{CallPolicy, Timeouts};
use crate::response_cache::{CachedResponse, ResponseCache};
use crate::strategy::Strategy;
use async_trait::async_trait;
use http::StatusCode;
use metrics::{counter, describe_counter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Performs the actual HTTP exchange.
#[async_trait]
pub trait NetworkExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        request: CacheRequest,
        timeouts: Timeouts,
    ) -> Result<HttpResponse, NetworkError>;
}

/// Register descriptions for the engine's counters.
pub fn describe_metrics() {
    describe_counter!("keepsake_cache_hits_total", "Fresh cache entries found");
    describe_counter!(
        "keepsake_cache_misses_total",
        "Lookups that found nothing usable, including expired and unreadable entries"
    );
    describe_counter!("keepsake_network_calls_total", "Requests sent to the network executor");
    describe_counter!("keepsake_write_backs_total", "Network responses stored in the cache");
    describe_counter!("keepsake_deliveries_total", "Results delivered to callers, by source");
}

#[derive(Clone)]
pub struct CacheEngine {
    cache: Arc<ResponseCache>,
    keyer: Arc<CacheKeyer>,
    clock: Arc<dyn Clock>,
}

impl CacheEngine {
    pub fn new(cache: ResponseCache, keyer: CacheKeyer) -> Self {
        Self {
            cache: Arc::new(cache),
            keyer: Arc::new(keyer),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn keyer(&self) -> &CacheKeyer {
        &self.keyer
    }

    /// Key this engine would use for `request` under `policy`.
    pub fn key_for(&self, request: &CacheRequest, policy: &CallPolicy) -> CacheKey {
        let ignored = self.keyer.ignore_list(&policy.ignored_keys);
        self.keyer.compute_key(request, &ignored)
    }

    /// Start a call. Must be called from within a Tokio runtime.
    pub fn dispatch(
        &self,
        request: CacheRequest,
        policy: CallPolicy,
        executor: Arc<dyn NetworkExecutor>,
    ) -> Result<CallHandle, EngineError> {
        let strategy = policy.strategy.check_implemented()?;
        let ignored = self.keyer.ignore_list(&policy.ignored_keys);
        let key = self.keyer.compute_key(&request, &ignored);
        let (deliverer, mut handle) = delivery::channel(strategy);

        debug!(%strategy, key = %key, url = %request.url, "dispatching call");
        let call = Call {
            engine: self.clone(),
            request,
            policy,
            ignored,
            key,
            executor,
            deliverer,
        };
        handle.attach(tokio::spawn(call.run()));
        Ok(handle)
    }

    /// Single-result call. Returns once the call, including write-back, is done.
    pub async fn fetch(
        &self,
        request: CacheRequest,
        policy: CallPolicy,
        executor: Arc<dyn NetworkExecutor>,
    ) -> Result<Delivery, EngineError> {
        if policy.strategy.max_deliveries() > 1 {
            return Err(EngineError::MultipleResultsUnsupported(policy.strategy.as_str()));
        }
        let mut handle = self.dispatch(request, policy, executor)?;
        let first = handle.next().await;
        handle.join().await;
        first.ok_or(EngineError::NoDelivery)
    }
}

struct Call {
    engine: CacheEngine,
    request: CacheRequest,
    policy: CallPolicy,
    ignored: IgnoreList,
    key: CacheKey,
    executor: Arc<dyn NetworkExecutor>,
    deliverer: Deliverer,
}

impl Call {
    async fn run(mut self) {
        match self.policy.strategy {
            Strategy::NoCache | Strategy::ForceNetwork => self.network().await,
            Strategy::ForceCache => match self.lookup().await {
                Some(cached) => self.deliver_cached(cached).await,
                None => self.deliverer.deliver(Delivery::NoCachedData).await,
            },
            Strategy::IfCacheElseNetwork => match self.lookup().await {
                Some(cached) => self.deliver_cached(cached).await,
                None => self.network().await,
            },
            Strategy::IfNetworkElseCache => self.network_else_cache().await,
            Strategy::CacheAndNetwork => {
                if let Some(cached) = self.lookup().await {
                    self.deliver_cached(cached).await;
                }
                self.network().await;
            }
            Strategy::CacheAndNetworkDiff => {
                warn!(key = %self.key, "reserved strategy reached the engine");
            }
        }
        debug!(key = %self.key, delivered = self.deliverer.delivered(), "call finished");
    }

    /// Network leg: deliver the outcome, then store a 2xx if the strategy writes back.
    async fn network(&mut self) {
        match self.send().await {
            Ok(response) => {
                let store = self.should_store(&response).then(|| response.clone());
                self.deliverer.deliver(Delivery::Response(response)).await;
                if let Some(response) = store {
                    self.write_back(response).await;
                }
            }
            Err(error) => {
                debug!(key = %self.key, %error, "network call failed");
                self.deliverer.deliver(Delivery::Failure(error)).await;
            }
        }
    }

    async fn network_else_cache(&mut self) {
        let outcome = match self.send().await {
            Ok(response) if response.is_successful() => {
                let store = self.should_store(&response).then(|| response.clone());
                self.deliverer.deliver(Delivery::Response(response)).await;
                if let Some(response) = store {
                    self.write_back(response).await;
                }
                return;
            }
            other => other,
        };

        let cached = self.lookup().await;
        match (cached, outcome) {
            (Some(cached), Ok(network)) if network.status == StatusCode::NOT_MODIFIED => {
                let refreshed = cached.refreshed_response(&network);
                self.refresh(cached, network).await;
                self.deliverer.deliver(Delivery::Response(refreshed)).await;
            }
            (Some(cached), outcome) => {
                match &outcome {
                    Ok(network) => debug!(key = %self.key, status = %network.status, "network not ok, serving cache"),
                    Err(error) => debug!(key = %self.key, %error, "network failed, serving cache"),
                }
                self.deliver_cached(cached).await;
            }
            (None, Ok(network)) => self.deliverer.deliver(Delivery::Response(network)).await,
            (None, Err(error)) => self.deliverer.deliver(Delivery::Failure(error)).await,
        }
    }

    fn should_store(&self, response: &HttpResponse) -> bool {
        response.is_successful() && self.policy.strategy.writes_back()
    }

    async fn deliver_cached(&mut self, cached: CachedResponse) {
        self.deliverer
            .deliver(Delivery::Response(cached.into_response()))
            .await;
    }

    async fn send(&self) -> Result<HttpResponse, NetworkError> {
        counter!("keepsake_network_calls_total").increment(1);
        let clock = &self.engine.clock;
        let sent_at = clock.now_millis();
        let mut response = self
            .executor
            .execute(self.request.clone(), self.policy.timeouts)
            .await?;
        response.sent_at_millis = sent_at;
        response.received_at_millis = clock.now_millis();
        response.source = ResponseSource::Network;
        Ok(response)
    }

    /// Fresh cached response, if any. Stale entries are removed; read
    /// errors count as a miss.
    async fn lookup(&self) -> Option<CachedResponse> {
        let cache = Arc::clone(&self.engine.cache);
        let clock = Arc::clone(&self.engine.clock);
        let key = self.key.clone();
        let request = self.request.clone();
        let ignored = self.ignored.clone();
        let ttl = self.policy.ttl;

        let result = tokio::task::spawn_blocking(move || -> Result<_, RecordError> {
            let Some(cached) = cache.get(&key, &request, &ignored)? else {
                return Ok(None);
            };
            let now = clock.now_millis();
            if is_fresh(cached.received_at_millis(), ttl, now) {
                return Ok(Some(cached));
            }
            debug!(
                key = %key,
                age_ms = now.saturating_sub(cached.received_at_millis()),
                ttl_ms = ttl.as_millis(),
                "cached response expired"
            );
            drop(cached);
            cache.remove(&key)?;
            Ok(None)
        })
        .await;

        let cached = match result {
            Ok(Ok(cached)) => cached,
            Ok(Err(e)) => {
                warn!(key = %self.key, error = %e, "cache read failed, treating as miss");
                None
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "cache lookup task failed");
                None
            }
        };

        if cached.is_some() {
            counter!("keepsake_cache_hits_total").increment(1);
        } else {
            counter!("keepsake_cache_misses_total").increment(1);
        }
        cached
    }

    async fn write_back(&self, response: HttpResponse) {
        let cache = Arc::clone(&self.engine.cache);
        let key = self.key.clone();
        let request = self.request.clone();

        let result =
            tokio::task::spawn_blocking(move || cache.put(&key, &request, &response)).await;
        match result {
            Ok(Ok(true)) => {
                counter!("keepsake_write_backs_total").increment(1);
                debug!(key = %self.key, "stored network response");
            }
            Ok(Ok(false)) => debug!(key = %self.key, "write-back skipped"),
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "write-back failed"),
            Err(e) => warn!(key = %self.key, error = %e, "write-back task failed"),
        }
    }

    /// Rewrite cached metadata after a 304.
    async fn refresh(&self, cached: CachedResponse, network: HttpResponse) {
        let cache = Arc::clone(&self.engine.cache);
        let result =
            tokio::task::spawn_blocking(move || cache.update(&cached, &network)).await;
        match result {
            Ok(Ok(updated)) => debug!(key = %self.key, updated, "revalidated cached response"),
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "cache update failed"),
            Err(e) => warn!(key = %self.key, error = %e, "cache update task failed"),
        }
    }
}
