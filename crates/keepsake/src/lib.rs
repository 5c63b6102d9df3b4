//! Response caching on top of [`keepsake_store`].
//!
//! A [`CacheEngine`] runs each request under a [`Strategy`]: serve a fresh
//! cached response, go to the network, or both, and write successful
//! network responses back to a disk-backed [`ResponseCache`].

pub mod codec;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod key;
pub mod message;
pub mod policy;
pub mod record;
pub mod response_cache;
pub mod strategy;

pub use codec::{JsonPayloadCodec, PayloadCodec, RawPayloadCodec};
pub use config::{CacheConfig, CodecKind, FileLockingMode};
pub use delivery::{
    CallHandle, Delivery, DeliveryExecutor, InlineExecutor, QueuedExecutor, TaskQueue,
};
pub use engine::{describe_metrics, CacheEngine, NetworkExecutor};
pub use error::{ConfigError, EngineError, NetworkError, RecordError};
pub use expiry::{is_fresh, Clock, ManualClock, SystemClock, TimeUnit, Ttl};
pub use key::{CacheKey, CacheKeyer, IgnoreList, KeyConfig};
pub use message::{CacheRequest, HttpResponse, RequestBody, ResponseSource, TlsInfo};
pub use policy::{CallPolicy, PolicySpec, PolicyTable, RouteRule, Timeouts};
pub use record::CachedResponseRecord;
pub use response_cache::{CachedResponse, ResponseCache};
pub use strategy::Strategy;
