//! HTTP responses stored in a [`DiskLruStore`].
//!
//! Every entry has two slots: the encoded [`CachedResponseRecord`] and the
//! body as produced by the configured [`PayloadCodec`].

use crate::codec::PayloadCodec;
use crate::error::RecordError;
use crate::key::{CacheKey, IgnoreList};
use crate::message::{CacheRequest, HttpResponse};
use crate::record::{has_vary_all, CachedResponseRecord};
use bytes::Bytes;
use keepsake_store::{DiskLruStore, Editor, Snapshot, StoreOptions};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ENTRY_METADATA: usize = 0;
pub const ENTRY_BODY: usize = 1;
pub const ENTRY_COUNT: usize = 2;

pub struct ResponseCache {
    store: DiskLruStore,
    codec: Arc<dyn PayloadCodec>,
}

impl ResponseCache {
    /// Open (or create) the cache. The slot count is always two.
    pub fn open(options: StoreOptions, codec: Arc<dyn PayloadCodec>) -> Result<Self, RecordError> {
        let store = DiskLruStore::open(options.slot_count(ENTRY_COUNT))?;
        Ok(Self { store, codec })
    }

    /// The stored response for `key` if it answers `request`.
    ///
    /// Unreadable records and bodies the codec rejects count as misses.
    pub fn get(
        &self,
        key: &CacheKey,
        request: &CacheRequest,
        ignored: &IgnoreList,
    ) -> Result<Option<CachedResponse>, RecordError> {
        let Some(mut snapshot) = self.store.get(key.as_str())? else {
            return Ok(None);
        };

        let record = match read_record(&mut snapshot) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "unreadable cache record");
                return Ok(None);
            }
        };
        if !record.matches(request, ignored) {
            debug!(key = %key, url = %record.url, "cached record does not match request");
            return Ok(None);
        }

        let body = match snapshot
            .read_slot(ENTRY_BODY)
            .map_err(RecordError::from)
            .and_then(|stored| self.codec.from_cache(stored))
        {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %key, codec = self.codec.name(), error = %e, "unreadable cached body");
                return Ok(None);
            }
        };

        Ok(Some(CachedResponse {
            record,
            body,
            snapshot,
        }))
    }

    /// Store `response` under `key`. Returns false when the response is not
    /// cacheable or another edit of the same key is in progress.
    pub fn put(
        &self,
        key: &CacheKey,
        request: &CacheRequest,
        response: &HttpResponse,
    ) -> Result<bool, RecordError> {
        if has_vary_all(&response.headers) {
            debug!(key = %key, "not caching a response that varies on *");
            return Ok(false);
        }
        let Some(body) = self.codec.to_cache(response) else {
            debug!(key = %key, codec = self.codec.name(), "codec declined response body");
            return Ok(false);
        };
        let Some(editor) = self.store.edit(key.as_str())? else {
            debug!(key = %key, "entry is already being edited");
            return Ok(false);
        };

        let record = CachedResponseRecord::from_exchange(request, response);
        write_entry(editor, &record, Some(&body))?;
        Ok(true)
    }

    /// Rewrite the metadata of `cached` from a revalidating network
    /// response, keeping the stored body. Returns false if the entry changed
    /// since `cached` was read.
    pub fn update(&self, cached: &CachedResponse, network: &HttpResponse) -> Result<bool, RecordError> {
        let Some(editor) = cached.snapshot.edit()? else {
            return Ok(false);
        };
        let record = cached.record.refreshed(network);
        write_entry(editor, &record, None)?;
        Ok(true)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<bool, RecordError> {
        Ok(self.store.remove(key.as_str())?)
    }

    pub fn evict_all(&self) -> Result<(), RecordError> {
        Ok(self.store.evict_all()?)
    }

    pub fn size(&self) -> u64 {
        self.store.size()
    }

    pub fn max_size(&self) -> u64 {
        self.store.max_size()
    }

    pub fn entry_count(&self) -> usize {
        self.store.entry_count()
    }

    pub fn flush(&self) -> Result<(), RecordError> {
        Ok(self.store.flush()?)
    }

    pub fn close(&self) -> Result<(), RecordError> {
        Ok(self.store.close()?)
    }

    /// Close the cache and delete everything in its directory.
    pub fn delete(&self) -> Result<(), RecordError> {
        Ok(self.store.delete()?)
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn store(&self) -> &DiskLruStore {
        &self.store
    }
}

/// A cache hit. Holds the entry's snapshot so the metadata can be updated
/// in place as long as the entry has not changed.
#[derive(Debug)]
pub struct CachedResponse {
    record: CachedResponseRecord,
    body: Bytes,
    snapshot: Snapshot,
}

impl CachedResponse {
    pub fn record(&self) -> &CachedResponseRecord {
        &self.record
    }

    pub fn received_at_millis(&self) -> u64 {
        self.record.received_at_millis
    }

    pub fn response(&self) -> HttpResponse {
        self.record.clone().into_response(self.body.clone())
    }

    pub fn into_response(self) -> HttpResponse {
        self.record.into_response(self.body)
    }

    /// The cached response as revalidated by `network`.
    pub fn refreshed_response(&self, network: &HttpResponse) -> HttpResponse {
        self.record.refreshed(network).into_response(self.body.clone())
    }
}

fn read_record(snapshot: &mut Snapshot) -> Result<CachedResponseRecord, RecordError> {
    let metadata = snapshot.read_slot(ENTRY_METADATA)?;
    let text = std::str::from_utf8(&metadata)
        .map_err(|_| RecordError::malformed("metadata is not UTF-8"))?;
    CachedResponseRecord::decode(text)
}

/// Write the record (and body, if given) then commit. Any failure drops the
/// editor, which aborts the edit.
fn write_entry(
    mut editor: Editor,
    record: &CachedResponseRecord,
    body: Option<&Bytes>,
) -> Result<(), RecordError> {
    editor
        .new_sink(ENTRY_METADATA)?
        .write_all(record.encode().as_bytes())?;
    if let Some(body) = body {
        editor.new_sink(ENTRY_BODY)?.write_all(body)?;
    }
    editor.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonPayloadCodec, RawPayloadCodec};
    use crate::record::CACHE_HEADER;
    use http::header::{ACCEPT_LANGUAGE, ETAG, VARY};
    use http::{HeaderMap, HeaderValue, StatusCode};
    use tempfile::TempDir;
    use url::Url;

    fn open(dir: &TempDir, codec: Arc<dyn PayloadCodec>) -> ResponseCache {
        ResponseCache::open(StoreOptions::new(dir.path(), 1 << 20), codec).unwrap()
    }

    fn key(s: &str) -> CacheKey {
        crate::CacheKeyer::default().compute_key(&request(s), &IgnoreList::new())
    }

    fn request(url: &str) -> CacheRequest {
        CacheRequest::get(Url::parse(url).unwrap())
    }

    fn response(body: &'static str, headers: &[(http::HeaderName, &'static str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        let mut response = HttpResponse::new(StatusCode::OK, map, Bytes::from_static(body.as_bytes()));
        response.received_at_millis = 50;
        response
    }

    #[test]
    fn stores_and_serves_responses() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let url = "http://a.example/items";

        assert!(cache.put(&key(url), &request(url), &response("A", &[])).unwrap());
        let hit = cache.get(&key(url), &request(url), &IgnoreList::new()).unwrap().unwrap();
        assert_eq!(hit.received_at_millis(), 50);

        let served = hit.into_response();
        assert!(served.is_from_cache());
        assert_eq!(&served.body[..], b"A");
        assert!(served.headers.contains_key(CACHE_HEADER));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn multiline_form_post_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let post = CacheRequest::post_form(
            Url::parse("http://a.example/search").unwrap(),
            [("q", "line1\nline2"), ("filter", "a=b&c")],
        );
        let key = crate::CacheKeyer::default().compute_key(&post, &IgnoreList::new());

        assert!(cache.put(&key, &post, &response("found", &[])).unwrap());
        let hit = cache.get(&key, &post, &IgnoreList::new()).unwrap().unwrap();
        assert_eq!(
            hit.record().request_body.as_deref(),
            Some(
                &[
                    ("q".to_string(), "line1\nline2".to_string()),
                    ("filter".to_string(), "a=b&c".to_string()),
                ][..]
            )
        );
        assert_eq!(&hit.into_response().body[..], b"found");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let url = "http://a.example/items";
        {
            let cache = open(&dir, Arc::new(RawPayloadCodec));
            cache.put(&key(url), &request(url), &response("A", &[])).unwrap();
            cache.close().unwrap();
        }
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let hit = cache.get(&key(url), &request(url), &IgnoreList::new()).unwrap();
        assert_eq!(&hit.unwrap().into_response().body[..], b"A");
    }

    #[test]
    fn uncacheable_responses_are_skipped() {
        let dir = TempDir::new().unwrap();
        let url = "http://a.example/";

        let cache = open(&dir, Arc::new(RawPayloadCodec));
        assert!(!cache
            .put(&key(url), &request(url), &response("A", &[(VARY, "*")]))
            .unwrap());

        let json = open(&TempDir::new().unwrap(), Arc::new(JsonPayloadCodec));
        assert!(!json.put(&key(url), &request(url), &response("not json", &[])).unwrap());
        assert_eq!(json.entry_count(), 0);
    }

    #[test]
    fn vary_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let url = "http://a.example/";
        let french = request(url).with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));
        let german = request(url).with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("de"));

        cache
            .put(&key(url), &french, &response("bonjour", &[(VARY, "Accept-Language")]))
            .unwrap();
        assert!(cache.get(&key(url), &german, &IgnoreList::new()).unwrap().is_none());
        assert!(cache.get(&key(url), &french, &IgnoreList::new()).unwrap().is_some());
    }

    #[test]
    fn update_rewrites_metadata_and_keeps_body() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let url = "http://a.example/";
        cache
            .put(&key(url), &request(url), &response("body", &[(ETAG, "\"v1\"")]))
            .unwrap();

        let hit = cache.get(&key(url), &request(url), &IgnoreList::new()).unwrap().unwrap();
        let mut revalidated = response("", &[(ETAG, "\"v1\"")]);
        revalidated.status = StatusCode::NOT_MODIFIED;
        revalidated.received_at_millis = 900;
        assert!(cache.update(&hit, &revalidated).unwrap());
        drop(hit);

        let hit = cache.get(&key(url), &request(url), &IgnoreList::new()).unwrap().unwrap();
        assert_eq!(hit.received_at_millis(), 900);
        let served = hit.into_response();
        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(&served.body[..], b"body");
    }

    #[test]
    fn update_fails_for_a_stale_hit() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let url = "http://a.example/";
        cache.put(&key(url), &request(url), &response("one", &[])).unwrap();
        let hit = cache.get(&key(url), &request(url), &IgnoreList::new()).unwrap().unwrap();

        cache.put(&key(url), &request(url), &response("two", &[])).unwrap();
        assert!(!cache.update(&hit, &response("", &[])).unwrap());
    }

    #[test]
    fn garbled_metadata_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, Arc::new(RawPayloadCodec));
        let k = key("http://a.example/");

        let mut editor = cache.store().edit(k.as_str()).unwrap().unwrap();
        editor.new_sink(ENTRY_METADATA).unwrap().write_all(b"garbage").unwrap();
        editor.new_sink(ENTRY_BODY).unwrap().write_all(b"x").unwrap();
        editor.commit().unwrap();

        assert!(cache
            .get(&k, &request("http://a.example/"), &IgnoreList::new())
            .unwrap()
            .is_none());
    }
}
