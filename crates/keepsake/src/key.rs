//! Deterministic cache keys for requests.
//!
//! The identity string is the method, the URL with ignored query parameters
//! removed and the rest sorted by name, then (when a body is present) a `/`
//! and the canonical body, then the identity salt. The key is the lowercase
//! hex SHA-256 of that string, which always satisfies the store's key rules.

use crate::message::{CacheRequest, RequestBody};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use url::form_urlencoded;
use url::Url;

/// Store key derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query parameter and form field names that do not affect identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    names: BTreeSet<String>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// This list plus `extra`.
    pub fn merged<I, S>(&self, extra: I) -> IgnoreList
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut merged = self.clone();
        merged.names.extend(extra.into_iter().map(Into::into));
        merged
    }
}

impl<S: Into<String>> FromIterator<S> for IgnoreList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Key settings injected at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyConfig {
    /// Appended to every identity string, e.g. to separate users.
    #[serde(default)]
    pub identity_salt: String,
    /// Ignored names applied to every call in addition to per-call ones.
    #[serde(default)]
    pub default_ignored: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheKeyer {
    identity_salt: String,
    default_ignored: IgnoreList,
}

impl CacheKeyer {
    pub fn new(config: KeyConfig) -> Self {
        Self {
            identity_salt: config.identity_salt,
            default_ignored: config.default_ignored.into_iter().collect(),
        }
    }

    /// Default ignore list plus the names a call adds.
    pub fn ignore_list(&self, per_call: &[String]) -> IgnoreList {
        self.default_ignored.merged(per_call.iter().cloned())
    }

    pub fn compute_key(&self, request: &CacheRequest, ignored: &IgnoreList) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.identity(request, ignored).as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }

    /// The pre-digest identity string.
    pub fn identity(&self, request: &CacheRequest, ignored: &IgnoreList) -> String {
        let mut identity = format!("{} {}", request.method, normalize_url(&request.url, ignored));
        if let Some(body) = &request.body {
            identity.push('/');
            identity.push_str(&canonical_body(body, ignored));
        }
        identity.push_str(&self.identity_salt);
        identity
    }
}

/// URL without fragment and ignored query parameters, remaining parameters
/// sorted by name (stable for repeated names).
pub fn normalize_url(url: &Url, ignored: &IgnoreList) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !ignored.contains(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut normalized = url.clone();
    normalized.set_fragment(None);
    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(&pairs);
    }
    normalized.into()
}

fn canonical_body(body: &RequestBody, ignored: &IgnoreList) -> String {
    match body {
        RequestBody::Form(pairs) => pairs
            .iter()
            .filter(|(name, _)| !ignored.contains(name))
            .map(|(name, value)| {
                let mut pair = form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>();
                pair.push('=');
                pair.extend(form_urlencoded::byte_serialize(value.as_bytes()));
                pair
            })
            .collect::<Vec<_>>()
            .join("&"),
        RequestBody::Raw { bytes, .. } => decode_text(bytes, body.charset()),
    }
}

/// Decode body bytes under the declared charset. Latin-1 maps bytes to code
/// points; everything else is read as UTF-8 with replacement characters.
fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        Some("iso-8859-1" | "latin1" | "latin-1" | "us-ascii") => {
            bytes.iter().map(|&b| char::from(b)).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}
