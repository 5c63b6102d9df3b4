//! Metadata record stored in slot 0 of a cached response.
//!
//! ```text
//! http://api.example.com/items?page=2
//! GET
//! 1
//! Accept-Language: fr-CA
//! HTTP/1.1 200 OK
//! 4
//! Content-Type: application/json
//! Vary: Accept-Language
//! Keepsake-Sent-Millis: 1700000000000
//! Keepsake-Received-Millis: 1700000000120
//! ```
//!
//! POST records carry a `body:` line with the percent-encoded form pairs
//! right after the method. Responses fetched over TLS end with a blank line,
//! the cipher suite, the peer and local certificate lists (a count followed
//! by one base64 line per certificate, `-1` for none) and the TLS version.

use crate::error::RecordError;
use crate::key::{normalize_url, IgnoreList};
use crate::message::{CacheRequest, HttpResponse, RequestBody, ResponseSource, TlsInfo};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::VARY;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use url::form_urlencoded;
use url::Url;

/// Synthetic header: local time the request was sent.
pub const SENT_MILLIS: &str = "Keepsake-Sent-Millis";
/// Synthetic header: local time the response was received.
pub const RECEIVED_MILLIS: &str = "Keepsake-Received-Millis";
/// Added to every response served from the cache.
pub const CACHE_HEADER: &str = "Keepsake-Cache";
pub const LOCAL_CACHE: &str = "local_cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponseRecord {
    pub url: String,
    pub method: Method,
    /// Echo of a POST form body.
    pub request_body: Option<Vec<(String, String)>>,
    /// Request headers named by the response's `Vary` header.
    pub vary_headers: Vec<(String, String)>,
    pub status: StatusCode,
    pub reason: String,
    /// Response headers without the synthetic timing headers.
    pub headers: Vec<(String, String)>,
    pub tls: Option<TlsInfo>,
    pub sent_at_millis: u64,
    pub received_at_millis: u64,
}

impl CachedResponseRecord {
    pub fn from_exchange(request: &CacheRequest, response: &HttpResponse) -> Self {
        let request_body = (request.method == Method::POST).then(|| match &request.body {
            Some(RequestBody::Form(pairs)) => pairs.clone(),
            _ => Vec::new(),
        });

        Self {
            url: request.url.to_string(),
            method: request.method.clone(),
            request_body,
            vary_headers: vary_request_headers(&request.headers, &response.headers),
            status: response.status,
            reason: response.reason_phrase().to_string(),
            headers: header_lines(&response.headers),
            tls: response.tls.clone(),
            sent_at_millis: response.sent_at_millis,
            received_at_millis: response.received_at_millis,
        }
    }

    /// Copy of this record refreshed by a revalidating network response:
    /// timestamps come from `network`, and its headers replace same-named ones.
    pub fn refreshed(&self, network: &HttpResponse) -> Self {
        let replaced: BTreeSet<String> = network
            .headers
            .keys()
            .map(|name| name.as_str().to_string())
            .collect();

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !replaced.contains(&name.to_ascii_lowercase()))
            .cloned()
            .collect();
        headers.extend(header_lines(&network.headers));

        Self {
            headers,
            sent_at_millis: network.sent_at_millis,
            received_at_millis: network.received_at_millis,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "{}", self.url)?;
        writeln!(out, "{}", self.method)?;
        if self.method == Method::POST {
            let pairs = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.request_body.iter().flatten())
                .finish();
            writeln!(out, "body:{pairs}")?;
        }

        writeln!(out, "{}", self.vary_headers.len())?;
        for (name, value) in &self.vary_headers {
            writeln!(out, "{name}: {value}")?;
        }

        writeln!(out, "HTTP/1.1 {} {}", self.status.as_u16(), self.reason)?;
        writeln!(out, "{}", self.headers.len() + 2)?;
        for (name, value) in &self.headers {
            writeln!(out, "{name}: {value}")?;
        }
        writeln!(out, "{SENT_MILLIS}: {}", self.sent_at_millis)?;
        writeln!(out, "{RECEIVED_MILLIS}: {}", self.received_at_millis)?;

        if let Some(tls) = &self.tls {
            writeln!(out)?;
            writeln!(out, "{}", tls.cipher_suite)?;
            write_certificates(out, &tls.peer_certificates)?;
            write_certificates(out, &tls.local_certificates)?;
            writeln!(out, "{}", tls.tls_version)?;
        }
        Ok(())
    }

    pub fn decode(input: &str) -> Result<Self, RecordError> {
        let mut lines = Lines::new(input);

        let url = lines.next_line()?.to_string();
        let method = Method::from_bytes(lines.next_line()?.as_bytes())
            .map_err(|_| RecordError::malformed("invalid method"))?;

        let request_body = if method == Method::POST {
            let line = lines.next_line()?;
            let pairs = line
                .strip_prefix("body:")
                .ok_or_else(|| RecordError::malformed(format!("expected body line, got {line:?}")))?;
            Some(form_urlencoded::parse(pairs.as_bytes()).into_owned().collect())
        } else {
            None
        };

        let vary_count = lines.read_count()?;
        let mut vary_headers = Vec::with_capacity(vary_count);
        for _ in 0..vary_count {
            vary_headers.push(parse_header_line(lines.next_line()?)?);
        }

        let (status, reason) = parse_status_line(lines.next_line()?)?;

        let header_count = lines.read_count()?;
        let mut headers = Vec::with_capacity(header_count);
        let mut sent_at_millis = 0;
        let mut received_at_millis = 0;
        for _ in 0..header_count {
            let (name, value) = parse_header_line(lines.next_line()?)?;
            if name.eq_ignore_ascii_case(SENT_MILLIS) {
                sent_at_millis = parse_millis(&value)?;
            } else if name.eq_ignore_ascii_case(RECEIVED_MILLIS) {
                received_at_millis = parse_millis(&value)?;
            } else {
                headers.push((name, value));
            }
        }

        let tls = if lines.at_end() {
            None
        } else {
            let blank = lines.next_line()?;
            if !blank.is_empty() {
                return Err(RecordError::malformed(format!(
                    "expected \"\" but was {blank:?}"
                )));
            }
            let cipher_suite = lines.next_line()?.to_string();
            let peer_certificates = read_certificates(&mut lines)?;
            let local_certificates = read_certificates(&mut lines)?;
            let tls_version = if lines.at_end() {
                "SSLv3".to_string()
            } else {
                lines.next_line()?.to_string()
            };
            Some(TlsInfo {
                cipher_suite,
                peer_certificates,
                local_certificates,
                tls_version,
            })
        };

        Ok(Self {
            url,
            method,
            request_body,
            vary_headers,
            status,
            reason,
            headers,
            tls,
            sent_at_millis,
            received_at_millis,
        })
    }

    /// True if this record answers `request`: same method, same URL after
    /// ignore-list normalization, and unchanged values for every varied header.
    pub fn matches(&self, request: &CacheRequest, ignored: &IgnoreList) -> bool {
        if self.method != request.method {
            return false;
        }
        let Ok(url) = Url::parse(&self.url) else {
            return false;
        };
        if normalize_url(&url, ignored) != normalize_url(&request.url, ignored) {
            return false;
        }

        vary_fields(self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())))
            .iter()
            .all(|field| {
                let cached: Vec<&str> = self
                    .vary_headers
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case(field))
                    .map(|(_, value)| value.as_str())
                    .collect();
                let current: Vec<&str> = request
                    .headers
                    .get_all(field.as_str())
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .collect();
                cached == current
            })
    }

    /// Rebuild the response with `body`, marked as coming from the cache.
    pub fn into_response(self, body: Bytes) -> HttpResponse {
        let mut headers = HeaderMap::with_capacity(self.headers.len() + 1);
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers.insert(CACHE_HEADER, HeaderValue::from_static(LOCAL_CACHE));

        let canonical = self.status.canonical_reason().unwrap_or("");
        HttpResponse {
            status: self.status,
            reason: (self.reason != canonical).then_some(self.reason),
            headers,
            body,
            source: ResponseSource::Cache,
            sent_at_millis: self.sent_at_millis,
            received_at_millis: self.received_at_millis,
            tls: self.tls,
        }
    }
}

/// True if a `Vary` header contains `*`. Such responses are never stored.
pub fn has_vary_all(headers: &HeaderMap) -> bool {
    vary_fields(header_pairs(headers)).contains("*")
}

/// Lowercased field names listed by all `Vary` headers.
fn vary_fields<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>) -> BTreeSet<String> {
    headers
        .filter(|(name, _)| name.eq_ignore_ascii_case(VARY.as_str()))
        .flat_map(|(_, value)| value.split(','))
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect()
}

fn header_pairs(headers: &HeaderMap) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
}

/// Subset of request headers that the response varies on.
fn vary_request_headers(request: &HeaderMap, response: &HeaderMap) -> Vec<(String, String)> {
    let fields = vary_fields(header_pairs(response));
    if fields.is_empty() {
        return Vec::new();
    }
    header_pairs(request)
        .filter(|(name, _)| fields.contains(*name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn header_lines(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn write_certificates(out: &mut String, certificates: &[Bytes]) -> std::fmt::Result {
    writeln!(out, "{}", certificates.len())?;
    for certificate in certificates {
        writeln!(out, "{}", STANDARD.encode(certificate))?;
    }
    Ok(())
}

fn read_certificates(lines: &mut Lines<'_>) -> Result<Vec<Bytes>, RecordError> {
    let line = lines.next_line()?;
    if line == "-1" {
        return Ok(Vec::new());
    }
    let count = parse_count(line)?;
    (0..count)
        .map(|_| {
            let encoded = lines.next_line()?;
            STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(|e| RecordError::malformed(format!("bad certificate: {e}")))
        })
        .collect()
}

fn parse_header_line(line: &str) -> Result<(String, String), RecordError> {
    // The first colon after position 0 separates name and value, so
    // pseudo-header style names such as ":authority" survive.
    let split = line
        .get(1..)
        .and_then(|rest| rest.find(':'))
        .map(|i| i + 1)
        .ok_or_else(|| RecordError::malformed(format!("bad header line {line:?}")))?;
    let (name, value) = line.split_at(split);
    Ok((name.to_string(), value[1..].trim_start().to_string()))
}

fn parse_status_line(line: &str) -> Result<(StatusCode, String), RecordError> {
    let bad = || RecordError::malformed(format!("unexpected status line {line:?}"));
    let rest = line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| line.strip_prefix("HTTP/1.0 "))
        .or_else(|| line.strip_prefix("HTTP/2 "))
        .ok_or_else(bad)?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(bad)?;
    Ok((status, reason.to_string()))
}

fn parse_millis(value: &str) -> Result<u64, RecordError> {
    value
        .trim()
        .parse()
        .map_err(|_| RecordError::malformed(format!("bad timestamp {value:?}")))
}

fn parse_count(line: &str) -> Result<usize, RecordError> {
    line.parse::<u32>()
        .map(|n| n as usize)
        .map_err(|_| RecordError::malformed(format!("expected an int but was {line:?}")))
}

/// Strict newline-terminated line reader.
struct Lines<'a> {
    rest: &'a str,
}

impl<'a> Lines<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn at_end(&self) -> bool {
        self.rest.is_empty()
    }

    fn next_line(&mut self) -> Result<&'a str, RecordError> {
        let (line, rest) = self
            .rest
            .split_once('\n')
            .ok_or_else(|| RecordError::malformed("unexpected end of record"))?;
        self.rest = rest;
        Ok(line)
    }

    fn read_count(&mut self) -> Result<usize, RecordError> {
        parse_count(self.next_line()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT_LANGUAGE, CONTENT_TYPE};

    fn request(url: &str) -> CacheRequest {
        CacheRequest::get(Url::parse(url).unwrap())
    }

    fn response(headers: &[(&'static str, &'static str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        let mut response = HttpResponse::new(StatusCode::OK, map, Bytes::from_static(b"{}"));
        response.sent_at_millis = 100;
        response.received_at_millis = 120;
        response
    }

    #[test]
    fn encodes_the_documented_layout() {
        let request = request("http://api.example.com/items?page=2")
            .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr-CA"));
        let response = response(&[("content-type", "application/json"), ("vary", "Accept-Language")]);
        let record = CachedResponseRecord::from_exchange(&request, &response);

        assert_eq!(
            record.encode(),
            "http://api.example.com/items?page=2\n\
             GET\n\
             1\n\
             accept-language: fr-CA\n\
             HTTP/1.1 200 OK\n\
             4\n\
             content-type: application/json\n\
             vary: Accept-Language\n\
             Keepsake-Sent-Millis: 100\n\
             Keepsake-Received-Millis: 120\n"
        );
    }

    #[test]
    fn decode_restores_every_field() {
        let request = CacheRequest::post_form(
            Url::parse("https://api.example.com/login").unwrap(),
            [("user", "ada"), ("lang", "en")],
        );
        let mut response = response(&[("content-type", "application/json")]);
        response.status = StatusCode::CREATED;
        response.reason = Some("Made It".into());
        response.tls = Some(TlsInfo {
            cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
            peer_certificates: vec![Bytes::from_static(b"\x30\x82cert")],
            local_certificates: Vec::new(),
            tls_version: "TLSv1.3".into(),
        });

        let record = CachedResponseRecord::from_exchange(&request, &response);
        let decoded = CachedResponseRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.request_body,
            Some(vec![("user".into(), "ada".into()), ("lang".into(), "en".into())])
        );
        assert_eq!(decoded.reason, "Made It");
        assert_eq!(decoded.received_at_millis, 120);
    }

    #[test]
    fn form_values_with_separators_survive_encoding() {
        let pairs = [("q", "line1\nline2"), ("expr", "a=b&c"), ("k&=", "")];
        let request = CacheRequest::post_form(Url::parse("http://api.example.com/search").unwrap(), pairs);
        let record = CachedResponseRecord::from_exchange(&request, &response(&[]));

        let encoded = record.encode();
        assert!(encoded.contains("body:q=line1%0Aline2&expr=a%3Db%26c&k%26%3D=\n"));
        let decoded = CachedResponseRecord::decode(&encoded).unwrap();
        assert_eq!(
            decoded.request_body,
            Some(
                pairs
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect()
            )
        );
        assert_eq!(decoded, record);
    }

    #[test]
    fn legacy_null_certificate_list() {
        let encoded = "https://a.example/\nGET\n0\nHTTP/1.1 200 OK\n2\n\
                       Keepsake-Sent-Millis: 1\nKeepsake-Received-Millis: 2\n\n\
                       TLS_AES_128_GCM_SHA256\n-1\n-1\n";
        let record = CachedResponseRecord::decode(encoded).unwrap();
        let tls = record.tls.unwrap();
        assert!(tls.peer_certificates.is_empty());
        assert_eq!(tls.tls_version, "SSLv3");
    }

    #[test]
    fn truncated_or_garbled_records_are_rejected() {
        assert!(CachedResponseRecord::decode("").is_err());
        assert!(CachedResponseRecord::decode("http://a/\nGET\n").is_err());
        assert!(CachedResponseRecord::decode("http://a/\nGET\nx\n").is_err());
        assert!(CachedResponseRecord::decode("http://a/\nGET\n0\nHTTP/9 200 OK\n0\n").is_err());
        assert!(CachedResponseRecord::decode("http://a/\nPOST\n0\n").is_err());
    }

    #[test]
    fn matches_on_method_normalized_url_and_vary() {
        let ignored = IgnoreList::from_iter(["ts"]);
        let original = request("http://a.example/items?ts=1&page=2")
            .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));
        let record = CachedResponseRecord::from_exchange(
            &original,
            &response(&[("vary", "Accept-Language")]),
        );

        let same = request("http://a.example/items?page=2&ts=9")
            .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));
        assert!(record.matches(&same, &ignored));

        let other_language = request("http://a.example/items?page=2")
            .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("de"));
        assert!(!record.matches(&other_language, &ignored));

        let other_page = request("http://a.example/items?page=3")
            .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));
        assert!(!record.matches(&other_page, &ignored));

        let mut post = same.clone();
        post.method = Method::POST;
        assert!(!record.matches(&post, &ignored));
    }

    #[test]
    fn vary_star_is_detected() {
        let mut headers = HeaderMap::new();
        headers.append(VARY, HeaderValue::from_static("Accept-Encoding, *"));
        assert!(has_vary_all(&headers));
        headers.remove(VARY);
        assert!(!has_vary_all(&headers));
    }

    #[test]
    fn cached_response_is_marked_and_strips_timing_headers() {
        let record = CachedResponseRecord::from_exchange(
            &request("http://a.example/"),
            &response(&[("content-type", "text/plain")]),
        );
        let decoded = CachedResponseRecord::decode(&record.encode()).unwrap();
        let cached = decoded.into_response(Bytes::from_static(b"hi"));

        assert!(cached.is_from_cache());
        assert_eq!(cached.headers.get(CACHE_HEADER).unwrap(), LOCAL_CACHE);
        assert_eq!(cached.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(cached.headers.get(SENT_MILLIS).is_none());
        assert_eq!(cached.reason, None);
        assert_eq!((cached.sent_at_millis, cached.received_at_millis), (100, 120));
    }

    #[test]
    fn refresh_replaces_headers_and_timestamps() {
        let record = CachedResponseRecord::from_exchange(
            &request("http://a.example/"),
            &response(&[("etag", "\"v1\""), ("content-type", "text/plain")]),
        );
        let mut network = response(&[("etag", "\"v2\"")]);
        network.status = StatusCode::NOT_MODIFIED;
        network.received_at_millis = 999;

        let refreshed = record.refreshed(&network);
        assert_eq!(refreshed.status, StatusCode::OK);
        assert_eq!(refreshed.received_at_millis, 999);
        assert!(refreshed.headers.contains(&("etag".into(), "\"v2\"".into())));
        assert!(!refreshed.headers.contains(&("etag".into(), "\"v1\"".into())));
        assert!(refreshed.headers.contains(&("content-type".into(), "text/plain".into())));
    }
}
