use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::form_urlencoded;
use url::Url;

/// Request body as it matters for cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` pairs in submission order.
    Form(Vec<(String, String)>),
    /// Any other body, with its declared content type.
    Raw {
        bytes: Bytes,
        content_type: Option<String>,
    },
}

impl RequestBody {
    /// Charset parameter of the declared content type, if any.
    pub fn charset(&self) -> Option<&str> {
        let RequestBody::Raw {
            content_type: Some(content_type),
            ..
        } = self
        else {
            return None;
        };
        content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"'))
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            RequestBody::Form(_) => Some("application/x-www-form-urlencoded"),
            RequestBody::Raw { content_type, .. } => content_type.as_deref(),
        }
    }

    /// Wire bytes of the body.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            RequestBody::Form(pairs) => {
                let encoded = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                Bytes::from(encoded)
            }
            RequestBody::Raw { bytes, .. } => bytes.clone(),
        }
    }

    /// Interpret raw bytes by content type: form bodies become pairs.
    pub fn from_wire(bytes: Bytes, content_type: Option<&str>) -> Self {
        let is_form = content_type.is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        });
        if is_form {
            let pairs = form_urlencoded::parse(&bytes).into_owned().collect();
            RequestBody::Form(pairs)
        } else {
            RequestBody::Raw {
                bytes,
                content_type: content_type.map(str::to_string),
            }
        }
    }
}

/// An outgoing request as seen by the cache.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl CacheRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_form<K, V>(url: Url, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(Method::POST, url).with_body(RequestBody::Form(pairs))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        if let Some(value) = body
            .content_type()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
        {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// TLS handshake details recorded alongside an `https` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub cipher_suite: String,
    /// DER-encoded certificates.
    pub peer_certificates: Vec<Bytes>,
    pub local_certificates: Vec<Bytes>,
    pub tls_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    Cache,
    Network,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
        }
    }
}

/// A complete, buffered response from either the cache or the network.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// Reason phrase when it differs from the canonical one.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
    pub sent_at_millis: u64,
    pub received_at_millis: u64,
    pub tls: Option<TlsInfo>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            reason: None,
            headers,
            body,
            source: ResponseSource::Network,
            sent_at_millis: 0,
            received_at_millis: 0,
            tls: None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_is_read_from_content_type() {
        let body = RequestBody::Raw {
            bytes: Bytes::from_static(b"x"),
            content_type: Some("text/plain; charset=\"ISO-8859-1\"".into()),
        };
        assert_eq!(body.charset(), Some("ISO-8859-1"));

        let body = RequestBody::Raw {
            bytes: Bytes::new(),
            content_type: Some("application/json".into()),
        };
        assert_eq!(body.charset(), None);
    }

    #[test]
    fn form_bodies_round_trip_through_the_wire() {
        let body = RequestBody::Form(vec![("q".into(), "a b".into()), ("page".into(), "2".into())]);
        let wire = body.to_bytes();
        assert_eq!(&wire[..], b"q=a+b&page=2");

        let parsed = RequestBody::from_wire(wire, Some("application/x-www-form-urlencoded; charset=utf-8"));
        assert_eq!(parsed, body);
    }

    #[test]
    fn post_form_sets_content_type() {
        let url = Url::parse("http://example.com/login").unwrap();
        let request = CacheRequest::post_form(url, [("user", "a")]);
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
    }
}
