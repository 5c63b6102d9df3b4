//! Conversion between response bodies and the bytes kept in the body slot.

use crate::error::RecordError;
use crate::message::HttpResponse;
use bytes::Bytes;

/// Pluggable body serializer for the response cache.
pub trait PayloadCodec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Bytes to store for `response`, or `None` to skip caching it.
    fn to_cache(&self, response: &HttpResponse) -> Option<Bytes>;

    /// Body to serve from stored bytes.
    fn from_cache(&self, stored: Bytes) -> Result<Bytes, RecordError>;
}

/// Stores bodies byte-for-byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPayloadCodec;

impl PayloadCodec for RawPayloadCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn to_cache(&self, response: &HttpResponse) -> Option<Bytes> {
        Some(response.body.clone())
    }

    fn from_cache(&self, stored: Bytes) -> Result<Bytes, RecordError> {
        Ok(stored)
    }
}

/// Stores JSON bodies in compact form and refuses anything that is not JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_cache(&self, response: &HttpResponse) -> Option<Bytes> {
        let value: serde_json::Value = serde_json::from_slice(&response.body).ok()?;
        serde_json::to_vec(&value).ok().map(Bytes::from)
    }

    fn from_cache(&self, stored: Bytes) -> Result<Bytes, RecordError> {
        serde_json::from_slice::<serde::de::IgnoredAny>(&stored)
            .map_err(|e| RecordError::Payload(e.to_string()))?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};

    fn response(body: &'static [u8]) -> HttpResponse {
        HttpResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body))
    }

    #[test]
    fn json_codec_compacts_and_declines_non_json() {
        let codec = JsonPayloadCodec;
        let stored = codec.to_cache(&response(b"{ \"a\" : [1, 2] }")).unwrap();
        assert_eq!(&stored[..], b"{\"a\":[1,2]}");
        assert_eq!(codec.from_cache(stored.clone()).unwrap(), stored);

        assert!(codec.to_cache(&response(b"<html>")).is_none());
        assert!(matches!(
            codec.from_cache(Bytes::from_static(b"{truncated")),
            Err(RecordError::Payload(_))
        ));
    }

    #[test]
    fn raw_codec_passes_bytes_through() {
        let codec = RawPayloadCodec;
        let stored = codec.to_cache(&response(b"\x00\xffbinary")).unwrap();
        assert_eq!(codec.from_cache(stored).unwrap(), Bytes::from_static(b"\x00\xffbinary"));
    }
}
