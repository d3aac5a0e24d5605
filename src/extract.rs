//! The `Extract(html, url) → Record` interface.
//!
//! Site-specific article/listing parsers are out of scope; the processor
//! only consumes this trait. `Record` is intentionally opaque JSON — the
//! core never interprets extracted fields, only stores and serializes them.

use crate::error::FetchResponse;
use serde_json::Value;

/// One extracted record, keyed by the URL it came from.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Record {
    pub url: String,
    pub data: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("extraction failed for {url}: {reason}")]
pub struct ExtractError {
    pub url: String,
    pub reason: String,
}

/// Implemented by site-specific extractors. `extract` receives the final
/// fetched response (after redirects) and must not perform network I/O of
/// its own.
pub trait Extractor: Send + Sync {
    fn extract(&self, url: &str, response: &FetchResponse) -> Result<Record, ExtractError>;
}

/// An extractor that stores the response body as opaque text, useful for
/// tests and for pipelines that defer structured extraction downstream.
pub struct RawTextExtractor;

impl Extractor for RawTextExtractor {
    fn extract(&self, url: &str, response: &FetchResponse) -> Result<Record, ExtractError> {
        let text = String::from_utf8_lossy(&response.body).into_owned();
        Ok(Record { url: url.to_string(), data: Value::String(text) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn raw_text_extractor_wraps_body_as_string() {
        let response = FetchResponse {
            status: 200,
            final_url: "https://example.com/".into(),
            headers: vec![],
            body: Bytes::from_static(b"hello"),
        };
        let record = RawTextExtractor.extract("https://example.com/", &response).unwrap();
        assert_eq!(record.data, Value::String("hello".to_string()));
    }
}
