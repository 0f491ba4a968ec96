//! Header codecs
//!
//! Small lenient encoders/decoders for the protocol headers:
//!
//! | Header | Format |
//! |--------|--------|
//! | `Upload-Metadata` | `key base64(value)` pairs joined by `,` |
//! | `X-Received-Chunks` | JSON array of `{"offset": n}` |
//! | `Location` | absolute or relative URL, last path segment is the upload id |
//!
//! Decoders never fail: malformed input degrades to "nothing known".

use super::UploadError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Encode an `Upload-Metadata` header value.
pub fn encode_upload_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{} {}", key, STANDARD.encode(value.as_bytes()))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode an `Upload-Metadata` header value.
///
/// Pairs whose value is not valid base64 are dropped.
pub fn decode_upload_metadata(header: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();

    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        match pair.split_once(' ') {
            Some((key, encoded)) => match STANDARD.decode(encoded.trim()) {
                Ok(raw) => {
                    metadata.insert(key.to_string(), String::from_utf8_lossy(&raw).into_owned());
                }
                Err(e) => {
                    tracing::debug!(key = key, error = %e, "Skipping undecodable metadata value");
                }
            },
            None => {
                metadata.insert(pair.to_string(), String::new());
            }
        }
    }

    metadata
}

#[derive(Deserialize)]
struct ChunkRecord {
    offset: u64,
}

/// Parse an `X-Received-Chunks` header into acknowledged chunk offsets.
pub fn parse_received_chunks(header: &str) -> Vec<u64> {
    match serde_json::from_str::<Vec<ChunkRecord>>(header) {
        Ok(records) => records.into_iter().map(|r| r.offset).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed X-Received-Chunks header");
            Vec::new()
        }
    }
}

/// Extract the upload id from a `Location` value.
pub fn upload_id_from_location(location: &str) -> Option<String> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

/// Resolve a `Location` value against the endpoint it was returned from.
pub fn resolve_location(endpoint: &str, location: &str) -> Result<String, UploadError> {
    let base = Url::parse(endpoint)
        .map_err(|e| UploadError::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
    base.join(location)
        .map(|url| url.to_string())
        .map_err(|e| UploadError::Protocol(format!("Invalid Location '{}': {}", location, e)))
}

/// Read a header as a string, ignoring non-ASCII values.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Read a header as an unsigned integer.
pub fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "world_domination_plan.pdf".to_string());
        metadata.insert("is_confidential".to_string(), String::new());

        assert_eq!(
            encode_upload_metadata(&metadata),
            "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential"
        );
    }

    #[test]
    fn test_decode_metadata() {
        let decoded = decode_upload_metadata(
            "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==, is_confidential,broken !!!",
        );

        assert_eq!(decoded["filename"], "world_domination_plan.pdf");
        assert_eq!(decoded["is_confidential"], "");
        assert!(!decoded.contains_key("broken"));
    }

    #[test]
    fn test_decode_empty_metadata() {
        assert!(decode_upload_metadata("").is_empty());
    }

    #[test]
    fn test_parse_received_chunks() {
        assert_eq!(
            parse_received_chunks(r#"[{"offset":0},{"offset":5242880}]"#),
            vec![0, 5242880]
        );
        assert!(parse_received_chunks("not json").is_empty());
        assert!(parse_received_chunks(r#"{"offset":0}"#).is_empty());
    }

    #[test]
    fn test_upload_id_from_location() {
        assert_eq!(upload_id_from_location("/uploads/abc123").as_deref(), Some("abc123"));
        assert_eq!(
            upload_id_from_location("https://h/uploads/abc123/?x=1").as_deref(),
            Some("abc123")
        );
        assert_eq!(upload_id_from_location("/"), None);
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("http://localhost:1080/files", "/files/xyz").unwrap(),
            "http://localhost:1080/files/xyz"
        );
        assert_eq!(
            resolve_location("http://localhost:1080/files", "https://cdn.example.com/f/1").unwrap(),
            "https://cdn.example.com/f/1"
        );
        assert!(resolve_location("not a url", "/files/xyz").is_err());
    }
}
