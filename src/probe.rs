//! HTTP Probe (spec.md §4.A).
//!
//! Generalizes the teacher's `check_range_support` / `extract_filename`
//! (`downloader.rs`) from a single HEAD-only probe into the full HEAD-then-
//! ranged-GET fallback spec.md requires, with RFC 6266 filename parsing and
//! the deterministic fallback name the teacher never implements.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};

use crate::error::{Result, TurboDlError};
use crate::model::RemoteFileInfo;

/// Probes `url`, returning the stable [`RemoteFileInfo`] the plan builder
/// consumes next.
pub async fn probe(client: &Client, url: &str, headers: &HashMap<String, String>) -> Result<RemoteFileInfo> {
    url::Url::parse(url).map_err(|e| TurboDlError::InvalidUrl(e.to_string()))?;

    let header_map = build_header_map(headers);

    let head_result = client
        .head(url)
        .headers(header_map.clone())
        .send()
        .await;

    if let Ok(response) = head_result {
        if response.status().is_success() {
            return Ok(info_from_head(url, &response));
        }
    }

    // HEAD failed or returned a non-2xx: fall back to a tiny ranged GET,
    // per spec.md §4.A, and close the body without reading past what's
    // required.
    let range_response = client
        .get(url)
        .headers(header_map)
        .header("Range", "bytes=0-0")
        .send()
        .await
        .map_err(TurboDlError::from)?;

    if !(range_response.status().is_success() || range_response.status() == StatusCode::PARTIAL_CONTENT) {
        return Err(TurboDlError::RemoteError {
            status: range_response.status().as_u16(),
        });
    }

    info_from_range_probe(url, &range_response)
}

fn build_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        if let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, val);
        }
    }
    map
}

fn info_from_head(requested_url: &str, response: &reqwest::Response) -> RemoteFileInfo {
    let final_url = response.url().to_string();
    let headers = response.headers();

    let size = content_length(headers);
    let supports_ranges = accept_ranges_says_bytes(headers);
    let filename = resolve_filename(headers, &final_url);
    let content_type = content_type(headers);
    let etag = header_str(headers, "etag");
    let last_modified = header_str(headers, "last-modified");

    let _ = requested_url;
    RemoteFileInfo {
        url: final_url,
        size,
        filename,
        content_type,
        supports_ranges,
        etag,
        last_modified,
    }
}

fn info_from_range_probe(requested_url: &str, response: &reqwest::Response) -> Result<RemoteFileInfo> {
    let final_url = response.url().to_string();
    let headers = response.headers();

    let size = content_range_total(headers).or_else(|| content_length(headers));
    let supports_ranges = response.status() == StatusCode::PARTIAL_CONTENT || accept_ranges_says_bytes(headers);
    let filename = resolve_filename(headers, &final_url);
    let content_type = content_type(headers);
    let etag = header_str(headers, "etag");
    let last_modified = header_str(headers, "last-modified");

    let _ = requested_url;
    Ok(RemoteFileInfo {
        url: final_url,
        size,
        filename,
        content_type,
        supports_ranges,
        etag,
        last_modified,
    })
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// `Content-Range: bytes 0-0/12345` -> `Some(12345)`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    if total == "*" {
        None
    } else {
        total.parse::<u64>().ok()
    }
}

fn accept_ranges_says_bytes(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false)
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

/// Filename precedence (spec.md §4.A / §6): Content-Disposition (filename*
/// preferred over filename) -> last URL path segment, percent-decoded ->
/// deterministic `download_<short_hash(url)>` fallback.
fn resolve_filename(headers: &HeaderMap, final_url: &str) -> String {
    if let Some(name) = filename_from_content_disposition(headers) {
        return name;
    }
    if let Some(name) = filename_from_url(final_url) {
        return name;
    }
    format!("download_{}", short_hash(final_url))
}

fn filename_from_content_disposition(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(reqwest::header::CONTENT_DISPOSITION)?.to_str().ok()?;

    // filename*= (RFC 6266): charset'lang'percent-encoded-name, UTF-8 preferred.
    if let Some(pos) = raw.find("filename*=") {
        let rest = &raw[pos + "filename*=".len()..];
        let field = rest.split(';').next().unwrap_or("").trim();
        if let Some(last_quote) = field.rfind('\'') {
            let charset = field.split('\'').next().unwrap_or("");
            let encoded_name = &field[last_quote + 1..];
            let decoded = percent_encoding::percent_decode_str(encoded_name).decode_utf8();
            if charset.eq_ignore_ascii_case("utf-8") || charset.is_empty() {
                if let Ok(name) = decoded {
                    return Some(sanitize(&name));
                }
            }
            // Latin-1 fallback for non-UTF-8 charsets.
            let raw_bytes = percent_encoding::percent_decode_str(encoded_name).collect::<Vec<u8>>();
            let latin1: String = raw_bytes.iter().map(|&b| b as char).collect();
            if !latin1.is_empty() {
                return Some(sanitize(&latin1));
            }
        }
    }

    // Plain filename=, possibly quoted.
    if let Some(pos) = raw.find("filename=") {
        let rest = &raw[pos + "filename=".len()..];
        let field = rest.split(';').next().unwrap_or("").trim();
        let field = field.trim_matches('"').trim_matches('\'');
        if !field.is_empty() {
            let decoded = percent_encoding::percent_decode_str(field)
                .decode_utf8()
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| field.to_string());
            return Some(sanitize(&decoded));
        }
    }

    None
}

fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split('?').next().unwrap_or(url);
    let without_fragment = without_query.split('#').next().unwrap_or(without_query);
    let segment = without_fragment.rsplit('/').find(|s| !s.is_empty())?;
    let decoded = percent_encoding::percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(sanitize(&decoded))
    }
}

fn sanitize(name: &str) -> String {
    let cleaned = name.replace(|c: char| c.is_control() || "<>:\"/\\|?*".contains(c), "_");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A short, stable, non-cryptographic hash of `url` for the deterministic
/// filename fallback. FNV-1a keeps this dependency-free (the engine already
/// has real hash crates wired up for content verification in `hash.rs`; this
/// one is for naming, not integrity, so it doesn't need to borrow from them).
fn short_hash(url: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in url.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:08x}", (hash ^ (hash >> 32)) as u32)
}
