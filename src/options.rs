//! Caller-facing options (spec.md §6), generalized from the teacher's
//! `DownloadConfig`. Every field here has the default spec.md names.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Tri;

/// `max_connections`: `auto` or a fixed worker count clamped to `[1, 24]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxConnections {
    Auto,
    Fixed(u8),
}

impl Default for MaxConnections {
    fn default() -> Self {
        MaxConnections::Auto
    }
}

/// `hash_type`: the algorithm family used by the finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Blake2b,
    Blake2s,
}

impl Default for HashType {
    fn default() -> Self {
        HashType::Md5
    }
}

/// The complete option set a caller can pass to [`crate::download`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub max_connections: MaxConnections,
    pub connection_speed_mbps: f64,
    pub pre_allocate_space: bool,
    pub use_ram_buffer: Tri,
    pub overwrite: bool,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub inactivity_timeout: Duration,
    pub expected_hash: Option<String>,
    pub hash_type: HashType,
    pub show_progress: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "User-Agent".to_string(),
            format!("turbodl/{}", env!("CARGO_PKG_VERSION")),
        );
        headers.insert("Accept".to_string(), "*/*".to_string());
        headers.insert("Accept-Encoding".to_string(), "identity".to_string());

        Self {
            max_connections: MaxConnections::Auto,
            connection_speed_mbps: 80.0,
            pre_allocate_space: false,
            use_ram_buffer: Tri::Auto,
            overwrite: true,
            headers,
            timeout: None,
            inactivity_timeout: Duration::from_secs(120),
            expected_hash: None,
            hash_type: HashType::Md5,
            show_progress: true,
        }
    }
}
