// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Runtime configuration, read once at startup from the environment.
///
/// Every field has a sane default so the server runs unconfigured in a
/// throwaway data directory; production deployments set `CXDB_DATA_DIR` at
/// minimum.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub http_bind_addr: String,
    /// Maximum frame payload accepted on the binary wire, in bytes.
    pub max_payload_bytes: u32,
    /// Maximum number of in-flight requests the server will process
    /// concurrently per connection before refusing new ones with ERROR.
    pub max_inflight_per_conn: u32,
    /// When true, APPEND_TURN rejects unknown (type_id, type_version) hints
    /// instead of accepting storage-first. Off by default per the core's
    /// documented default.
    pub strict_registry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cxdb-data"),
            bind_addr: "0.0.0.0:7300".to_string(),
            http_bind_addr: "0.0.0.0:7301".to_string(),
            max_payload_bytes: 1024 * 1024,
            max_inflight_per_conn: 1,
            strict_registry: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CXDB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: std::env::var("CXDB_BIND").unwrap_or(defaults.bind_addr),
            http_bind_addr: std::env::var("CXDB_HTTP_BIND").unwrap_or(defaults.http_bind_addr),
            max_payload_bytes: std::env::var("CXDB_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_payload_bytes),
            max_inflight_per_conn: std::env::var("CXDB_MAX_INFLIGHT_PER_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_inflight_per_conn),
            strict_registry: std::env::var("CXDB_STRICT_REGISTRY")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.strict_registry),
        }
    }
}
