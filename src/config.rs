//! Structured startup configuration.
//!
//! This service does not own a config *file format* or a hot-reload
//! mechanism, but it still needs a concrete, typed configuration surface
//! to start from: each field is parsed from an environment variable with
//! an explicit default and a descriptive error on bad input, rather than
//! pulling in a config-file crate for a handful of scalars.

use std::env;
use std::time::Duration;

use crate::api_constants::{DEFAULT_BUFFER_SIZE, DEFAULT_SALT_MODULUS, DEFAULT_TILE_SIZE};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port the main HTTP listener binds to.
    pub port: u16,
    /// Separate admin port (metrics/health probes in a real deployment);
    /// carried as configuration even though this service does not stand
    /// up the admin listener itself.
    pub admin_port: u16,
    /// Pixel size of a tile, excluding buffer.
    pub tile_size: u32,
    /// Pixel margin around a tile within which neighbouring features may
    /// appear.
    pub buffer_size: u32,
    /// Number of salt buckets a logical row key is spread across.
    pub salt_modulus: u8,
    /// Physical table name for precomputed density tiles, used when the
    /// Metastore is running in `Static` mode.
    pub tiles_table: String,
    /// Physical table name for the raw points table, used when the tile
    /// cache is not populated for a given zoom/key.
    pub points_table: String,
    /// Coordination-service quorum string for the Watched metastore
    /// variant. `None` selects the Static variant.
    pub metastore_quorum: Option<String>,
    /// Base URL of the ad-hoc search backend.
    pub search_backend_url: String,
    /// Per-request wall-clock timeout (default 30s).
    pub request_timeout: Duration,
    /// Response bodies at or above this size are eligible for gzip
    /// (carried as configuration only, HTTP framing is out of scope).
    pub gzip_threshold_bytes: u64,
    /// Optional service-discovery registration endpoint.
    pub discovery_endpoint: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            port: parse_env_or("PORT", 3001)?,
            admin_port: parse_env_or("ADMIN_PORT", 3002)?,
            tile_size: parse_env_or("TILE_SIZE", DEFAULT_TILE_SIZE)?,
            buffer_size: parse_env_or("BUFFER_SIZE", DEFAULT_BUFFER_SIZE)?,
            salt_modulus: parse_env_or("SALT_MODULUS", DEFAULT_SALT_MODULUS)?,
            tiles_table: env::var("TILES_TABLE").unwrap_or_else(|_| "occurrence_tiles".into()),
            points_table: env::var("POINTS_TABLE").unwrap_or_else(|_| "occurrence_points".into()),
            metastore_quorum: env::var("METASTORE_QUORUM").ok(),
            search_backend_url: env::var("SEARCH_BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:9200".into()),
            request_timeout: Duration::from_secs(parse_env_or("REQUEST_TIMEOUT_SECS", 30u64)?),
            gzip_threshold_bytes: parse_env_or("GZIP_THRESHOLD_BYTES", 1024u64)?,
            discovery_endpoint: env::var("DISCOVERY_ENDPOINT").ok(),
        })
    }
}

fn parse_env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| {
            anyhow::anyhow!("invalid value for {name} = '{raw}': {e}")
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_to_default() {
        // SAFETY: test-only, single-threaded access to a var no other
        // test touches.
        unsafe {
            env::remove_var("BIOTILES_TEST_MISSING");
        }
        let value: u32 = parse_env_or("BIOTILES_TEST_MISSING", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_or_reports_bad_values() {
        unsafe {
            env::set_var("BIOTILES_TEST_BAD", "not-a-number");
        }
        let result = parse_env_or::<u32>("BIOTILES_TEST_BAD", 1);
        unsafe {
            env::remove_var("BIOTILES_TEST_BAD");
        }
        assert!(result.is_err());
    }
}
