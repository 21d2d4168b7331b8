//! Search Backend Adapter.
//!
//! The ad-hoc route bypasses the salted tile store entirely and instead
//! issues a geogrid aggregation request to an external search backend,
//! bounded by the requested tile's buffered envelope. WGS84 is the only
//! scheme this path supports; the search backend's geogrid aggregation
//! speaks lon/lat, not a specific tile projection's pixel grid.
//!
//! `reqwest` is the HTTP client used to talk to the external search
//! backend.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BackendError;
use crate::filter::FilterGroup;
use crate::projection::{self, TileAddress, TileScheme};

#[derive(Clone)]
pub struct SearchBackendAdapter {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GeogridResponse {
    aggregations: GeogridAggregations,
}

#[derive(Debug, Deserialize)]
struct GeogridAggregations {
    grid: GeogridBuckets,
}

#[derive(Debug, Deserialize)]
struct GeogridBuckets {
    buckets: Vec<GeogridBucket>,
}

#[derive(Debug, Deserialize)]
struct GeogridBucket {
    key: String,
    doc_count: u64,
}

/// One aggregated grid cell returned by the search backend: its geohash
/// key and the number of occurrences it represents.
#[derive(Debug, Clone, PartialEq)]
pub struct GeogridCell {
    pub geohash: String,
    pub count: u64,
}

const GEOHASH_BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Decode a geohash string to its cell's centre `(lat, lon)`. Hand-rolled
/// rather than pulling in a geohash crate, consistent with the
/// closed-form coordinate arithmetic used elsewhere (`projection.rs`,
/// `binning.rs`) for small, stable algorithms.
pub fn decode_geohash(hash: &str) -> Option<(f64, f64)> {
    if hash.is_empty() {
        return None;
    }
    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut even_bit = true;

    for c in hash.chars() {
        let idx = GEOHASH_BASE32.iter().position(|&b| b as char == c)?;
        for bit in (0..5).rev() {
            let bit_set = (idx >> bit) & 1 == 1;
            if even_bit {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit_set {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit_set {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even_bit = !even_bit;
        }
    }

    Some(((lat_lo + lat_hi) / 2.0, (lon_lo + lon_hi) / 2.0))
}

/// Project a geohash bucket's centre into the requesting tile's local
/// pixel space, as the centroid point for that grid cell. `None` if the
/// hash fails to decode.
pub fn geohash_to_tile_local(hash: &str, tile: TileAddress, tile_size: u32) -> Option<(i32, i32)> {
    let (lat, lon) = decode_geohash(hash)?;
    let global = projection::to_global_pixel_xy(lat, lon, tile.z, TileScheme::Wgs84PlateCarree, tile_size);
    let (lx, ly) = projection::to_tile_local_xy(global, tile, tile_size);
    Some((lx.round() as i32, ly.round() as i32))
}

impl SearchBackendAdapter {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::new(format!("failed to build search client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Run a geogrid aggregation bounded by the tile's buffered envelope,
    /// optionally narrowed by `filter`.
    pub async fn geogrid_aggregate(
        &self,
        tile: TileAddress,
        bounds: (f64, f64, f64, f64),
        precision: u8,
        filter: Option<&FilterGroup>,
    ) -> Result<Vec<GeogridCell>, BackendError> {
        let (min_lon, min_lat, max_lon, max_lat) = bounds;

        let mut must: Vec<Value> = vec![json!({
            "geo_bounding_box": {
                "coordinates": {
                    "top_left": [min_lon, max_lat],
                    "bottom_right": [max_lon, min_lat]
                }
            }
        })];
        if let Some(filter) = filter {
            must.push(filter.to_query());
        }

        let body = json!({
            "size": 0,
            "query": {"bool": {"must": must}},
            "aggs": {
                "grid": {
                    "geohash_grid": {
                        "field": "coordinates",
                        "precision": precision
                    }
                }
            }
        });

        let url = format!("{}/occurrence/_search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::new(format!("search backend unreachable: {e}, tile z={}", tile.z)))?;

        if !response.status().is_success() {
            return Err(BackendError::new(format!(
                "search backend returned status {}",
                response.status()
            )));
        }

        let parsed: GeogridResponse = response
            .json()
            .await
            .map_err(|e| BackendError::new(format!("malformed search backend response: {e}")))?;

        Ok(parsed
            .aggregations
            .grid
            .buckets
            .into_iter()
            .map(|b| GeogridCell {
                geohash: b.key,
                count: b.doc_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geogrid_response_deserialises() {
        let raw = r#"{
            "aggregations": {
                "grid": {
                    "buckets": [
                        {"key": "u4pruydqqvj", "doc_count": 12},
                        {"key": "u4pruydqqvk", "doc_count": 3}
                    ]
                }
            }
        }"#;
        let parsed: GeogridResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.aggregations.grid.buckets.len(), 2);
        assert_eq!(parsed.aggregations.grid.buckets[0].doc_count, 12);
    }

    #[test]
    fn geohash_decodes_near_known_location() {
        // "u4pruydqqvj" is a well-known reference geohash for
        // (57.64911, 10.40744).
        let (lat, lon) = decode_geohash("u4pruydqqvj").unwrap();
        assert!((lat - 57.649_11).abs() < 0.01);
        assert!((lon - 10.407_44).abs() < 0.01);
    }

    #[test]
    fn geohash_rejects_invalid_characters() {
        assert!(decode_geohash("u4pra!").is_none());
    }

    #[test]
    fn geohash_to_tile_local_lands_inside_the_containing_tile() {
        let tile = TileAddress::new(4, 8, 1).unwrap();
        // This tile (z=4,x=8,y=1) covers lon [0,22.5) and lat [45,67.5)
        // under the WGS84 plate carree scheme the ad-hoc path uses, which
        // contains the reference geohash above (57.65 N, 10.41 E).
        let (lx, ly) = geohash_to_tile_local("u4pruydqqvj", tile, 512).unwrap();
        assert!((0..=512).contains(&lx));
        assert!((0..=512).contains(&ly));
    }
}
