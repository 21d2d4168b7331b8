//! Tile Store Adapter.
//!
//! Logical `(table, z, x, y)` tile keys are salted across
//! [`AppConfig::salt_modulus`](crate::config::AppConfig) physical buckets to
//! spread hot tiles across backend partitions. Every salt bucket is read in
//! parallel; the results are independent shards of the same logical tile
//! (a commutative, associative merge, so the Assembler sums them and fetch
//! order never matters). Retry-with-backoff and pooled-connection
//! discipline follows a pooled, retry-wrapped query pattern; this
//! reference adapter backs the salted key-value store with a SQLite
//! table as a stand-in for whatever partitioned store a real deployment
//! would point at.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use moka::future::Cache;
use smartstring::alias::String as SmartStr;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::api_constants::{RETRY_ATTEMPTS, RETRY_BASE_DELAY_MS};
use crate::codec::{self, Layer};
use crate::error::BackendError;
use crate::projection::TileAddress;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_CAPACITY: u64 = 10_000;

/// A logical key into the salted tile store, prior to salting.
#[derive(Debug, Clone)]
pub struct TileKey {
    pub table: String,
    pub tile: TileAddress,
}

impl TileKey {
    pub fn new(table: impl Into<String>, tile: TileAddress) -> Self {
        Self {
            table: table.into(),
            tile,
        }
    }

    /// Physical row key for one salt bucket. The salt prefix is the first
    /// path segment so buckets sort together for any backend that orders
    /// keys lexically. Every generated key is short and request-scoped, so
    /// it's kept inline (`SmartStr`) rather than heap-allocated like the
    /// `table` field it's built from.
    fn salted_key(&self, salt: u8) -> SmartStr {
        SmartStr::from(format!(
            "{salt}:{}:{}:{}:{}",
            self.table, self.tile.z, self.tile.x, self.tile.y
        ))
    }
}

/// A raw occurrence point scanned from the points table, prior to
/// tile-local projection. Consulted only as a fallback when
/// [`SqliteTileStore::fetch_sharded_layers`] finds no precomputed shard for
/// a given zoom/key (`spec.md` §4.3: "used only when the tile cache is not
/// populated for zoom/key").
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub lat: f64,
    pub lon: f64,
    pub year: i64,
    pub basis_of_record: Option<String>,
}

#[derive(Clone)]
pub struct SqliteTileStore {
    pool: SqlitePool,
    salt_modulus: u8,
    cache: Cache<SmartStr, Bytes>,
}

impl SqliteTileStore {
    pub async fn connect(database_url: &str, salt_modulus: u8) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        // Each connection opened against an in-memory database sees its own
        // private, empty database unless it's the single connection in the
        // pool, so `:memory:` URLs can never be spread across more than one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 20 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tile_shards (\
                row_key TEXT PRIMARY KEY, \
                payload BLOB NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS occurrence_points (\
                table_key TEXT NOT NULL, \
                lat REAL NOT NULL, \
                lon REAL NOT NULL, \
                year INTEGER NOT NULL, \
                basis_of_record TEXT\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_occurrence_points_key_lat_lon \
             ON occurrence_points(table_key, lat, lon)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            salt_modulus,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(60))
                .build(),
        })
    }

    /// Fetch and decode every salt shard for a logical tile in parallel,
    /// returning the concatenated layers from whichever shards exist.
    /// Absent shards (no data for that salt bucket) are skipped, not
    /// errors; a wholly-absent tile returns an empty vec.
    pub async fn fetch_sharded_layers(&self, key: &TileKey) -> Result<Vec<Layer>, BackendError> {
        let fetches = (0..self.salt_modulus)
            .map(|salt| self.fetch_shard_with_retry(key, salt));
        let shards = futures::future::join_all(fetches).await;

        let mut layers = Vec::new();
        for shard in shards {
            if let Some(bytes) = shard? {
                let decoded = codec::decode(&bytes).map_err(|e| {
                    BackendError::new(format!("corrupt shard for {}: {e}", key.table))
                })?;
                layers.extend(decoded);
            }
        }
        Ok(layers)
    }

    async fn fetch_shard_with_retry(
        &self,
        key: &TileKey,
        salt: u8,
    ) -> Result<Option<Bytes>, BackendError> {
        let row_key = key.salted_key(salt);

        if let Some(cached) = self.cache.get(&row_key).await {
            return Ok(Some(cached));
        }

        let mut attempt = 0u32;
        loop {
            match self.fetch_once(&row_key).await {
                Ok(found) => {
                    if let Some(bytes) = &found {
                        self.cache.insert(row_key.clone(), bytes.clone()).await;
                    }
                    return Ok(found);
                }
                Err(err) if attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    warn!(
                        "tile shard fetch failed (attempt {attempt}/{RETRY_ATTEMPTS}), \
                         retrying in {delay}ms: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => {
                    error!("tile shard fetch exhausted retries: {err}");
                    return Err(BackendError::new(format!(
                        "store unavailable after {RETRY_ATTEMPTS} attempts"
                    )));
                }
            }
        }
    }

    async fn fetch_once(&self, row_key: &SmartStr) -> Result<Option<Bytes>, sqlx::Error> {
        let row: Option<(Vec<u8>,)> = tokio::time::timeout(
            QUERY_TIMEOUT,
            sqlx::query_as("SELECT payload FROM tile_shards WHERE row_key = ?")
                .bind(row_key.as_str())
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)??;

        Ok(row.map(|(bytes,)| Bytes::from(bytes)))
    }

    /// Write one salt shard. Used by tests and by any ingestion path that
    /// populates the reference store; the read path above is what the
    /// Assembler exercises in production.
    pub async fn put_shard(
        &self,
        key: &TileKey,
        salt: u8,
        payload: &[u8],
    ) -> Result<(), sqlx::Error> {
        let row_key = key.salted_key(salt);
        sqlx::query(
            "INSERT INTO tile_shards (row_key, payload) VALUES (?, ?) \
             ON CONFLICT(row_key) DO UPDATE SET payload = excluded.payload",
        )
        .bind(row_key.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        self.cache.invalidate(&row_key).await;
        Ok(())
    }

    /// Scan the points table for raw occurrence points within `bbox`
    /// (`min_lon, min_lat, max_lon, max_lat`). The Assembler falls back to
    /// this only once `fetch_sharded_layers` has come back empty for the
    /// requested zoom/key; a populated tile shard is always preferred,
    /// since it's already pixel-quantised and pre-aggregated.
    pub async fn get_points(
        &self,
        table: &str,
        map_key: &str,
        bbox: (f64, f64, f64, f64),
    ) -> Result<Vec<PointRecord>, BackendError> {
        let table_key = format!("{table}:{map_key}");
        let (min_lon, min_lat, max_lon, max_lat) = bbox;

        let rows: Vec<(f64, f64, i64, Option<String>)> = tokio::time::timeout(
            QUERY_TIMEOUT,
            sqlx::query_as(
                "SELECT lat, lon, year, basis_of_record FROM occurrence_points \
                 WHERE table_key = ? AND lat >= ? AND lat <= ? AND lon >= ? AND lon <= ?",
            )
            .bind(&table_key)
            .bind(min_lat)
            .bind(max_lat)
            .bind(min_lon)
            .bind(max_lon)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| BackendError::new("points scan timed out"))?
        .map_err(|e| BackendError::new(format!("points scan failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(lat, lon, year, basis_of_record)| PointRecord {
                lat,
                lon,
                year,
                basis_of_record,
            })
            .collect())
    }

    /// Insert one raw occurrence point. Used by tests and by any ingestion
    /// path that populates the reference points table; the points route
    /// only ever reads via [`get_points`](Self::get_points).
    pub async fn put_point(
        &self,
        table: &str,
        map_key: &str,
        point: &PointRecord,
    ) -> Result<(), sqlx::Error> {
        let table_key = format!("{table}:{map_key}");
        sqlx::query(
            "INSERT INTO occurrence_points (table_key, lat, lon, year, basis_of_record) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&table_key)
        .bind(point.lat)
        .bind(point.lon)
        .bind(point.year)
        .bind(&point.basis_of_record)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AttrValue, Feature, Geometry};
    use std::collections::BTreeMap;

    fn sample_layer(name: &str) -> Layer {
        let mut attrs = BTreeMap::new();
        attrs.insert("2020".to_string(), AttrValue::Int(3));
        Layer {
            name: name.to_string(),
            extent: 512,
            features: vec![Feature {
                id: Some(1),
                geometry: Geometry::Point(10, 10),
                attributes: attrs,
            }],
        }
    }

    #[tokio::test]
    async fn missing_tile_returns_empty_layers() {
        let store = SqliteTileStore::connect("sqlite::memory:", 4).await.unwrap();
        let key = TileKey::new("occurrence_tiles", TileAddress::new(3, 1, 1).unwrap());
        let layers = store.fetch_sharded_layers(&key).await.unwrap();
        assert!(layers.is_empty());
    }

    #[tokio::test]
    async fn shards_across_salts_are_merged() {
        let store = SqliteTileStore::connect("sqlite::memory:", 4).await.unwrap();
        let key = TileKey::new("occurrence_tiles", TileAddress::new(3, 1, 1).unwrap());

        let bytes_a = codec::encode(&[sample_layer("a")], 512, 64).unwrap();
        let bytes_b = codec::encode(&[sample_layer("b")], 512, 64).unwrap();
        store.put_shard(&key, 0, &bytes_a).await.unwrap();
        store.put_shard(&key, 2, &bytes_b).await.unwrap();

        let layers = store.fetch_sharded_layers(&key).await.unwrap();
        let mut names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn points_scan_is_bounded_by_bbox() {
        let store = SqliteTileStore::connect("sqlite::memory:", 2).await.unwrap();
        let inside = PointRecord {
            lat: 10.0,
            lon: 10.0,
            year: 2020,
            basis_of_record: Some("HUMAN_OBSERVATION".to_string()),
        };
        let outside = PointRecord {
            lat: 80.0,
            lon: 80.0,
            year: 2020,
            basis_of_record: None,
        };
        store.put_point("occurrence_points", "taxonKey:1", &inside).await.unwrap();
        store.put_point("occurrence_points", "taxonKey:1", &outside).await.unwrap();

        let found = store
            .get_points("occurrence_points", "taxonKey:1", (0.0, 0.0, 20.0, 20.0))
            .await
            .unwrap();
        assert_eq!(found, vec![inside]);
    }

    #[tokio::test]
    async fn points_scan_is_scoped_to_map_key() {
        let store = SqliteTileStore::connect("sqlite::memory:", 2).await.unwrap();
        let point = PointRecord {
            lat: 5.0,
            lon: 5.0,
            year: 2019,
            basis_of_record: None,
        };
        store.put_point("occurrence_points", "taxonKey:1", &point).await.unwrap();

        let found = store
            .get_points("occurrence_points", "taxonKey:2", (0.0, 0.0, 20.0, 20.0))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn cache_serves_repeat_fetch_without_requerying() {
        let store = SqliteTileStore::connect("sqlite::memory:", 2).await.unwrap();
        let key = TileKey::new("occurrence_tiles", TileAddress::new(2, 0, 0).unwrap());
        let bytes = codec::encode(&[sample_layer("a")], 512, 64).unwrap();
        store.put_shard(&key, 0, &bytes).await.unwrap();

        let first = store.fetch_sharded_layers(&key).await.unwrap();
        let second = store.fetch_sharded_layers(&key).await.unwrap();
        assert_eq!(first, second);
    }
}
