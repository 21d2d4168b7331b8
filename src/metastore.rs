//! Metastore: logical-to-physical table name resolution.
//!
//! `Static` resolves from the values read once at startup
//! ([`AppConfig`](crate::config::AppConfig)). `Watched` is backed by a
//! coordination service and kept current through a [`tokio::sync::watch`]
//! channel, readers take a cheap clone of the current mapping and never
//! hold a lock across network I/O, the same read-mostly discipline the
//! a connection pool applies to its connections (acquire, use,
//! release; never hold a lock while awaiting).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ConfigurationError;

/// Logical table names this service resolves against the Metastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalTable {
    DensityTiles,
    Points,
}

#[derive(Debug, Clone, Default)]
struct Mapping(HashMap<&'static str, String>);

impl Mapping {
    fn resolve(&self, table: LogicalTable) -> Option<&str> {
        self.0.get(Self::key(table)).map(String::as_str)
    }

    const fn key(table: LogicalTable) -> &'static str {
        match table {
            LogicalTable::DensityTiles => "density_tiles",
            LogicalTable::Points => "points",
        }
    }
}

/// Resolves logical table names to physical ones.
#[derive(Clone)]
pub enum Metastore {
    /// Fixed at startup from configuration; never changes for the
    /// lifetime of the process.
    Static(Arc<Mapping>),
    /// Backed by a coordination service; a background task refreshes the
    /// mapping and publishes it through a watch channel.
    Watched(watch::Receiver<Mapping>),
}

impl Metastore {
    pub fn static_from_config(
        density_tiles_table: impl Into<String>,
        points_table: impl Into<String>,
    ) -> Self {
        let mut mapping = Mapping::default();
        mapping
            .0
            .insert(Mapping::key(LogicalTable::DensityTiles), density_tiles_table.into());
        mapping
            .0
            .insert(Mapping::key(LogicalTable::Points), points_table.into());
        Self::Static(Arc::new(mapping))
    }

    /// Spawn a background poller against `quorum` and return a `Watched`
    /// metastore reading from it. `poll` is injected so tests can exercise
    /// the channel-refresh path without a real coordination service.
    pub fn watched<F, Fut>(initial: HashMap<&'static str, String>, interval: Duration, poll: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HashMap<&'static str, String>, ConfigurationError>>
            + Send,
    {
        let (tx, rx) = watch::channel(Mapping(initial));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match poll().await {
                    Ok(next) => {
                        if tx.send(Mapping(next)).is_err() {
                            info!("metastore watcher stopping: no receivers left");
                            return;
                        }
                    }
                    Err(e) => warn!("metastore refresh failed, keeping previous mapping: {e}"),
                }
            }
        });

        Self::Watched(rx)
    }

    /// Resolve a logical table to its current physical name. Readers never
    /// block on the refresh task: `Watched` takes a borrow of whatever the
    /// last successful publish was.
    pub fn resolve(&self, table: LogicalTable) -> Result<String, ConfigurationError> {
        let mapping = match self {
            Self::Static(mapping) => mapping.as_ref().clone(),
            Self::Watched(rx) => rx.borrow().clone(),
        };

        mapping.resolve(table).map(str::to_owned).ok_or_else(|| {
            ConfigurationError::new(format!(
                "no physical table registered for {table:?}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolves_configured_names() {
        let metastore = Metastore::static_from_config("occurrence_tiles", "occurrence_points");
        assert_eq!(
            metastore.resolve(LogicalTable::DensityTiles).unwrap(),
            "occurrence_tiles"
        );
        assert_eq!(
            metastore.resolve(LogicalTable::Points).unwrap(),
            "occurrence_points"
        );
    }

    #[tokio::test]
    async fn watched_reflects_background_refresh() {
        let mut initial = HashMap::new();
        initial.insert(Mapping::key(LogicalTable::DensityTiles), "v1_tiles".to_string());
        initial.insert(Mapping::key(LogicalTable::Points), "v1_points".to_string());

        let metastore = Metastore::watched(initial, Duration::from_millis(10), || async {
            let mut next = HashMap::new();
            next.insert(Mapping::key(LogicalTable::DensityTiles), "v2_tiles".to_string());
            next.insert(Mapping::key(LogicalTable::Points), "v2_points".to_string());
            Ok(next)
        });

        assert_eq!(
            metastore.resolve(LogicalTable::DensityTiles).unwrap(),
            "v1_tiles"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            metastore.resolve(LogicalTable::DensityTiles).unwrap(),
            "v2_tiles"
        );
    }
}
