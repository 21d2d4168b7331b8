//! Tile Assembler: the orchestration pipeline behind the density and
//! regression-tile routes.
//!
//! Metastore resolve -> Store Adapter fetch -> Codec decode -> year/BOR
//! filter and sum -> optional Hex/Square binning -> Codec encode. Binning
//! is skipped entirely when there are no features after filtering (the
//! empty-input bypass): a zero-feature tile is valid and
//! common (the vast majority of the world has no occurrence data at high
//! zoom), and `NoDataError` from the binning engine is not itself an
//! error condition at this layer.

use std::collections::BTreeMap;

use crate::api_constants::{DEFAULT_HEX_PER_TILE, DEFAULT_SQUARE_SIZE};
use crate::binning::{self, BinMode, BinningConfig, CellId};
use crate::codec::{self, AttrValue, Feature, Layer};
use crate::error::{ApiError, BackendError};
use crate::filter::OccurrenceFilters;
use crate::metastore::{LogicalTable, Metastore};
use crate::projection::{self, TileAddress, TileScheme};
use crate::tile_store::{PointRecord, SqliteTileStore, TileKey};

pub const DENSITY_LAYER_NAME: &str = "occurrence";

/// Default map key for the density/regression routes when no taxon (or
/// other `MapKey`) filter narrows the request: the whole occurrence
/// dataset for that logical table.
pub const ALL_OCCURRENCES_KEY: &str = "all";

pub struct AssembleRequest {
    pub tile: TileAddress,
    pub tile_size: u32,
    pub buffer_size: u32,
    pub map_key: String,
    pub filters: OccurrenceFilters,
    pub binning: Option<BinningConfig>,
    pub scheme: TileScheme,
}

/// Fetch, filter, optionally bin, and re-encode one density tile.
pub async fn assemble_density_tile(
    store: &SqliteTileStore,
    metastore: &Metastore,
    request: &AssembleRequest,
) -> Result<Vec<u8>, ApiError> {
    let table = metastore.resolve(LogicalTable::DensityTiles)?;
    let key = TileKey::new(format!("{table}:{}", request.map_key), request.tile);
    let shards = store.fetch_sharded_layers(&key).await?;

    let shards = if shards.is_empty() {
        fetch_points_as_layers(
            store,
            metastore,
            request.tile,
            request.tile_size,
            request.buffer_size,
            request.scheme,
            &request.map_key,
        )
        .await?
    } else {
        shards
    };

    let features = project_features(&shards, &request.filters);

    let layers = match request.binning {
        Some(config) if !features.is_empty() => {
            let binned = binning::bin_features(&features, request.tile, request.tile_size, &config)
                .map_err(|_| BackendError::new("binning reported no data after a non-empty filter pass"))?;
            vec![Layer {
                name: DENSITY_LAYER_NAME.to_string(),
                extent: request.tile_size,
                features: binned,
            }]
        }
        _ => vec![Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: request.tile_size,
            features,
        }],
    };

    Ok(codec::encode(&layers, request.tile_size, request.buffer_size)?)
}

/// Fetch and hex-bin one taxon's occurrence cells for the Regression
/// Engine: always `verbose` (every year must survive, not
/// just the filtered `total`) and unfiltered by year/BOR, since the
/// regression fits the year axis itself. Returns the cells keyed by their
/// stable `CellId` so the caller can pair them against a second tile.
pub async fn assemble_hex_cells(
    store: &SqliteTileStore,
    metastore: &Metastore,
    tile: TileAddress,
    tile_size: u32,
    map_key: &str,
) -> Result<Vec<(CellId, Feature)>, ApiError> {
    let table = metastore.resolve(LogicalTable::DensityTiles)?;
    let key = TileKey::new(format!("{table}:{map_key}"), tile);
    let shards = store.fetch_sharded_layers(&key).await?;
    let buffer_size = crate::api_constants::DEFAULT_BUFFER_SIZE;
    let shards = if shards.is_empty() {
        fetch_points_as_layers(
            store,
            metastore,
            tile,
            tile_size,
            buffer_size,
            TileScheme::WebMercator,
            map_key,
        )
        .await?
    } else {
        shards
    };

    let filters = OccurrenceFilters {
        years: None,
        basis_of_record: Default::default(),
        verbose: true,
    };
    let features = project_features(&shards, &filters);
    if features.is_empty() {
        return Ok(Vec::new());
    }

    let config = BinningConfig {
        mode: BinMode::Hex,
        hex_per_tile: DEFAULT_HEX_PER_TILE,
        square_size: DEFAULT_SQUARE_SIZE,
    };
    binning::bin_features_keyed(&features, tile, tile_size, &config)
        .map_err(|_| BackendError::new("binning reported no data after a non-empty filter pass").into())
}

/// Scan the raw points table and project each point into tile-local pixel
/// space, for use only when the precomputed tile shard was entirely absent
/// (`spec.md` §4.3's `getPoints` fallback: "used only when the tile cache
/// is not populated for zoom/key"). Points outside the buffered tile
/// envelope after projection are dropped; each surviving point becomes a
/// one-occurrence `Feature` so it flows through `project_features` exactly
/// like a stored tile's pre-aggregated features.
async fn fetch_points_as_layers(
    store: &SqliteTileStore,
    metastore: &Metastore,
    tile: TileAddress,
    tile_size: u32,
    buffer_size: u32,
    scheme: TileScheme,
    map_key: &str,
) -> Result<Vec<Layer>, ApiError> {
    let points_table = metastore.resolve(LogicalTable::Points)?;
    let bounds = projection::buffered_tile_boundary(tile, scheme, tile_size, buffer_size);
    let points = store.get_points(&points_table, map_key, bounds).await?;

    let features = points
        .into_iter()
        .filter_map(|point| point_to_feature(point, tile, tile_size, buffer_size, scheme))
        .collect();

    Ok(vec![Layer {
        name: DENSITY_LAYER_NAME.to_string(),
        extent: tile_size,
        features,
    }])
}

/// Project one raw point into tile-local pixel space, keeping it only if
/// it lands within the tile's buffered bounds. Each point carries exactly
/// one year's worth of a single occurrence (`count = 1`), which
/// `project_features` sums like any other year-keyed attribute.
fn point_to_feature(
    point: PointRecord,
    tile: TileAddress,
    tile_size: u32,
    buffer_size: u32,
    scheme: TileScheme,
) -> Option<Feature> {
    let global = projection::to_global_pixel_xy(point.lat, point.lon, tile.z, scheme, tile_size);
    let local = projection::to_tile_local_xy(global, tile, tile_size);
    if !projection::in_buffered_bounds(local, tile_size, buffer_size) {
        return None;
    }

    let mut attributes = BTreeMap::new();
    attributes.insert(point.year.to_string(), AttrValue::Int(1));
    if let Some(basis_of_record) = point.basis_of_record {
        attributes.insert(format!("BASIS_OF_RECORD_{basis_of_record}"), AttrValue::Int(1));
    }

    Some(Feature {
        id: None,
        geometry: codec::Geometry::Point(local.0.round() as i32, local.1.round() as i32),
        attributes,
    })
}

/// Prefix stored density tiles use for per-category occurrence-basis
/// counts, e.g. `BASIS_OF_RECORD_HUMAN_OBSERVATION`; see `spec.md`'s
/// TileRecord attribute shape.
const BASIS_OF_RECORD_PREFIX: &str = "BASIS_OF_RECORD_";

/// Merge shard layers' features by geometry, summing year-keyed
/// attributes that pass the year range filter into a single `total`
/// attribute. `BASIS_OF_RECORD_*` keys are matched against the
/// basis-of-record filter by their category suffix; keys that do not
/// parse as a year are never summed, and are dropped entirely unless
/// `verbose` is set, in which case they are kept verbatim (see
/// `SPEC_FULL.md` §4 for the resolved rule).
fn project_features(shards: &[Layer], filters: &OccurrenceFilters) -> Vec<Feature> {
    let mut merged: BTreeMap<Vec<u8>, (Feature, i64)> = BTreeMap::new();

    for layer in shards {
        for feature in &layer.features {
            let geometry_key = geometry_fingerprint(&feature.geometry);
            let mut total = 0i64;
            let mut kept_attrs = BTreeMap::new();

            for (key, value) in &feature.attributes {
                match key.parse::<i64>() {
                    Ok(year) => {
                        if !filters.year_passes(year) {
                            continue;
                        }
                        let amount = match value {
                            AttrValue::Int(i) => *i,
                            AttrValue::UInt(u) => *u as i64,
                            _ => 0,
                        };
                        total += amount;
                        if filters.verbose {
                            kept_attrs.insert(key.clone(), value.clone());
                        }
                    }
                    Err(_) => {
                        if !filters.verbose {
                            continue;
                        }
                        if let Some(code) = key.strip_prefix(BASIS_OF_RECORD_PREFIX) {
                            if !filters.basis_of_record_passes(code) {
                                continue;
                            }
                        }
                        kept_attrs.insert(key.clone(), value.clone());
                    }
                }
            }

            let entry = merged.entry(geometry_key).or_insert_with(|| {
                (
                    Feature {
                        id: feature.id,
                        geometry: feature.geometry.clone(),
                        attributes: kept_attrs.clone(),
                    },
                    0,
                )
            });
            entry.0.attributes.extend(kept_attrs);
            entry.1 += total;
        }
    }

    merged
        .into_values()
        .filter(|(_, total)| *total > 0)
        .map(|(mut feature, total)| {
            feature.attributes.insert("total".to_string(), AttrValue::Int(total));
            feature
        })
        .collect()
}

/// A stable byte-comparable fingerprint of a geometry, used as a merge
/// key so the same point reported by two salt shards collapses into one
/// feature. Cheaper than deriving `Ord` on `Geometry` for a key that is
/// only ever compared, never rendered.
fn geometry_fingerprint(geometry: &codec::Geometry) -> Vec<u8> {
    format!("{geometry:?}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::YearRange;

    fn feature_with_years(years: &[(i64, i64)]) -> Feature {
        let mut attrs = BTreeMap::new();
        for (year, count) in years {
            attrs.insert(year.to_string(), AttrValue::Int(*count));
        }
        Feature {
            id: Some(1),
            geometry: codec::Geometry::Point(10, 10),
            attributes: attrs,
        }
    }

    #[test]
    fn sums_years_within_range() {
        let layer = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![feature_with_years(&[(2019, 5), (2020, 3), (2021, 1)])],
        };
        let filters = OccurrenceFilters {
            years: Some(YearRange::parse("2020,2021").unwrap()),
            basis_of_record: Default::default(),
            verbose: false,
        };
        let out = project_features(&[layer], &filters);
        assert_eq!(out.len(), 1);
        match out[0].attributes.get("total") {
            Some(AttrValue::Int(v)) => assert_eq!(*v, 4),
            _ => panic!("expected total"),
        }
    }

    #[test]
    fn zero_total_after_filtering_drops_the_feature() {
        let layer = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![feature_with_years(&[(2000, 5)])],
        };
        let filters = OccurrenceFilters {
            years: Some(YearRange::parse("2020,2021").unwrap()),
            basis_of_record: Default::default(),
            verbose: false,
        };
        let out = project_features(&[layer], &filters);
        assert!(out.is_empty());
    }

    #[test]
    fn non_verbose_drops_basis_of_record_keys() {
        let mut attrs = BTreeMap::new();
        attrs.insert("2020".to_string(), AttrValue::Int(5));
        attrs.insert(
            "BASIS_OF_RECORD_HUMAN_OBSERVATION".to_string(),
            AttrValue::Int(5),
        );
        let layer = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![Feature {
                id: Some(1),
                geometry: codec::Geometry::Point(10, 10),
                attributes: attrs,
            }],
        };
        let out = project_features(&[layer], &OccurrenceFilters::default());
        assert_eq!(out.len(), 1);
        assert!(!out[0].attributes.contains_key("BASIS_OF_RECORD_HUMAN_OBSERVATION"));
    }

    #[test]
    fn verbose_basis_of_record_filter_drops_non_matching_category() {
        let mut attrs = BTreeMap::new();
        attrs.insert("2020".to_string(), AttrValue::Int(5));
        attrs.insert(
            "BASIS_OF_RECORD_HUMAN_OBSERVATION".to_string(),
            AttrValue::Int(3),
        );
        attrs.insert(
            "BASIS_OF_RECORD_PRESERVED_SPECIMEN".to_string(),
            AttrValue::Int(2),
        );
        let layer = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![Feature {
                id: Some(1),
                geometry: codec::Geometry::Point(10, 10),
                attributes: attrs,
            }],
        };
        let mut basis_of_record = std::collections::HashSet::new();
        basis_of_record.insert("HUMAN_OBSERVATION".to_string());
        let filters = OccurrenceFilters {
            years: None,
            basis_of_record,
            verbose: true,
        };
        let out = project_features(&[layer], &filters);
        assert!(out[0]
            .attributes
            .contains_key("BASIS_OF_RECORD_HUMAN_OBSERVATION"));
        assert!(!out[0]
            .attributes
            .contains_key("BASIS_OF_RECORD_PRESERVED_SPECIMEN"));
    }

    #[test]
    fn verbose_keeps_per_year_breakdown() {
        let layer = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![feature_with_years(&[(2020, 3), (2021, 1)])],
        };
        let filters = OccurrenceFilters {
            years: None,
            basis_of_record: Default::default(),
            verbose: true,
        };
        let out = project_features(&[layer], &filters);
        assert!(out[0].attributes.contains_key("2020"));
        assert!(out[0].attributes.contains_key("2021"));
    }

    #[test]
    fn merges_matching_geometry_across_shards() {
        let layer_a = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![feature_with_years(&[(2020, 2)])],
        };
        let layer_b = Layer {
            name: DENSITY_LAYER_NAME.to_string(),
            extent: 512,
            features: vec![feature_with_years(&[(2020, 5)])],
        };
        let filters = OccurrenceFilters::default();
        let out = project_features(&[layer_a, layer_b], &filters);
        assert_eq!(out.len(), 1);
        match out[0].attributes.get("total") {
            Some(AttrValue::Int(v)) => assert_eq!(*v, 7),
            _ => panic!("expected total"),
        }
    }

    #[test]
    fn point_outside_buffer_is_dropped() {
        let tile = TileAddress::new(2, 0, 0).unwrap();
        let point = crate::tile_store::PointRecord {
            lat: -45.0,
            lon: -170.0,
            year: 2020,
            basis_of_record: None,
        };
        assert!(point_to_feature(point, tile, 512, 64, TileScheme::WebMercator).is_none());
    }

    #[test]
    fn point_inside_tile_becomes_a_single_occurrence_feature() {
        let tile = TileAddress::new(0, 0, 0).unwrap();
        let point = crate::tile_store::PointRecord {
            lat: 10.0,
            lon: 10.0,
            year: 2020,
            basis_of_record: Some("HUMAN_OBSERVATION".to_string()),
        };
        let feature = point_to_feature(point, tile, 512, 64, TileScheme::WebMercator).unwrap();
        match feature.attributes.get("2020") {
            Some(AttrValue::Int(v)) => assert_eq!(*v, 1),
            _ => panic!("expected one-year count"),
        }
        assert_eq!(
            feature.attributes.get("BASIS_OF_RECORD_HUMAN_OBSERVATION"),
            Some(&AttrValue::Int(1))
        );
    }

    #[tokio::test]
    async fn density_tile_falls_back_to_points_when_no_shard_exists() {
        use crate::metastore::Metastore;
        use crate::tile_store::{PointRecord, SqliteTileStore};

        let store = SqliteTileStore::connect("sqlite::memory:", 1).await.unwrap();
        let metastore = Metastore::static_from_config("occurrence_tiles", "occurrence_points");
        let tile = TileAddress::new(0, 0, 0).unwrap();

        store
            .put_point(
                "occurrence_points",
                "taxonKey:1",
                &PointRecord {
                    lat: 12.0,
                    lon: 12.0,
                    year: 2021,
                    basis_of_record: None,
                },
            )
            .await
            .unwrap();

        let request = AssembleRequest {
            tile,
            tile_size: 512,
            buffer_size: 64,
            map_key: "taxonKey:1".to_string(),
            filters: OccurrenceFilters::default(),
            binning: None,
            scheme: TileScheme::WebMercator,
        };

        let bytes = assemble_density_tile(&store, &metastore, &request).await.unwrap();
        let layers = codec::decode(&bytes).unwrap();
        assert_eq!(layers[0].features.len(), 1);
        match layers[0].features[0].attributes.get("total") {
            Some(AttrValue::Int(v)) => assert_eq!(*v, 1),
            _ => panic!("expected total"),
        }
    }
}
