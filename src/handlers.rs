//! HTTP handlers for the four occurrence tile routes.
//!
//! Query parameter parsing uses a `#[derive(Deserialize)]` query struct
//! plus small amounts of hand parsing for forms `serde`'s derive can't
//! express directly (the `.mvt` suffix trim, the `year` range syntax,
//! repeatable `basisOfRecord`).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use tracing::debug;

use crate::api_constants::{
    DEFAULT_HEX_PER_TILE, DEFAULT_MIN_YEARS, DEFAULT_SQUARE_SIZE, DEFAULT_SRS,
};
use crate::assembler::{self, AssembleRequest, ALL_OCCURRENCES_KEY};
use crate::binning::{BinMode, BinningConfig, CellId};
use crate::codec::{AttrValue, Feature, Geometry, Layer};
use crate::error::ApiError;
use crate::filter::{FilterGroup, OccurrenceFilters, YearRange};
use crate::metastore::Metastore;
use crate::projection::{self, TileAddress, TileScheme};
use crate::regression::{self, RegressionStats, YearTriple};
use crate::search_backend::SearchBackendAdapter;
use crate::tile_store::SqliteTileStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteTileStore>,
    pub metastore: Arc<Metastore>,
    pub search_backend: Arc<SearchBackendAdapter>,
    pub tile_size: u32,
    pub buffer_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct DensityTileQuery {
    srs: Option<String>,
    bin: Option<String>,
    #[serde(rename = "hexPerTile")]
    hex_per_tile: Option<u32>,
    #[serde(rename = "squareSize")]
    square_size: Option<u32>,
    year: Option<String>,
    #[serde(rename = "basisOfRecord")]
    basis_of_record: Option<Vec<String>>,
    verbose: Option<bool>,
    #[serde(rename = "taxonKey")]
    taxon_key: Option<String>,
}

/// The indexed tile store is keyed by `MapKey`; on this route that key
/// is the `taxonKey` filter predicate, the only one of the "arbitrary
/// filter predicate" vocabulary that selects a *different indexed
/// layer* rather than filtering within one. Its absence selects the
/// whole occurrence dataset.
fn map_key_from_taxon(taxon_key: Option<&str>) -> String {
    match taxon_key {
        Some(value) => format!("taxonKey:{value}"),
        None => ALL_OCCURRENCES_KEY.to_string(),
    }
}

fn parse_y(y_str: &str) -> Result<u32, ApiError> {
    y_str
        .trim_end_matches(".mvt")
        .parse()
        .map_err(|_| ApiError::bad_request("invalid y coordinate"))
}

fn parse_scheme(srs: Option<&str>) -> Result<TileScheme, ApiError> {
    Ok(TileScheme::from_srs(srs.unwrap_or(DEFAULT_SRS))?)
}

fn parse_filters(
    year: Option<&str>,
    basis_of_record: Option<&[String]>,
    verbose: bool,
) -> Result<OccurrenceFilters, ApiError> {
    let years = match year {
        Some(raw) => Some(YearRange::parse(raw)?),
        None => None,
    };
    let basis_of_record: HashSet<String> = basis_of_record
        .map(|codes| codes.iter().cloned().collect())
        .unwrap_or_default();

    Ok(OccurrenceFilters {
        years,
        basis_of_record,
        verbose,
    })
}

fn parse_binning(
    bin: Option<&str>,
    hex_per_tile: Option<u32>,
    square_size: Option<u32>,
) -> Result<Option<BinningConfig>, ApiError> {
    match bin {
        None => Ok(None),
        Some("hex") => Ok(Some(BinningConfig {
            mode: BinMode::Hex,
            hex_per_tile: hex_per_tile.unwrap_or(DEFAULT_HEX_PER_TILE),
            square_size: DEFAULT_SQUARE_SIZE,
        })),
        Some("square") => Ok(Some(BinningConfig {
            mode: BinMode::Square,
            hex_per_tile: DEFAULT_HEX_PER_TILE,
            square_size: square_size.unwrap_or(DEFAULT_SQUARE_SIZE),
        })),
        Some(other) => Err(ApiError::bad_request(format!("unknown bin mode '{other}'"))),
    }
}

fn mvt_response(bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.mapbox-vector-tile")
        .header(header::CACHE_CONTROL, "public, max-age=300")
        .body(axum::body::Body::from(bytes))
        .unwrap()
}

#[derive(Debug, serde::Serialize)]
struct HealthInfo {
    status: &'static str,
    version: &'static str,
    build_date: &'static str,
    rustc_version: &'static str,
}

pub async fn health() -> axum::Json<HealthInfo> {
    axum::Json(HealthInfo {
        status: "OK",
        version: env!("BUILD_VERSION"),
        build_date: env!("BUILD_DATE"),
        rustc_version: env!("RUSTC_VERSION"),
    })
}

pub async fn get_density_tile(
    State(state): State<AppState>,
    Path((z, x, y_str)): Path<(u32, u32, String)>,
    Query(query): Query<DensityTileQuery>,
) -> Result<Response, ApiError> {
    let y = parse_y(&y_str)?;
    let scheme = parse_scheme(query.srs.as_deref())?;
    if !matches!(scheme, TileScheme::WebMercator | TileScheme::Wgs84PlateCarree) {
        return Err(ApiError::bad_request(
            "density tiles only support EPSG:3857 or EPSG:4326",
        ));
    }

    let tile = TileAddress::new_for_scheme(z, x, y, scheme)?;
    let filters = parse_filters(
        query.year.as_deref(),
        query.basis_of_record.as_deref(),
        query.verbose.unwrap_or(false),
    )?;
    let binning = parse_binning(query.bin.as_deref(), query.hex_per_tile, query.square_size)?;

    debug!("density tile request z={z} x={x} y={y} bin={:?}", query.bin);

    let request = AssembleRequest {
        tile,
        tile_size: state.tile_size,
        buffer_size: state.buffer_size,
        map_key: map_key_from_taxon(query.taxon_key.as_deref()),
        filters,
        binning,
        scheme,
    };

    let bytes = assembler::assemble_density_tile(&state.store, &state.metastore, &request).await?;
    Ok(mvt_response(bytes))
}

#[derive(Debug, Deserialize)]
pub struct AdhocTileQuery {
    filter: Option<String>,
}

pub async fn get_adhoc_tile(
    State(state): State<AppState>,
    Path((z, x, y_str)): Path<(u32, u32, String)>,
    Query(query): Query<AdhocTileQuery>,
) -> Result<Response, ApiError> {
    let y = parse_y(&y_str)?;
    let scheme = TileScheme::Wgs84PlateCarree;
    if !scheme.supports_adhoc() {
        return Err(ApiError::bad_request("ad-hoc tiles require EPSG:4326"));
    }
    let tile = TileAddress::new_for_scheme(z, x, y, scheme)?;

    let filter = match &query.filter {
        Some(raw) => Some(FilterGroup::try_from(raw.as_str())?),
        None => None,
    };

    let bounds = projection::buffered_tile_boundary(tile, scheme, state.tile_size, state.buffer_size);
    let precision = geohash_precision_for_zoom(z);

    let cells = state
        .search_backend
        .geogrid_aggregate(tile, bounds, precision, filter.as_ref())
        .await?;

    debug!("ad-hoc tile z={z} x={x} y={y}: {} grid cells", cells.len());

    let features = cells
        .into_iter()
        .enumerate()
        .filter_map(|(i, cell)| {
            let (lx, ly) = crate::search_backend::geohash_to_tile_local(
                &cell.geohash,
                tile,
                state.tile_size,
            )?;
            let mut attributes = std::collections::BTreeMap::new();
            attributes.insert("geohash".to_string(), AttrValue::String(cell.geohash));
            attributes.insert("count".to_string(), AttrValue::UInt(cell.count));
            Some(Feature {
                id: Some(i as u64),
                geometry: Geometry::Point(lx, ly),
                attributes,
            })
        })
        .collect();

    let layers = vec![Layer {
        name: "occurrence".to_string(),
        extent: state.tile_size,
        features,
    }];
    let bytes = crate::codec::encode(&layers, state.tile_size, state.buffer_size)?;
    Ok(mvt_response(bytes))
}

/// Geohash precision scales with zoom so the grid stays roughly one cell
/// per tile pixel cluster rather than one cell per tile regardless of
/// zoom.
fn geohash_precision_for_zoom(z: u32) -> u8 {
    (z / 2 + 3).clamp(1, 12) as u8
}

#[derive(Debug, Deserialize)]
pub struct RegressionTileQuery {
    #[serde(rename = "taxonKey")]
    taxon_key: String,
    #[serde(rename = "higherTaxonKey")]
    higher_taxon_key: String,
    #[serde(rename = "minYears")]
    min_years: Option<u32>,
}

pub async fn get_regression_tile(
    State(state): State<AppState>,
    Path((z, x, y_str)): Path<(u32, u32, String)>,
    Query(query): Query<RegressionTileQuery>,
) -> Result<Response, ApiError> {
    let y = parse_y(&y_str)?;
    let tile = TileAddress::new(z, x, y)?;
    let cells = fetch_regression_cells(&state, tile, &query).await?;

    let layer = regression_cells_layer(&cells);
    let bytes = crate::codec::encode(&[layer], state.tile_size, state.buffer_size)?;
    Ok(mvt_response(bytes))
}

#[derive(Debug, serde::Serialize)]
pub struct RegressionCell {
    cell_id: (i64, i64),
    stats: RegressionStats,
}

pub async fn get_regression_json(
    State(state): State<AppState>,
    Query(query): Query<RegressionTileQuery>,
) -> Result<axum::Json<Vec<RegressionCell>>, ApiError> {
    // No path coordinates on this route; the world tile at the coarsest
    // zoom is the broadest address the hex lattice and store both agree
    // on, so this runs a single world-tile pass rather than fanning out
    // over the whole pyramid (decision recorded in `DESIGN.md`).
    let tile = TileAddress::new(0, 0, 0)?;
    let cells = fetch_regression_cells(&state, tile, &query).await?;
    let out = cells
        .into_iter()
        .map(|(cell_id, stats, _, _)| RegressionCell { cell_id, stats })
        .collect();
    Ok(axum::Json(out))
}

/// Pair the species and higher-taxon ("reference") hex tiles cell by
/// cell, build each paired cell's `(year, species_count, reference_count)`
/// series, and fit it. Cells present in only one tile, or that don't
/// clear `minYears` distinct qualifying years, are dropped.
async fn fetch_regression_cells(
    state: &AppState,
    tile: TileAddress,
    query: &RegressionTileQuery,
) -> Result<Vec<(CellId, RegressionStats, Feature, Vec<YearTriple>)>, ApiError> {
    let min_years = query.min_years.unwrap_or(DEFAULT_MIN_YEARS);

    let species_map_key = format!("taxonKey:{}", query.taxon_key);
    let reference_map_key = format!("taxonKey:{}", query.higher_taxon_key);

    let species_cells =
        assembler::assemble_hex_cells(&state.store, &state.metastore, tile, state.tile_size, &species_map_key)
            .await?;
    let reference_cells = assembler::assemble_hex_cells(
        &state.store,
        &state.metastore,
        tile,
        state.tile_size,
        &reference_map_key,
    )
    .await?;

    let reference_by_id: std::collections::HashMap<CellId, Feature> =
        reference_cells.into_iter().collect();

    let mut fitted = Vec::new();
    for (id, species_feature) in species_cells {
        let Some(reference_feature) = reference_by_id.get(&id) else {
            continue;
        };
        let series = paired_year_series(&species_feature, reference_feature);
        if let Some(stats) = regression::fit_cell(&series, min_years) {
            fitted.push((id, stats, species_feature, series));
        }
    }
    Ok(fitted)
}

/// Build the `(year, species_count, reference_count)` series for one
/// paired cell from its two binned features' year-keyed attributes
/// (everything but `"total"`, which the binning engine also carries
/// through but which plays no part in the year-axis fit).
fn paired_year_series(species: &Feature, reference: &Feature) -> Vec<YearTriple> {
    let mut years: std::collections::BTreeSet<i64> = std::collections::BTreeSet::new();
    years.extend(species.attributes.keys().filter_map(|k| k.parse::<i64>().ok()));
    years.extend(reference.attributes.keys().filter_map(|k| k.parse::<i64>().ok()));

    years
        .into_iter()
        .map(|year| {
            let species_count = year_count(species, year);
            let reference_count = year_count(reference, year);
            (year, species_count, reference_count)
        })
        .collect()
}

fn year_count(feature: &Feature, year: i64) -> f64 {
    match feature.attributes.get(&year.to_string()) {
        Some(AttrValue::Int(i)) => *i as f64,
        Some(AttrValue::UInt(u)) => *u as f64,
        _ => 0.0,
    }
}

/// Builds the `"regression"` layer: one feature per qualifying cell,
/// geometry copied from the species tile, attributes carrying both the
/// fitted `RegressionStats` and the raw paired series the fit was taken
/// over: the species tile's own `<year>`/`total` attributes plus a
/// `reference_<year>` count per qualifying year.
fn regression_cells_layer(cells: &[(CellId, RegressionStats, Feature, Vec<YearTriple>)]) -> Layer {
    let features = cells
        .iter()
        .map(|(_, stats, species_feature, series)| {
            let mut attributes = species_feature.attributes.clone();
            for (year, _, reference_count) in series {
                attributes.insert(
                    format!("reference_{year}"),
                    AttrValue::Int(*reference_count as i64),
                );
            }
            attributes.insert("slope".to_string(), AttrValue::String(stats.slope.to_string()));
            attributes.insert(
                "intercept".to_string(),
                AttrValue::String(stats.intercept.to_string()),
            );
            attributes.insert(
                "significance".to_string(),
                AttrValue::String(stats.significance.to_string()),
            );
            attributes.insert("sse".to_string(), AttrValue::String(stats.sse.to_string()));
            attributes.insert(
                "interceptStdErr".to_string(),
                AttrValue::String(stats.intercept_std_err.to_string()),
            );
            attributes.insert(
                "meanSquareError".to_string(),
                AttrValue::String(stats.mean_square_error.to_string()),
            );
            attributes.insert(
                "slopeStdErr".to_string(),
                AttrValue::String(stats.slope_std_err.to_string()),
            );

            Feature {
                id: species_feature.id,
                geometry: species_feature.geometry.clone(),
                attributes,
            }
        })
        .collect();

    Layer {
        name: "regression".to_string(),
        extent: 1,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn map_key_falls_back_to_all_occurrences() {
        assert_eq!(map_key_from_taxon(None), ALL_OCCURRENCES_KEY);
        assert_eq!(map_key_from_taxon(Some("12345")), "taxonKey:12345");
    }

    fn feature_with(years: &[(i64, i64)]) -> Feature {
        let mut attrs = BTreeMap::new();
        for (year, count) in years {
            attrs.insert(year.to_string(), AttrValue::Int(*count));
        }
        Feature {
            id: Some(1),
            geometry: Geometry::Point(0, 0),
            attributes: attrs,
        }
    }

    #[test]
    fn paired_series_covers_the_union_of_both_years() {
        let species = feature_with(&[(2020, 3), (2021, 1)]);
        let reference = feature_with(&[(2021, 10), (2022, 5)]);
        let series = paired_year_series(&species, &reference);
        assert_eq!(
            series,
            vec![(2020, 3.0, 0.0), (2021, 1.0, 10.0), (2022, 0.0, 5.0)]
        );
    }

    #[test]
    fn year_count_defaults_to_zero_when_absent() {
        let feature = feature_with(&[(2020, 7)]);
        assert_eq!(year_count(&feature, 2020), 7.0);
        assert_eq!(year_count(&feature, 1999), 0.0);
    }
}
