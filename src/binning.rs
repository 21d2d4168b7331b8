//! Hex and Square Binning Engine.
//!
//! The lattice is anchored in global pixel space, not per-tile, so a cell
//! that straddles two adjacent tiles' buffers is assigned the same
//! identity and the same geometry (up to the tile-local coordinate shift)
//! in both. Cell identity is the rounded first vertex of the cell polygon
//! in *global* pixel space: two tiles computing the same cell will always
//! produce the same first vertex, because both derive it from the same
//! global lattice, which is the cross-tile-buffer stability invariant
//! this module exists to uphold.
//!
//! The hex geometry follows the standard axial-coordinate formulas used
//! across the hex-grid literature (the same family `t-rex`'s grid
//! resolution tables use for the equivalent square-grid case), adapted to
//! flat storage in plain structs rather than a geometry library.

use std::collections::BTreeMap;

use crate::codec::{AttrValue, Feature, Geometry};
use crate::error::NoDataError;
use crate::projection::TileAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    Hex,
    Square,
}

#[derive(Debug, Clone, Copy)]
pub struct BinningConfig {
    pub mode: BinMode,
    pub hex_per_tile: u32,
    pub square_size: u32,
}

/// Global pixel coordinate, rounded to the nearest integer for use as a
/// stable cell identity. Shared with `regression.rs`, which pairs cells
/// across two binned tiles by this same identity.
pub type CellId = (i64, i64);

struct Cell {
    /// Polygon ring in global pixel space, first vertex first.
    global_ring: Vec<(f64, f64)>,
    attributes: BTreeMap<String, i64>,
}

/// Bin a set of point features into hex or square cells. Non-point
/// features are ignored (the stored density/points data this engine
/// consumes is point geometry only). Returns [`NoDataError`] when there
/// are no features to bin; the Assembler catches this and serves the
/// unbinned (empty) response instead.
pub fn bin_features(
    features: &[Feature],
    tile: TileAddress,
    tile_size: u32,
    config: &BinningConfig,
) -> Result<Vec<Feature>, NoDataError> {
    Ok(bin_into_cells(features, tile, tile_size, config)?
        .into_iter()
        .map(|(_, feature)| feature)
        .collect())
}

/// Like [`bin_features`], but keeps each cell's stable identity alongside
/// its aggregated feature. Used by `regression.rs` to pair cells across
/// two independently-binned tiles.
pub fn bin_features_keyed(
    features: &[Feature],
    tile: TileAddress,
    tile_size: u32,
    config: &BinningConfig,
) -> Result<Vec<(CellId, Feature)>, NoDataError> {
    bin_into_cells(features, tile, tile_size, config)
}

fn bin_into_cells(
    features: &[Feature],
    tile: TileAddress,
    tile_size: u32,
    config: &BinningConfig,
) -> Result<Vec<(CellId, Feature)>, NoDataError> {
    if features.is_empty() {
        return Err(NoDataError);
    }

    let origin_x = f64::from(tile.x) * f64::from(tile_size);
    let origin_y = f64::from(tile.y) * f64::from(tile_size);

    let mut cells: BTreeMap<CellId, Cell> = BTreeMap::new();

    for feature in features {
        let (local_x, local_y) = match feature.geometry {
            Geometry::Point(x, y) => (f64::from(x), f64::from(y)),
            _ => continue,
        };
        let global = (origin_x + local_x, origin_y + local_y);

        let ring = match config.mode {
            BinMode::Square => square_cell_ring(global, f64::from(config.square_size)),
            BinMode::Hex => hex_cell_ring(global, hex_size(tile_size, config.hex_per_tile)),
        };
        let id = (ring[0].0.round() as i64, ring[0].1.round() as i64);

        let cell = cells.entry(id).or_insert_with(|| Cell {
            global_ring: ring,
            attributes: BTreeMap::new(),
        });

        for (key, value) in &feature.attributes {
            let amount = match value {
                AttrValue::Int(i) => *i,
                AttrValue::UInt(u) => *u as i64,
                _ => continue,
            };
            *cell.attributes.entry(key.clone()).or_insert(0) += amount;
        }
    }

    let binned = cells
        .into_iter()
        .map(|(id, cell)| {
            let local_ring: Vec<(i32, i32)> = cell
                .global_ring
                .iter()
                .map(|(gx, gy)| ((gx - origin_x).round() as i32, (gy - origin_y).round() as i32))
                .collect();

            let attributes = cell
                .attributes
                .into_iter()
                .map(|(key, total)| (key, AttrValue::Int(total)))
                .collect();

            (
                id,
                Feature {
                    id: None,
                    geometry: Geometry::Polygon(vec![local_ring]),
                    attributes,
                },
            )
        })
        .collect();

    Ok(binned)
}

fn square_cell_ring(global: (f64, f64), cell_size: f64) -> Vec<(f64, f64)> {
    let col = (global.0 / cell_size).floor();
    let row = (global.1 / cell_size).floor();
    let x0 = col * cell_size;
    let y0 = row * cell_size;
    vec![
        (x0, y0),
        (x0 + cell_size, y0),
        (x0 + cell_size, y0 + cell_size),
        (x0, y0 + cell_size),
    ]
}

/// `sqrt(3)`, not provided by `std::f64::consts`.
const SQRT3: f64 = 1.732_050_807_568_877_2;

fn hex_size(tile_size: u32, hex_per_tile: u32) -> f64 {
    let hex_per_tile = hex_per_tile.max(1);
    f64::from(tile_size) / f64::from(hex_per_tile) / SQRT3
}

/// Flat-top hexagon covering `global`, identified by axial (q, r) rounded
/// via cube coordinates. Returns the 6 corner vertices in global pixel
/// space, starting from the corner nearest `0 deg`.
fn hex_cell_ring(global: (f64, f64), size: f64) -> Vec<(f64, f64)> {
    let q_frac = (2.0 / 3.0 * global.0) / size;
    let r_frac = (-1.0 / 3.0 * global.0 + SQRT3 / 3.0 * global.1) / size;
    let (q, r) = round_axial(q_frac, r_frac);

    let center_x = size * (1.5 * q as f64);
    let center_y = size * (SQRT3 / 2.0 * q as f64 + SQRT3 * r as f64);

    (0..6)
        .map(|i| {
            let angle = (60.0 * f64::from(i)).to_radians();
            (center_x + size * angle.cos(), center_y + size * angle.sin())
        })
        .collect()
}

fn round_axial(q_frac: f64, r_frac: f64) -> (i64, i64) {
    let x = q_frac;
    let z = r_frac;
    let y = -x - z;

    let mut rx = x.round();
    let mut ry = y.round();
    let rz = z.round();

    let x_diff = (rx - x).abs();
    let y_diff = (ry - y).abs();
    let z_diff = (rz - z).abs();

    if x_diff > y_diff && x_diff > z_diff {
        rx = -ry - rz;
    } else if y_diff > z_diff {
        ry = -rx - rz;
    }

    (rx as i64, rz as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point(x: i32, y: i32, year: &str, count: i64) -> Feature {
        let mut attrs = BTreeMap::new();
        attrs.insert(year.to_string(), AttrValue::Int(count));
        Feature {
            id: Some(1),
            geometry: Geometry::Point(x, y),
            attributes: attrs,
        }
    }

    #[test]
    fn empty_input_is_no_data() {
        let tile = TileAddress::new(3, 1, 1).unwrap();
        let config = BinningConfig {
            mode: BinMode::Square,
            hex_per_tile: 35,
            square_size: 64,
        };
        assert!(bin_features(&[], tile, 512, &config).is_err());
    }

    #[test]
    fn square_binning_sums_points_sharing_a_cell() {
        let tile = TileAddress::new(3, 1, 1).unwrap();
        let config = BinningConfig {
            mode: BinMode::Square,
            hex_per_tile: 35,
            square_size: 64,
        };
        let features = vec![
            point(10, 10, "2020", 1),
            point(20, 20, "2020", 2),
            point(500, 500, "2020", 5),
        ];
        let binned = bin_features(&features, tile, 512, &config).unwrap();
        assert_eq!(binned.len(), 2);
        let totals: Vec<i64> = binned
            .iter()
            .map(|f| match f.attributes.get("2020") {
                Some(AttrValue::Int(v)) => *v,
                _ => 0,
            })
            .collect();
        assert!(totals.contains(&3));
        assert!(totals.contains(&5));
    }

    #[test]
    fn adjacent_tiles_agree_on_shared_cell_identity() {
        let tile_a = TileAddress::new(4, 2, 2).unwrap();
        let tile_b = TileAddress::new(4, 3, 2).unwrap();
        let config = BinningConfig {
            mode: BinMode::Square,
            hex_per_tile: 35,
            square_size: 64,
        };

        // A point placed in tile_a's east buffer and the corresponding
        // point in tile_b's west buffer address the same square cell.
        let features_a = vec![point(520, 10, "2020", 7)];
        let features_b = vec![point(-40, 10, "2020", 7)];

        let binned_a = bin_features(&features_a, tile_a, 512, &config).unwrap();
        let binned_b = bin_features(&features_b, tile_b, 512, &config).unwrap();

        let global_ring_a: Vec<(i64, i64)> = match &binned_a[0].geometry {
            Geometry::Polygon(rings) => rings[0]
                .iter()
                .map(|(x, y)| {
                    (
                        i64::from(*x) + i64::from(tile_a.x) * 512,
                        i64::from(*y) + i64::from(tile_a.y) * 512,
                    )
                })
                .collect(),
            _ => unreachable!(),
        };
        let global_ring_b: Vec<(i64, i64)> = match &binned_b[0].geometry {
            Geometry::Polygon(rings) => rings[0]
                .iter()
                .map(|(x, y)| {
                    (
                        i64::from(*x) + i64::from(tile_b.x) * 512,
                        i64::from(*y) + i64::from(tile_b.y) * 512,
                    )
                })
                .collect(),
            _ => unreachable!(),
        };
        assert_eq!(global_ring_a, global_ring_b);
    }

    #[test]
    fn hex_binning_produces_hexagonal_rings() {
        let tile = TileAddress::new(3, 1, 1).unwrap();
        let config = BinningConfig {
            mode: BinMode::Hex,
            hex_per_tile: 8,
            square_size: 64,
        };
        let binned = bin_features(&[point(100, 100, "2020", 1)], tile, 512, &config).unwrap();
        match &binned[0].geometry {
            Geometry::Polygon(rings) => assert_eq!(rings[0].len(), 6),
            _ => panic!("expected polygon"),
        }
    }
}
