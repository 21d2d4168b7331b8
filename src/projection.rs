//! Coordinate transforms between geographic, global-pixel and tile-local
//! pixel space for the tile schemes this service supports.
//!
//! Credits: the Web Mercator formulas follow the same derivation as
//! Mercantile (the lon/lat <-> tile math used across the slippy-map
//! ecosystem); the WGS84/polar handling generalises the same approach to
//! non-Mercator grids the way `t-rex`'s `Grid` does for its resolution
//! tables.

use std::f64::consts::PI;

use crate::error::ConfigurationError;

/// Maximum Web Mercator latitude before the projection diverges.
pub const MAX_MERCATOR_LAT: f64 = 85.05112878;

/// A slippy-map tile address. `0 <= x < W(scheme)*2^z` and `0 <= y < 2^z`
/// is an invariant enforced by [`TileAddress::new`]/[`TileAddress::new_for_scheme`],
/// not by the type itself (callers may need to construct intermediate
/// addresses before validating).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    /// Validates against the default (square, `W=1`) tile grid shared by
    /// every scheme except WGS84 plate carree. Routes that accept a
    /// `srs` parameter should validate with [`TileAddress::new_for_scheme`]
    /// instead, since a WGS84 request is twice as wide at a given zoom.
    pub fn new(z: u32, x: u32, y: u32) -> Result<Self, ConfigurationError> {
        Self::new_for_scheme(z, x, y, TileScheme::WebMercator)
    }

    pub fn new_for_scheme(
        z: u32,
        x: u32,
        y: u32,
        scheme: TileScheme,
    ) -> Result<Self, ConfigurationError> {
        if z > 30 {
            return Err(ConfigurationError::new(format!(
                "zoom {z} exceeds maximum supported zoom of 30"
            )));
        }
        let n = tile_count(z);
        let width = n * scheme.tile_width_factor();
        if x >= width || y >= n {
            return Err(ConfigurationError::new(format!(
                "tile ({z},{x},{y}) out of range for zoom {z} (0..{width}, 0..{n})"
            )));
        }
        Ok(Self { z, x, y })
    }
}

/// The tile schemes recognised by this service. Each entry encodes the
/// world extent (in tiles, at zoom 0) along each axis and the geographic
/// <-> pixel mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileScheme {
    WebMercator,
    Wgs84PlateCarree,
    ArcticLaea,
    AntarcticLaea,
}

impl TileScheme {
    /// Parse the `srs` query parameter a tile request supplies.
    pub fn from_srs(srs: &str) -> Result<Self, ConfigurationError> {
        match srs {
            "EPSG:3857" => Ok(Self::WebMercator),
            "EPSG:4326" => Ok(Self::Wgs84PlateCarree),
            "EPSG:3575" => Ok(Self::ArcticLaea),
            "EPSG:3031" => Ok(Self::AntarcticLaea),
            other => Err(ConfigurationError::new(format!(
                "unsupported projection {other}"
            ))),
        }
    }

    /// Width of the tile grid relative to its height, in tile counts: WGS84
    /// plate carree is twice as wide as it is tall at any zoom (spec's
    /// `gx in [0, tileSize*W*2^z)` with `W=2`); every other supported
    /// scheme is square (`W=1`).
    pub const fn tile_width_factor(&self) -> u32 {
        match self {
            Self::Wgs84PlateCarree => 2,
            Self::WebMercator | Self::ArcticLaea | Self::AntarcticLaea => 1,
        }
    }

    /// Only WGS84 is supported on the ad-hoc search-backend path.
    pub const fn supports_adhoc(&self) -> bool {
        matches!(self, Self::Wgs84PlateCarree)
    }
}

pub const fn tile_count(z: u32) -> u32 {
    1u32 << z
}

/// `(lat, lon) -> (gx, gy)` in global pixel space at zoom `z`, where
/// `gx in [0, tileSize * W(scheme) * 2^z)` and `gy` likewise for height.
pub fn to_global_pixel_xy(
    lat: f64,
    lon: f64,
    z: u32,
    scheme: TileScheme,
    tile_size: u32,
) -> (f64, f64) {
    let n = f64::from(tile_count(z));
    let tile_size = f64::from(tile_size);

    match scheme {
        TileScheme::WebMercator => {
            let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
            let world_x = (lon + 180.0) / 360.0;
            let lat_rad = lat.to_radians();
            let world_y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0;
            (world_x * n * tile_size, world_y * n * tile_size)
        }
        TileScheme::Wgs84PlateCarree => {
            let lon = wrap_longitude(lon);
            let lat = lat.clamp(-90.0, 90.0);
            // Two tiles span the full 360 degrees of longitude at z0.
            let width = f64::from(scheme.tile_width_factor());
            let world_x = (lon + 180.0) / 360.0;
            let world_y = (90.0 - lat) / 180.0;
            (world_x * n * width * tile_size, world_y * n * tile_size)
        }
        TileScheme::ArcticLaea | TileScheme::AntarcticLaea => {
            // Lambert azimuthal equal-area, centred on the pole, normalised
            // into [0, 1] on each axis by the projection's maximum radius
            // (the equator maps to the lattice boundary).
            let sign = if matches!(scheme, TileScheme::ArcticLaea) {
                1.0
            } else {
                -1.0
            };
            let lat = lat.clamp(-90.0, 90.0);
            let colat = (90.0 - sign * lat).to_radians();
            let r = (colat / 2.0).sin() * std::f64::consts::SQRT_2;
            let theta = lon.to_radians();
            let (sin_t, cos_t) = theta.sin_cos();
            let norm_x = 0.5 + r * sin_t / (2.0 * std::f64::consts::SQRT_2);
            let norm_y = 0.5 - sign * r * cos_t / (2.0 * std::f64::consts::SQRT_2);
            (norm_x * n * tile_size, norm_y * n * tile_size)
        }
    }
}

/// Subtract the tile origin from a global-pixel coordinate, yielding
/// tile-local pixel space. Callers must drop points outside
/// `[-bufferSize, tileSize+bufferSize]` before encoding.
pub fn to_tile_local_xy(
    global: (f64, f64),
    tile: TileAddress,
    tile_size: u32,
) -> (f64, f64) {
    let tile_size = f64::from(tile_size);
    let origin_x = f64::from(tile.x) * tile_size;
    let origin_y = f64::from(tile.y) * tile_size;
    (global.0 - origin_x, global.1 - origin_y)
}

/// Whether a tile-local point lies within the buffered tile bounds.
pub fn in_buffered_bounds(local: (f64, f64), tile_size: u32, buffer_size: u32) -> bool {
    let lo = -f64::from(buffer_size);
    let hi = f64::from(tile_size) + f64::from(buffer_size);
    local.0 >= lo && local.0 <= hi && local.1 >= lo && local.1 <= hi
}

fn wrap_longitude(lon: f64) -> f64 {
    let mut lon = lon % 360.0;
    if lon > 180.0 {
        lon -= 360.0;
    } else if lon < -180.0 {
        lon += 360.0;
    }
    lon
}

/// The buffered geographic envelope of a tile, `[sw, ne]` as
/// `(min_lon, min_lat, max_lon, max_lat)`. Longitude wraps at the
/// antimeridian; latitude clips to `[-90, 90]`. At `z = 0` the buffered
/// envelope is the full world rather than a collapsed/self-intersecting
/// range.
pub fn buffered_tile_boundary(
    tile: TileAddress,
    scheme: TileScheme,
    tile_size: u32,
    buffer_size: u32,
) -> (f64, f64, f64, f64) {
    if tile.z == 0 {
        return (-180.0, -90.0, 180.0, 90.0);
    }

    let n = f64::from(tile_count(tile.z));
    let frac = f64::from(buffer_size) / f64::from(tile_size);

    match scheme {
        TileScheme::WebMercator | TileScheme::Wgs84PlateCarree => {
            let width = n * f64::from(scheme.tile_width_factor());
            let lon_min = (f64::from(tile.x) - frac) / width * 360.0 - 180.0;
            let lon_max = (f64::from(tile.x) + 1.0 + frac) / width * 360.0 - 180.0;

            let lat_for = |y_frac: f64| -> f64 {
                match scheme {
                    TileScheme::WebMercator => {
                        (PI * (1.0 - 2.0 * y_frac / n)).sinh().atan().to_degrees()
                    }
                    _ => 90.0 - y_frac / n * 180.0,
                }
            };
            let lat_max = lat_for(f64::from(tile.y) - frac);
            let lat_min = lat_for(f64::from(tile.y) + 1.0 + frac);

            (
                wrap_longitude(lon_min),
                lat_min.clamp(-90.0, 90.0),
                wrap_longitude(lon_max),
                lat_max.clamp(-90.0, 90.0),
            )
        }
        TileScheme::ArcticLaea | TileScheme::AntarcticLaea => {
            // Polar projections do not have a meaningful lon/lon envelope
            // per tile at coarse zooms; report the full hemisphere.
            let sign = if matches!(scheme, TileScheme::ArcticLaea) {
                1.0
            } else {
                -1.0
            };
            (-180.0, sign.min(0.0) * 90.0, 180.0, sign.max(0.0) * 90.0)
        }
    }
}
