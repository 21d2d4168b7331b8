//! Route paths and default query-parameter values.

// The `.mvt` suffix is part of the `y` path segment (e.g. `7.mvt`), not a
// literal suffix on the route pattern; matchit only allows a parameter
// to span a whole segment. Handlers trim it off the same way a `.pbf`
// suffix gets trimmed elsewhere.
pub const HEALTH_ROUTE: &str = "/health";
pub const DENSITY_TILE_ROUTE: &str = "/occurrence/density/{z}/{x}/{y}";
pub const ADHOC_TILE_ROUTE: &str = "/occurrence/adhoc/{z}/{x}/{y}";
pub const REGRESSION_TILE_ROUTE: &str = "/occurrence/regression/{z}/{x}/{y}";
pub const REGRESSION_JSON_ROUTE: &str = "/occurrence/regression";

pub const DEFAULT_SRS: &str = "EPSG:3857";
pub const DEFAULT_HEX_PER_TILE: u32 = 35;
pub const DEFAULT_SQUARE_SIZE: u32 = 64;
pub const DEFAULT_MIN_YEARS: u32 = 2;

pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_BUFFER_SIZE: u32 = 64;
pub const DEFAULT_SALT_MODULUS: u8 = 8;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 50;
