//! Regression Engine.
//!
//! Unlike a cross-cell fit of one total against another, this regression
//! runs *within* a single cell, over its year axis: for each cell present
//! in both the species and reference tiles, pair up `(year, species_count,
//! reference_count)`, restrict to years where the reference series is
//! nonzero (years with no recording effort carry no signal), and fit
//! `species_count / reference_count` against `year`. A cell with fewer
//! than `minYears` distinct qualifying years is skipped outright rather
//! than reported with degenerate statistics.
//!
//! OLS is accumulated incrementally (running sums, never a matrix
//! inversion) so each cell's fit is a single pass over its paired years.

use std::collections::HashSet;

use serde::Serialize;

/// Running sums for a bivariate OLS fit; `add` is the only mutator, so
/// the whole fit is O(1) additional memory regardless of point count.
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    n: u64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    sum_yy: f64,
}

impl Accumulator {
    fn add(&mut self, x: f64, y: f64) {
        self.n += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
        self.sum_yy += y * y;
    }
}

/// One cell's fitted year trend, `species_count / reference_count ~ year`
/// coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionStats {
    pub slope: f64,
    pub intercept: f64,
    pub significance: f64,
    pub sse: f64,
    pub intercept_std_err: f64,
    pub mean_square_error: f64,
    pub slope_std_err: f64,
}

const NAN_STATS: RegressionStats = RegressionStats {
    slope: f64::NAN,
    intercept: f64::NAN,
    significance: f64::NAN,
    sse: f64::NAN,
    intercept_std_err: f64::NAN,
    mean_square_error: f64::NAN,
    slope_std_err: f64::NAN,
};

/// One (year, species_count, reference_count) triple for a cell, prior to
/// the reference-nonzero restriction `fit_cell` applies.
pub type YearTriple = (i64, f64, f64);

/// Fit one cell's `(year, species_count / reference_count)` series.
///
/// Returns `None` when the cell has fewer than `min_years` distinct years
/// with a nonzero reference count; the Assembler drops such cells rather
/// than emitting a feature for them. A zero-variance
/// year axis (all qualifying years identical, or exactly one) is
/// impossible once the `min_years` guard passes with `min_years >= 2`,
/// but is still guarded explicitly for `min_years` configured to `1`.
pub fn fit_cell(series: &[YearTriple], min_years: u32) -> Option<RegressionStats> {
    let with_reference: Vec<&YearTriple> = series.iter().filter(|(_, _, r)| *r > 0.0).collect();

    let distinct_years: HashSet<i64> = with_reference.iter().map(|(year, _, _)| *year).collect();
    if (distinct_years.len() as u32) < min_years {
        return None;
    }

    let qualifying: Vec<(f64, f64)> = with_reference
        .iter()
        .map(|(year, species, reference)| (*year as f64, species / reference))
        .collect();

    let mut acc = Accumulator::default();
    for (x, y) in &qualifying {
        acc.add(*x, *y);
    }

    let n = acc.n as f64;
    let sxx = acc.sum_xx - acc.sum_x * acc.sum_x / n;

    if sxx <= f64::EPSILON {
        return Some(NAN_STATS);
    }

    let sxy = acc.sum_xy - acc.sum_x * acc.sum_y / n;
    let syy = acc.sum_yy - acc.sum_y * acc.sum_y / n;

    let slope = sxy / sxx;
    let mean_x = acc.sum_x / n;
    let mean_y = acc.sum_y / n;
    let intercept = mean_y - slope * mean_x;

    let degrees_of_freedom = n - 2.0;
    if degrees_of_freedom < 1.0 {
        return Some(RegressionStats {
            slope,
            intercept,
            ..NAN_STATS
        });
    }

    let sse = (syy - slope * sxy).max(0.0);
    let mean_square_error = sse / degrees_of_freedom;
    let slope_std_err = (mean_square_error / sxx).sqrt();
    let intercept_std_err = (mean_square_error * (1.0 / n + mean_x * mean_x / sxx)).sqrt();

    let significance = if slope_std_err <= f64::EPSILON {
        f64::NAN
    } else {
        two_sided_p_value(slope / slope_std_err, degrees_of_freedom)
    };

    Some(RegressionStats {
        slope,
        intercept,
        significance,
        sse,
        intercept_std_err,
        mean_square_error,
        slope_std_err,
    })
}

/// Two-sided p-value for a t-statistic with `df` degrees of freedom,
/// via the regularized incomplete beta function
/// `I_x(df/2, 1/2)` with `x = df / (df + t^2)` (Abramowitz & Stegun
/// 26.7.1, the standard reduction of the t distribution's tail to the
/// beta function).
fn two_sided_p_value(t: f64, df: f64) -> f64 {
    if !t.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(x, df / 2.0, 0.5)
}

fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_beta = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b);
    let front = (ln_beta + a * x.ln() + b * (1.0 - x).ln()).exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Lentz's algorithm for the continued fraction behind the incomplete
/// beta function (Numerical Recipes §6.4).
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: u32 = 200;
    const EPSILON: f64 = 1e-12;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m_f = f64::from(m);
        let m2 = 2.0 * m_f;

        let aa = m_f * (b - m_f) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m_f) * (qab + m_f) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }

    h
}

/// Lanczos approximation of `ln(Gamma(x))`, accurate to within 1e-10 over
/// the positive reals this function is ever called with.
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_79,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.001_208_650_973_866_179,
        -0.000_005_395_239_384_953,
    ];

    let mut y = x;
    let tmp = x + 5.5 - (x + 5.5).ln() * (x + 5.5);
    let mut series = 1.000_000_000_190_015;
    for coefficient in COEFFICIENTS {
        y += 1.0;
        series += coefficient / y;
    }
    -tmp + (2.506_628_274_631_000_7 * series / x).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_linear_trend_has_slope_one_and_tiny_significance() {
        let series: Vec<YearTriple> = (0..10).map(|i| (2010 + i, f64::from(i), 1.0)).collect();
        let stats = fit_cell(&series, 2).unwrap();
        assert!((stats.slope - 1.0).abs() < 1e-9);
        assert!(stats.significance < 0.01);
        assert!(stats.sse < 1e-9);
    }

    #[test]
    fn fewer_than_min_years_is_skipped() {
        let series: Vec<YearTriple> = vec![(2020, 1.0, 1.0), (2021, 2.0, 1.0)];
        assert!(fit_cell(&series, 3).is_none());
    }

    #[test]
    fn zero_reference_years_are_excluded_from_the_year_count() {
        let series: Vec<YearTriple> = vec![
            (2019, 5.0, 0.0),
            (2020, 1.0, 1.0),
            (2021, 2.0, 1.0),
        ];
        // Only 2020 and 2021 have a nonzero reference count.
        assert!(fit_cell(&series, 2).is_some());
        assert!(fit_cell(&series, 3).is_none());
    }

    #[test]
    fn zero_variance_year_axis_guarded_at_min_years_one() {
        let series: Vec<YearTriple> = vec![(2020, 3.0, 1.0)];
        let stats = fit_cell(&series, 1).unwrap();
        assert!(stats.slope.is_nan());
    }
}
