use serde::{Deserialize, Serialize};
use tracing::warn;

const TINY: f64 = 1.0e-20;
const BETA_MAX_ITERATIONS: usize = 300;
const BETA_EPSILON: f64 = 3.0e-16;
const BETA_FLOOR: f64 = 1.0e-300;

/// Least-squares fit of probability against frequency, kept with the ranking for provenance.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionModel {
    pub slope: f64,
    pub intercept: f64,
    pub r_value: f64,
    pub p_value: f64,
    pub std_err: f64,
}

impl RegressionModel {
    pub fn predict(&self, x: f64) -> f64 {
        x * self.slope + self.intercept
    }

    pub fn r_squared(&self) -> f64 {
        self.r_value * self.r_value
    }
}

/// Ordinary least squares over `(x, y)` points with a two-sided t-test on the slope.
///
/// A constant regressor (fewer than two distinct x values) yields a flat line through the
/// mean of y with `r = 0` and `p = 1`.
pub fn linregress(points: &[(f64, f64)]) -> RegressionModel {
    let n = points.len();
    if n == 0 {
        return RegressionModel {
            slope: 0.0,
            intercept: 0.0,
            r_value: 0.0,
            p_value: 1.0,
            std_err: 0.0,
        };
    }

    let count = n as f64;
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / count;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / count;

    let mut ssxm = 0.0;
    let mut ssym = 0.0;
    let mut ssxym = 0.0;
    for (x, y) in points {
        let dx = x - x_mean;
        let dy = y - y_mean;
        ssxm += dx * dx;
        ssym += dy * dy;
        ssxym += dx * dy;
    }
    ssxm /= count;
    ssym /= count;
    ssxym /= count;

    if ssxm == 0.0 {
        warn!(points = n, "constant regressor; using flat regression line");
        return RegressionModel {
            slope: 0.0,
            intercept: y_mean,
            r_value: 0.0,
            p_value: 1.0,
            std_err: 0.0,
        };
    }

    let r_den = (ssxm * ssym).sqrt();
    let r_value = if r_den == 0.0 {
        0.0
    } else {
        (ssxym / r_den).clamp(-1.0, 1.0)
    };

    let slope = ssxym / ssxm;
    let intercept = y_mean - slope * x_mean;

    let (p_value, std_err) = if n == 2 {
        let same = points[0].1 == points[1].1;
        (if same { 1.0 } else { 0.0 }, 0.0)
    } else {
        let df = (n - 2) as f64;
        let t = r_value * (df / ((1.0 - r_value + TINY) * (1.0 + r_value + TINY))).sqrt();
        let p_value = student_t_two_sided(t, df);
        let std_err = ((1.0 - r_value * r_value) * ssym / ssxm / df).max(0.0).sqrt();
        (p_value, std_err)
    };

    RegressionModel {
        slope,
        intercept,
        r_value,
        p_value,
        std_err,
    }
}

fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(df / 2.0, 0.5, x).clamp(0.0, 1.0)
}

fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < BETA_FLOOR {
        d = BETA_FLOOR;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=BETA_MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < BETA_FLOOR {
            d = BETA_FLOOR;
        }
        c = 1.0 + aa / c;
        if c.abs() < BETA_FLOOR {
            c = BETA_FLOOR;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < BETA_FLOOR {
            d = BETA_FLOOR;
        }
        c = 1.0 + aa / c;
        if c.abs() < BETA_FLOOR {
            c = BETA_FLOOR;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < BETA_EPSILON {
            break;
        }
    }

    h
}

/// Lanczos approximation (g = 7, n = 9).
fn ln_gamma(value: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if value < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * value).sin()).ln() - ln_gamma(1.0 - value);
    }

    let x = value - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (index, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += coefficient / (x + index as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}
