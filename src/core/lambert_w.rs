//! Real branches of the Lambert-W function, the inverse of `w·exp(w)`.
//!
//! The principal branch `W0` is defined for `x >= -1/e` with `W0 >= -1`;
//! the lower branch `W-1` for `-1/e <= x < 0` with `W-1 <= -1`. Arguments
//! outside a branch's domain give NaN.

use std::f64::consts::E;

/// `1/e`, the magnitude of the branch point
const INV_E: f64 = 0.367_879_441_171_442_33;

const MAX_ITERATIONS: usize = 64;

/// Real branch of W
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// `W0`, values in `[-1, inf)`
    Principal,
    /// `W-1`, values in `(-inf, -1]`
    Lower,
}

/// `W(x)` on the given branch
pub fn lambert_w(x: f64, branch: Branch) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let offset = x + INV_E;
    if offset < 0.0 {
        // rounding of -1/e itself
        if offset > -1e-15 {
            return -1.0;
        }
        return f64::NAN;
    }
    if offset == 0.0 {
        return -1.0;
    }

    match branch {
        Branch::Principal => {
            if x == 0.0 {
                return 0.0;
            }
            if x == f64::INFINITY {
                return f64::INFINITY;
            }
            halley(x, principal_guess(x))
        }
        Branch::Lower => {
            if x == 0.0 {
                return f64::NEG_INFINITY;
            }
            if x > 0.0 {
                return f64::NAN;
            }
            halley(x, lower_guess(x))
        }
    }
}

/// Principal branch `W0(x)`
pub fn lambert_w0(x: f64) -> f64 {
    lambert_w(x, Branch::Principal)
}

/// Lower branch `W-1(x)`
pub fn lambert_wm1(x: f64) -> f64 {
    lambert_w(x, Branch::Lower)
}

/// Series about the branch point in `p = ±sqrt(2(e·x + 1))`
fn branch_point_series(x: f64, sign: f64) -> f64 {
    let p = sign * (2.0 * (E * x + 1.0)).max(0.0).sqrt();
    -1.0 + p - p * p / 3.0 + 11.0 / 72.0 * p * p * p
}

fn principal_guess(x: f64) -> f64 {
    if x < -0.25 {
        branch_point_series(x, 1.0)
    } else if x < 3.0 {
        // Winitzki
        let l = x.ln_1p();
        l * (1.0 - l.ln_1p() / (2.0 + l))
    } else {
        let l1 = x.ln();
        let l2 = l1.ln();
        l1 - l2 + l2 / l1
    }
}

fn lower_guess(x: f64) -> f64 {
    if x < -0.25 {
        branch_point_series(x, -1.0)
    } else {
        let l1 = (-x).ln();
        let l2 = (-l1).ln();
        l1 - l2 + l2 / l1
    }
}

/// Halley refinement of `w·exp(w) - x = 0`
fn halley(x: f64, mut w: f64) -> f64 {
    for _ in 0..MAX_ITERATIONS {
        let ew = w.exp();
        let f = w * ew - x;
        let wp1 = w + 1.0;
        if wp1 == 0.0 {
            break;
        }
        let denom = ew * wp1 - (w + 2.0) * f / (2.0 * wp1);
        if denom == 0.0 || !denom.is_finite() {
            break;
        }
        let next = w - f / denom;
        if (next - w).abs() <= 1e-15 * (1.0 + next.abs()) {
            return next;
        }
        w = next;
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_known_values() {
        assert_relative_eq!(lambert_w0(1.0), 0.567_143_290_409_783_9, epsilon = 1e-12);
        assert_relative_eq!(lambert_w0(E), 1.0, epsilon = 1e-12);
        assert_relative_eq!(lambert_wm1(-0.5 * INV_E), -2.678_346_990_016_661, epsilon = 1e-10);
    }

    #[test]
    fn test_special_points() {
        assert_eq!(lambert_w0(0.0), 0.0);
        assert_eq!(lambert_wm1(0.0), f64::NEG_INFINITY);
        assert_eq!(lambert_w0(-INV_E), -1.0);
        assert_eq!(lambert_wm1(-INV_E), -1.0);
        assert!(lambert_w0(-0.5).is_nan());
        assert!(lambert_wm1(0.5).is_nan());
        assert!(lambert_w0(f64::NAN).is_nan());
    }

    #[test]
    fn test_inverse_near_branch_point() {
        for w in [-0.999, -0.99, -0.9] {
            let x = w * f64::exp(w);
            assert_relative_eq!(lambert_w0(x), w, epsilon = 1e-6);
        }
        for w in [-1.001, -1.01, -1.1] {
            let x = w * f64::exp(w);
            assert_relative_eq!(lambert_wm1(x), w, epsilon = 1e-6);
        }
    }
}
