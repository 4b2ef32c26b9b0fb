use approx::assert_relative_eq;
use snowimager::core::lambert_w::{lambert_w, lambert_w0, lambert_wm1, Branch};

const INV_E: f64 = 0.367_879_441_171_442_33;

#[test]
fn test_principal_branch_reference_values() {
    let table = [
        (1.0, 0.567_143_290_409_783_9),
        (std::f64::consts::E, 1.0),
        (10.0, 1.745_528_002_740_699),
        (0.5, 0.351_733_711_249_195_8),
        (-0.331_091_497_054_298, -0.608_341_284_733_432),
        (100.0, 3.385_630_140_290_050),
        (1e6, 11.383_358_086_140_05),
    ];
    for (x, expected) in table {
        let w = lambert_w0(x);
        println!("W0({}) = {}", x, w);
        assert_relative_eq!(w, expected, epsilon = 1e-6, max_relative = 1e-9);
    }
}

#[test]
fn test_lower_branch_reference_values() {
    let table = [
        (-0.036_787_944_117_144, -4.889_720_169_867_429),
        (-0.183_939_720_585_721, -2.678_346_990_016_661),
        (-0.331_091_497_054_298, -1.531_811_608_389_612),
    ];
    for (x, expected) in table {
        let w = lambert_wm1(x);
        println!("W-1({}) = {}", x, w);
        assert_relative_eq!(w, expected, epsilon = 1e-6);
    }
}

#[test]
fn test_values_invert_w_exp_w() {
    let mut x = -0.36;
    while x < 50.0 {
        let w = lambert_w(x, Branch::Principal);
        assert!(w >= -1.0);
        assert_relative_eq!(w * w.exp(), x, epsilon = 1e-10, max_relative = 1e-10);
        x += 0.37;
    }

    for x in [-0.3678, -0.3, -0.2, -0.1, -0.01, -1e-4, -1e-8] {
        let w = lambert_w(x, Branch::Lower);
        assert!(w <= -1.0, "W-1({}) = {} above the branch point", x, w);
        assert_relative_eq!(w * w.exp(), x, epsilon = 1e-12, max_relative = 1e-9);
    }
}

#[test]
fn test_outside_domain() {
    assert!(lambert_w0(-INV_E - 1e-3).is_nan());
    assert!(lambert_wm1(-INV_E - 1e-3).is_nan());
    assert!(lambert_wm1(1e-3).is_nan());
    assert_eq!(lambert_w0(-INV_E), -1.0);
    assert_eq!(lambert_w0(f64::INFINITY), f64::INFINITY);
}
