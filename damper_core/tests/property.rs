use damper_core::calib::CalibTable;
use damper_core::motor::MotorPlane;
use proptest::prelude::*;

prop_compose! {
    /// A strictly raw-increasing anchor table for one channel.
    fn anchors_strategy()(
        len in 2usize..8,
        start in 0u32..1000,
        steps in proptest::collection::vec(1u32..5000, 7),
        values in proptest::collection::vec(-500.0f64..500.0, 8),
    ) -> Vec<(f64, f64)> {
        let mut raw = start;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push((f64::from(raw), values[i]));
            raw = raw.saturating_add(steps[i.min(steps.len() - 1)]).min(65_535);
            if f64::from(raw) <= out[i].0 {
                // Ran into the ceiling; stop extending.
                break;
            }
        }
        out
    }
}

proptest! {
    /// A raw value equal to an anchor's raw converts to exactly that
    /// anchor's calibrated value.
    #[test]
    fn calibration_is_exact_at_anchors(anchors in anchors_strategy()) {
        prop_assume!(anchors.len() >= 2);
        let mut channels = vec![Vec::new(); 8];
        channels[0] = anchors.clone();
        let table = CalibTable::from_anchors(channels).unwrap();
        for (raw, value) in &anchors {
            prop_assert!((table.convert(0, *raw as u16) - value).abs() < 1e-9);
        }
    }

    /// Interpolation stays inside the segment's value range.
    #[test]
    fn calibration_is_bounded_within_segments(anchors in anchors_strategy(), frac in 0.0f64..1.0) {
        prop_assume!(anchors.len() >= 2);
        let mut channels = vec![Vec::new(); 8];
        channels[0] = anchors.clone();
        let table = CalibTable::from_anchors(channels).unwrap();
        let (x0, y0) = anchors[0];
        let (x1, y1) = anchors[1];
        let x = x0 + frac * (x1 - x0);
        let y = table.convert(0, x as u16);
        // Converting the truncated raw still lands between the segment ends
        // (within float slop).
        let (lo, hi) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
        prop_assert!(y >= lo - 1e-6 && y <= hi + 1e-6);
    }

    /// Issuing the same ramp target twice never produces a second command.
    #[test]
    fn ramp_is_idempotent_for_any_target(targets in proptest::collection::vec(-2000i32..2000, 1..40)) {
        let mut plane = MotorPlane::new();
        for t in targets {
            let _ = plane.plan_ramp(0, t);
            prop_assert!(plane.plan_ramp(0, t).is_empty());
        }
    }

    /// The planner converges: repeatedly asking for a target eventually
    /// reaches it, and a sign reversal always passes through zero.
    #[test]
    fn ramp_reaches_target_within_two_calls(a in -2000i32..2000, b in -2000i32..2000) {
        let mut plane = MotorPlane::new();
        let _ = plane.plan_ramp(1, a);
        let _ = plane.plan_ramp(1, b);
        let _ = plane.plan_ramp(1, b);
        prop_assert_eq!(plane.motor(1).target_sps, b);
    }
}
