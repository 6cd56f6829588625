//! Server-side motor control plane.
//!
//! The controller firmware owns the actual ramp generation; the server only
//! issues `ramp`/`dir`/`halt`/`pos`/`on` commands and shadows what the
//! hardware last reported. `plan_ramp` is the per-motor step planner
//! contract: it emits the minimal wire command sequence for a signed target
//! speed, and emits nothing when the target is unchanged.

use crate::calib::NUM_AXES;

pub const NUM_MOTORS: usize = NUM_AXES;

#[derive(Debug, Clone, Copy, Default)]
pub struct MotorShadow {
    /// Commanded speed, sign = direction.
    pub target_sps: i32,
    /// Last hardware-reported speed.
    pub reported_sps: i32,
    /// Last hardware-reported step position.
    pub reported_pos: Option<i64>,
    /// Direction bit as last commanded (None until first set).
    pub dir_set: Option<bool>,
    /// Windings energized.
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct MotorPlane {
    motors: [MotorShadow; NUM_MOTORS],
}

impl MotorPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn motor(&self, n: usize) -> &MotorShadow {
        &self.motors[n]
    }

    /// Commands (without class prefix) to move motor `n` toward `sps`.
    ///
    /// - unchanged target: nothing
    /// - sign reversal: ramp to 0 first; the next control pass restarts in
    ///   the other direction once the target is 0
    /// - starting from 0: direction bit first when it differs
    pub fn plan_ramp(&mut self, n: usize, sps: i32) -> Vec<String> {
        let cur = self.motors[n].target_sps;
        if sps == cur {
            return Vec::new();
        }
        if cur != 0 && sps != 0 && (cur < 0) != (sps < 0) {
            self.motors[n].target_sps = 0;
            return vec![format!("m{n} ramp 0")];
        }
        let mut cmds = Vec::new();
        if sps != 0 {
            let up = sps > 0;
            if self.motors[n].dir_set != Some(up) {
                cmds.push(format!("m{n} dir {}", u8::from(up)));
                self.motors[n].dir_set = Some(up);
            }
        }
        cmds.push(format!("m{n} ramp {}", sps.unsigned_abs()));
        self.motors[n].target_sps = sps;
        cmds
    }

    /// Emergency stop for one motor.
    pub fn plan_halt(&mut self, n: usize) -> String {
        self.motors[n].target_sps = 0;
        format!("m{n} halt")
    }

    /// Emergency stop for all motors (`c.halt` on the wire).
    pub fn plan_halt_all(&mut self) -> String {
        for m in &mut self.motors {
            m.target_sps = 0;
        }
        "halt".to_string()
    }

    /// Seed the device position counter and energize windings on activation.
    pub fn plan_activate(&mut self, n: usize, pos_steps: i64) -> Vec<String> {
        self.motors[n].running = true;
        vec![format!("m{n} pos {pos_steps}"), format!("m{n} on 1")]
    }

    /// Update the shadow from an `f.` feedback body.
    pub fn note_feedback(&mut self, n: usize, sps: i32, pos: Option<i64>) {
        let m = &mut self.motors[n];
        m.reported_sps = sps;
        if pos.is_some() {
            m.reported_pos = pos;
        }
    }

    pub fn reported_speeds(&self) -> [i32; NUM_MOTORS] {
        [
            self.motors[0].reported_sps,
            self.motors[1].reported_sps,
            self.motors[2].reported_sps,
        ]
    }
}

/// Parse a motor feedback body: `mN SPD=±S POS=P [...]`.
///
/// Trailing fields (CLK, RC, diagnostics) are tolerated and ignored; POS is
/// absent from some firmware replies.
pub fn parse_feedback(body: &str) -> Option<(usize, i32, Option<i64>)> {
    let mut tokens = body.split_whitespace();
    let head = tokens.next()?;
    let n = head.strip_prefix('m')?.parse::<usize>().ok()?;
    if n >= NUM_MOTORS {
        return None;
    }
    let mut sps: Option<i32> = None;
    let mut pos: Option<i64> = None;
    for tok in tokens {
        if let Some(v) = tok.strip_prefix("SPD=") {
            // Firmware writes an explicit sign character; parse accepts it.
            sps = v.parse::<i32>().ok();
        } else if let Some(v) = tok.strip_prefix("POS=") {
            pos = v.parse::<i64>().ok();
        }
    }
    Some((n, sps?, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_is_idempotent() {
        let mut p = MotorPlane::new();
        let first = p.plan_ramp(0, 200);
        assert_eq!(first, vec!["m0 dir 1", "m0 ramp 200"]);
        assert!(p.plan_ramp(0, 200).is_empty());
    }

    #[test]
    fn sign_reversal_stops_first() {
        let mut p = MotorPlane::new();
        p.plan_ramp(1, 200);
        let cmds = p.plan_ramp(1, -200);
        assert_eq!(cmds, vec!["m1 ramp 0"]);
        assert_eq!(p.motor(1).target_sps, 0);
        // Once stopped, the reverse command goes through with a dir change.
        let cmds = p.plan_ramp(1, -200);
        assert_eq!(cmds, vec!["m1 dir 0", "m1 ramp 200"]);
    }

    #[test]
    fn same_direction_speed_change_skips_dir() {
        let mut p = MotorPlane::new();
        p.plan_ramp(2, 50);
        assert_eq!(p.plan_ramp(2, 1000), vec!["m2 ramp 1000"]);
    }

    #[test]
    fn ramp_to_zero_needs_no_dir() {
        let mut p = MotorPlane::new();
        p.plan_ramp(0, -50);
        assert_eq!(p.plan_ramp(0, 0), vec!["m0 ramp 0"]);
    }

    #[test]
    fn halt_all_clears_targets() {
        let mut p = MotorPlane::new();
        p.plan_ramp(0, 200);
        p.plan_ramp(1, -200);
        assert_eq!(p.plan_halt_all(), "halt");
        assert_eq!(p.motor(0).target_sps, 0);
        assert_eq!(p.motor(1).target_sps, 0);
    }

    #[test]
    fn feedback_parses_signed_speed_and_position() {
        assert_eq!(
            parse_feedback("m0 SPD=+120 POS=4567 CLK=1"),
            Some((0, 120, Some(4567)))
        );
        assert_eq!(parse_feedback("m1 SPD=-80 POS=-12"), Some((1, -80, Some(-12))));
        assert_eq!(parse_feedback("m2 SPD=0"), Some((2, 0, None)));
        assert_eq!(parse_feedback("m7 SPD=0"), None);
        assert_eq!(parse_feedback("garbage"), None);
    }
}
