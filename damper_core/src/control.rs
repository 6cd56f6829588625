//! Three-axis damper regulator.
//!
//! Per axis the decision table picks a drive direction from load and
//! position with hysteresis, gates it on the limit switches, then scales it
//! by the position-error speed tier. Load-envelope violations always drive
//! at the fast tier.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Off,
    On,
    /// One-pass mode that forces motion even inside the dead band, then
    /// demotes to On.
    Starting,
}

impl Activation {
    pub fn is_active(self) -> bool {
        !matches!(self, Activation::Off)
    }
}

/// Control envelope constants.
#[derive(Debug, Clone, Copy)]
pub struct ControlParams {
    pub load_min: f64,
    pub load_max: f64,
    pub load_tol: f64,
    pub position_nom: f64,
    pub position_tol: f64,
    pub position_fast: f64,
    pub motor_slow: u32,
    pub motor_med: u32,
    pub motor_fast: u32,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            load_min: 40.0,
            load_max: 50.0,
            load_tol: 2.0,
            position_nom: 1.0,
            position_tol: 0.1,
            position_fast: 0.4,
            motor_slow: 50,
            motor_med: 200,
            motor_fast: 1000,
        }
    }
}

/// Everything the per-axis decision needs.
#[derive(Debug, Clone, Copy)]
pub struct AxisInput {
    /// Damper top position (mm).
    pub pos: f64,
    /// Derived damper load (kg).
    pub load: f64,
    /// Hardware-reported motor speed (signed steps/s).
    pub spd: i32,
    pub top_hit: bool,
    pub bottom_hit: bool,
    pub starting: bool,
}

/// Decide the signed target speed for one axis.
pub fn decide_axis(p: &ControlParams, inp: &AxisInput) -> i32 {
    let mut overload = false;
    let drive: i32 = if inp.load > p.load_max {
        overload = true;
        -1
    } else if inp.load < p.load_min {
        overload = true;
        1
    } else if inp.pos < p.position_nom - p.position_tol && inp.load < p.load_max - p.load_tol {
        1
    } else if inp.pos > p.position_nom + p.position_tol && inp.load > p.load_min + p.load_tol {
        -1
    } else if inp.spd > 0 {
        // Driving up: stop at nominal or when the load nears its ceiling.
        if inp.pos >= p.position_nom || inp.load >= p.load_max - p.load_tol {
            0
        } else {
            1
        }
    } else if inp.spd < 0 {
        if inp.pos <= p.position_nom || inp.load <= p.load_min + p.load_tol {
            0
        } else {
            -1
        }
    } else if inp.starting {
        match inp.pos.partial_cmp(&p.position_nom) {
            Some(std::cmp::Ordering::Greater) => -1,
            Some(std::cmp::Ordering::Less) => 1,
            _ => 0,
        }
    } else {
        0
    };

    // Limit-switch gate: an engaged top switch blocks up, bottom blocks down.
    let drive = if (drive > 0 && inp.top_hit) || (drive < 0 && inp.bottom_hit) {
        0
    } else {
        drive
    };

    let dist = (inp.pos - p.position_nom).abs();
    let tier = if overload || dist > p.position_fast {
        p.motor_fast
    } else if dist > p.position_tol {
        p.motor_med
    } else {
        p.motor_slow
    };
    drive * tier as i32
}
