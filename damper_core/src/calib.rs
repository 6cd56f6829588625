//! ADC calibration and derived physical quantities.
//!
//! Each ADC channel carries a monotonically increasing sequence of
//! `(raw, calibrated)` anchor points. Conversion is piecewise-linear between
//! anchors, extrapolated past either end with the nearest segment's slope.
//!
//! Channel assignment for this deployment: 0..2 damper top positions (mm),
//! 3..5 stage top positions (mm), 6 air pressure (hPa), 7 spare.

use crate::error::{BuildError, Result};

pub const NUM_CHANNELS: usize = 8;
pub const NUM_AXES: usize = 3;

/// Per-channel piecewise-linear anchor tables.
#[derive(Debug, Clone)]
pub struct CalibTable {
    channels: Vec<Vec<(f64, f64)>>,
}

impl CalibTable {
    /// Build from per-channel anchors, raw-ascending. Channels without
    /// anchors (the spare) pass raw counts through unchanged.
    pub fn from_anchors(channels: Vec<Vec<(f64, f64)>>) -> Result<Self> {
        if channels.len() != NUM_CHANNELS {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "calibration must cover all 8 channels",
            )));
        }
        for anchors in &channels {
            if anchors.len() == 1 {
                return Err(eyre::Report::new(BuildError::InvalidConfig(
                    "a single anchor cannot define a segment",
                )));
            }
            for pair in anchors.windows(2) {
                if pair[1].0 <= pair[0].0 {
                    return Err(eyre::Report::new(BuildError::InvalidConfig(
                        "anchor raw values must be strictly increasing",
                    )));
                }
            }
        }
        Ok(Self { channels })
    }

    /// Convert raw counts on `ch` to calibrated units.
    pub fn convert(&self, ch: usize, raw: u16) -> f64 {
        let x = f64::from(raw);
        let anchors = &self.channels[ch];
        if anchors.is_empty() {
            return x;
        }
        // Bracketing segment, clamped to the end segments for extrapolation.
        let mut seg = anchors.len() - 2;
        for i in 0..anchors.len() - 1 {
            if x <= anchors[i + 1].0 {
                seg = i;
                break;
            }
        }
        let (x0, y0) = anchors[seg];
        let (x1, y1) = anchors[seg + 1];
        y0 + (x - x0) * (y1 - y0) / (x1 - x0)
    }
}

impl Default for CalibTable {
    /// Deployment defaults: 50 mm of travel over full scale on the position
    /// channels, 800..1200 hPa on the pressure channel.
    fn default() -> Self {
        let pos = vec![(0.0, 0.0), (65535.0, 50.0)];
        let pres = vec![(0.0, 800.0), (65535.0, 1200.0)];
        let mut channels = vec![pos; 6];
        channels.push(pres);
        channels.push(Vec::new());
        Self { channels }
    }
}

/// Platform geometry entering the pressure-correction terms.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub bellow_dia_cm: f64,
    pub bellow_pos: f64,
    pub damper_pos: f64,
    pub air_pressure_nom: f64,
    pub gravity: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            bellow_dia_cm: 15.0,
            bellow_pos: 0.3,
            damper_pos: 1.0,
            air_pressure_nom: 1013.25,
            gravity: 9.81,
        }
    }
}

impl Geometry {
    /// Bellows cross-section in cm².
    pub fn bellow_area_cm2(&self) -> f64 {
        std::f64::consts::PI * self.bellow_dia_cm * self.bellow_dia_cm / 4.0
    }

    /// Per-damper share of the pressure-induced force. The pulse-tube bellow
    /// sits offset from centre toward damper 0, so damper 0 carries
    /// (1 + 2b/d)/3 and dampers 1 and 2 carry (1 - b/d)/3 each.
    pub fn pressure_shares(&self) -> [f64; NUM_AXES] {
        let r = self.bellow_pos / self.damper_pos;
        let side = (1.0 - r) / 3.0;
        [(1.0 + 2.0 * r) / 3.0, side, side]
    }
}

/// Calibrated sample with its derived per-damper quantities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physical {
    pub damper_mm: [f64; NUM_AXES],
    pub stage_mm: [f64; NUM_AXES],
    pub pressure_hpa: f64,
    pub load_kg: [f64; NUM_AXES],
    pub add_weight_kg: [f64; NUM_AXES],
}

/// Compute the physical state from one raw ADC sample.
///
/// `load_nom` is the nominal per-damper load (kg); `force_const` converts
/// stage-minus-damper compression (mm) to load (kg/mm).
pub fn derive(
    table: &CalibTable,
    geom: &Geometry,
    load_nom: f64,
    force_const: f64,
    raw: &[u16; NUM_CHANNELS],
) -> Physical {
    let mut damper_mm = [0.0; NUM_AXES];
    let mut stage_mm = [0.0; NUM_AXES];
    for i in 0..NUM_AXES {
        damper_mm[i] = table.convert(i, raw[i]);
        stage_mm[i] = table.convert(3 + i, raw[3 + i]);
    }
    let pressure_hpa = table.convert(6, raw[6]);

    let mut load_kg = [0.0; NUM_AXES];
    for i in 0..NUM_AXES {
        load_kg[i] = load_nom + (stage_mm[i] - damper_mm[i]) * force_const;
    }

    // Pressure-induced force in kg equivalent: ΔP[hPa] is 100 Pa, the area
    // is in cm² (1e-4 m²), so the factors collapse to /(100·g).
    let f = (pressure_hpa - geom.air_pressure_nom) * geom.bellow_area_cm2()
        / (100.0 * geom.gravity);
    let shares = geom.pressure_shares();
    let mut add_weight_kg = [0.0; NUM_AXES];
    for i in 0..NUM_AXES {
        add_weight_kg[i] = (load_nom - f * shares[i]) - load_kg[i];
    }

    Physical {
        damper_mm,
        stage_mm,
        pressure_hpa,
        load_kg,
        add_weight_kg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibTable {
        let mut channels = vec![vec![(0.0, 0.0), (1000.0, 10.0), (2000.0, 40.0)]; 7];
        channels.push(Vec::new());
        CalibTable::from_anchors(channels).unwrap()
    }

    #[test]
    fn anchors_convert_exactly() {
        let t = table();
        assert_eq!(t.convert(0, 0), 0.0);
        assert_eq!(t.convert(0, 1000), 10.0);
        assert_eq!(t.convert(0, 2000), 40.0);
    }

    #[test]
    fn interpolates_within_segment() {
        let t = table();
        assert!((t.convert(0, 500) - 5.0).abs() < 1e-12);
        assert!((t.convert(0, 1500) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn extrapolates_with_end_segment_slope() {
        let t = table();
        // Above range: slope 30/1000 continues.
        assert!((t.convert(0, 3000) - 70.0).abs() < 1e-12);
    }

    #[test]
    fn spare_channel_passes_through() {
        let t = table();
        assert_eq!(t.convert(7, 1234), 1234.0);
    }

    #[test]
    fn rejects_non_monotonic_anchors() {
        let mut channels = vec![Vec::new(); 8];
        channels[0] = vec![(10.0, 0.0), (10.0, 1.0)];
        assert!(CalibTable::from_anchors(channels).is_err());
    }

    #[test]
    fn pressure_shares_sum_to_one() {
        let g = Geometry::default();
        let s = g.pressure_shares();
        assert!((s[0] + s[1] + s[2] - 1.0).abs() < 1e-12);
        // Offset toward damper 0 loads damper 0 harder.
        assert!(s[0] > s[1]);
        assert_eq!(s[1], s[2]);
    }

    #[test]
    fn load_follows_compression() {
        let t = CalibTable::default();
        let g = Geometry::default();
        let mut raw = [0u16; 8];
        // Stage 2 mm above damper on axis 0: 50 mm over 65535 counts.
        raw[3] = (2.0 / 50.0 * 65535.0) as u16;
        // Pressure at nominal so the correction vanishes.
        raw[6] = ((1013.25 - 800.0) / 400.0 * 65535.0) as u16;
        let p = derive(&t, &g, 45.0, 10.0, &raw);
        assert!((p.load_kg[0] - 65.0).abs() < 0.1);
        assert!((p.load_kg[1] - 45.0).abs() < 0.1);
        assert!(p.add_weight_kg[1].abs() < 0.1);
    }
}
