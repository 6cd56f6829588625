//! Typed configuration for the damper control server.
//!
//! The TOML file carries deployment constants (ADC endpoint, expected
//! controller serials, observer allow-list, control envelope, platform
//! geometry); the calibration CSV carries the per-ADC-channel anchor tables.
//! All sections have deployment defaults so an empty file is a valid config.

use serde::Deserialize;
use thiserror::Error;

/// Number of ADC channels on the ADAM unit.
pub const NUM_ADC_CHANNELS: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdcCfg {
    /// ADAM module address.
    pub host: String,
    pub port: u16,
}

impl Default for AdcCfg {
    fn default() -> Self {
        Self {
            host: "192.168.0.10".into(),
            port: 502,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllersCfg {
    /// Expected controller serials, indexed by role slot.
    /// Slot 0 owns motors and limit switches; slot 1 is reserved.
    pub expected_serials: Vec<String>,
    /// USB vendor/product match for discovery.
    pub usb_vid: u16,
    pub usb_pid: u16,
    /// Controller pin flashed as heartbeat LED (at most one change per second).
    pub led_pin: u8,
}

impl Default for ControllersCfg {
    fn default() -> Self {
        Self {
            expected_serials: vec![
                "ffffffff3850313339302020ff0e20".into(),
                "ffffffff3850313339302020ff0d12".into(),
            ],
            usb_vid: 0x03eb,
            usb_pid: 0x2300,
            led_pin: 49,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    /// Observer listener bind address.
    pub bind: String,
    /// Client addresses allowed to issue commands; "*" is a wildcard.
    pub allow: Vec<String>,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            allow: vec!["127.0.0.1".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlCfg {
    /// Nominal per-damper load (kg).
    pub load_nom: f64,
    /// Safe load envelope (kg) with hysteresis margin.
    pub load_min: f64,
    pub load_max: f64,
    pub load_tol: f64,
    /// Damper top nominal height (mm) with dead band and fast band.
    pub position_nom: f64,
    pub position_tol: f64,
    pub position_fast: f64,
    /// Speed tiers (steps/s).
    pub motor_slow: u32,
    pub motor_med: u32,
    pub motor_fast: u32,
    /// Stage travel to motor steps conversion.
    pub steps_per_mm: f64,
    /// Motor-vs-stage consistency tolerance (mm).
    pub motor_tol_mm: f64,
    /// Load response to damper compression (kg per mm of stage-minus-damper).
    pub force_const: f64,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            load_nom: 45.0,
            load_min: 40.0,
            load_max: 50.0,
            load_tol: 2.0,
            position_nom: 1.0,
            position_tol: 0.1,
            position_fast: 0.4,
            motor_slow: 50,
            motor_med: 200,
            motor_fast: 1000,
            steps_per_mm: 1000.0,
            motor_tol_mm: 0.5,
            force_const: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeometryCfg {
    /// Vacuum bellows diameter (cm).
    pub bellow_dia_cm: f64,
    /// Pulse-tube bellow offset from centre toward damper 0, and damper
    /// radial distance, same unit (only the ratio enters the load shares).
    pub bellow_pos: f64,
    pub damper_pos: f64,
    /// Reference ambient pressure (hPa).
    pub air_pressure_nom: f64,
    pub gravity: f64,
}

impl Default for GeometryCfg {
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

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollCfg {
    /// Scheduler period (ms). Observer broadcasts run every second tick.
    pub tick_ms: u64,
    /// Consecutive bad polls tolerated while active before deactivation.
    pub max_bad_polls: u32,
}

impl Default for PollCfg {
    fn default() -> Self {
        Self {
            tick_ms: 80,
            max_bad_polls: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    /// Directory for the monthly event log (cute_server_YYYYMM.log).
    pub dir: Option<String>,
    /// Diagnostic level for tracing: "trace","debug","info","warn","error".
    pub level: Option<String>,
    /// Optional diagnostic log file (tracing output, distinct from the event log).
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub adc: AdcCfg,
    pub controllers: ControllersCfg,
    pub server: ServerCfg,
    pub control: ControlCfg,
    pub geometry: GeometryCfg,
    pub poll: PollCfg,
    pub logging: Logging,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controllers.expected_serials.len() < 2 {
            return Err(ConfigError::Invalid(
                "expected_serials must name both role slots".into(),
            ));
        }
        if self.control.load_min >= self.control.load_max {
            return Err(ConfigError::Invalid("load_min must be < load_max".into()));
        }
        if self.control.load_tol < 0.0 || self.control.position_tol <= 0.0 {
            return Err(ConfigError::Invalid("tolerances must be positive".into()));
        }
        if self.control.position_fast <= self.control.position_tol {
            return Err(ConfigError::Invalid(
                "position_fast must be > position_tol".into(),
            ));
        }
        if self.control.steps_per_mm <= 0.0 || self.control.motor_tol_mm <= 0.0 {
            return Err(ConfigError::Invalid(
                "steps_per_mm and motor_tol_mm must be > 0".into(),
            ));
        }
        if self.control.motor_slow == 0
            || self.control.motor_med <= self.control.motor_slow
            || self.control.motor_fast <= self.control.motor_med
        {
            return Err(ConfigError::Invalid(
                "speed tiers must be increasing and non-zero".into(),
            ));
        }
        if self.geometry.damper_pos <= 0.0 || self.geometry.gravity <= 0.0 {
            return Err(ConfigError::Invalid(
                "damper_pos and gravity must be > 0".into(),
            ));
        }
        if self.poll.tick_ms == 0 || self.poll.max_bad_polls == 0 {
            return Err(ConfigError::Invalid(
                "tick_ms and max_bad_polls must be > 0".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_toml(s: &str) -> Result<Config, ConfigError> {
    let cfg = toml::from_str::<Config>(s)?;
    cfg.validate()?;
    Ok(cfg)
}

/// One calibration anchor: ADC `raw` counts map to `value` physical units on
/// `channel` (0..2 damper mm, 3..5 stage mm, 6 pressure hPa).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CalRow {
    pub channel: usize,
    pub raw: u16,
    pub value: f64,
}

/// Per-channel anchor sequences, raw-ascending, ready for piecewise-linear
/// interpolation. A channel with no anchors stays empty (spare channel 7).
#[derive(Debug, Clone, Default)]
pub struct CalAnchors {
    pub channels: Vec<Vec<(f64, f64)>>,
}

impl CalAnchors {
    pub fn from_rows(rows: Vec<CalRow>) -> Result<Self, ConfigError> {
        let mut channels = vec![Vec::new(); NUM_ADC_CHANNELS];
        for r in rows {
            if r.channel >= NUM_ADC_CHANNELS {
                return Err(ConfigError::Invalid(format!(
                    "calibration channel {} out of range",
                    r.channel
                )));
            }
            channels[r.channel].push((f64::from(r.raw), r.value));
        }
        for (ch, anchors) in channels.iter().enumerate() {
            if anchors.len() == 1 {
                return Err(ConfigError::Invalid(format!(
                    "channel {ch}: a single anchor cannot define a segment"
                )));
            }
            for pair in anchors.windows(2) {
                if pair[1].0 <= pair[0].0 {
                    return Err(ConfigError::Invalid(format!(
                        "channel {ch}: anchor raw values must be strictly increasing"
                    )));
                }
            }
        }
        Ok(Self { channels })
    }
}

/// Load the per-channel anchor table from a CSV with header `channel,raw,value`.
pub fn load_calibration_csv(path: &std::path::Path) -> Result<CalAnchors, ConfigError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for rec in rdr.deserialize::<CalRow>() {
        rows.push(rec?);
    }
    CalAnchors::from_rows(rows)
}
