#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Control and coordination engine for the cryostat damper platform
//! (hardware-agnostic).
//!
//! All hardware interaction goes through `damper_traits::ControllerLink` and
//! `damper_traits::AdcTransport`; the backends live in `damper_hardware`.
//!
//! ## Architecture
//!
//! - **Codec**: controller ASCII line protocol (`codec` module)
//! - **Registry**: controller identity and slot lifecycle (`registry`)
//! - **ADC**: Modbus-TCP polling state machine (`adc`)
//! - **Calibration**: piecewise-linear tables and load derivation (`calib`)
//! - **Motors**: server-side ramp planner and shadow state (`motor`)
//! - **Control**: three-axis regulator with hysteresis (`control`)
//! - **Safety**: limit switches and consistency interlocks (`safety`)
//! - **History**: per-second measurement ring (`history`)
//! - **Observers**: fan-out and the operator command plane (`observer`)
//! - **Engine**: the event loop tying it all together (`engine`)
//!
//! The engine is single-consumer: every completion (tick, ADC frame,
//! controller data, observer line) funnels through one channel, so no two
//! handlers ever run concurrently.

pub mod adc;
pub mod calib;
pub mod codec;
pub mod control;
pub mod engine;
pub mod error;
pub mod eventlog;
pub mod history;
pub mod mocks;
pub mod motor;
pub mod observer;
pub mod registry;
pub mod safety;

pub use adc::AdcState;
pub use calib::{CalibTable, Geometry, Physical};
pub use control::{Activation, ControlParams};
pub use engine::{Engine, EngineBuilder, EngineCfg, Event};
pub use error::{BuildError, Result, ServerError};
pub use eventlog::EventLog;
pub use history::HistoryRing;
pub use observer::{ObserverId, OutMsg};
