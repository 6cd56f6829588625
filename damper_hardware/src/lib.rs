//! damper_hardware: hardware and simulation backends behind `damper_traits`.
//!
//! Features:
//! - `hardware`: serial-port controller links (pulls in `serialport`).
//! - (default) no `hardware` feature: simulation controllers and ADC only,
//!   so CI on any host builds without serial libraries.
//!
//! The TCP ADC transport is plain std networking and is always available.

pub mod adc_net;
pub mod error;
pub mod sim;

#[cfg(feature = "hardware")]
pub mod serial;

use crossbeam_channel::Sender;
use damper_traits::ControllerLink;

/// Out-of-band controller-link notifications for the engine's event funnel,
/// shared by the serial and simulation backends.
pub enum LinkEvent {
    Attached(Box<dyn ControllerLink + Send>),
    Data { handle: String, bytes: Vec<u8> },
    Gone { handle: String },
}

/// Spawn the two simulated controllers of the deployment (motor controller
/// and reserve) plus a simulated ADC, wired to the given channels.
pub fn spawn_simulated_bench(
    serials: &[String],
    links: &Sender<LinkEvent>,
    adc_events: Sender<adc_net::AdcEvent>,
) -> (Vec<sim::SimProbe>, sim::SimulatedAdc, sim::SimAdcProbe) {
    let mut probes = Vec::new();
    for (i, serial) in serials.iter().enumerate() {
        let handle = format!("sim{i}");
        let (ctl, probe) = sim::SimulatedController::new(&handle, serial, links.clone());
        probes.push(probe);
        let _ = links.send(LinkEvent::Attached(Box::new(ctl)));
    }
    let (adc, adc_probe) = sim::SimulatedAdc::new(adc_events);
    (probes, adc, adc_probe)
}

pub use error::HwError;
