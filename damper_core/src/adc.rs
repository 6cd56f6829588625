//! Modbus-TCP polling client for the 8-channel ADAM ADC.
//!
//! The request is a fixed 12-byte read-input-registers frame (function
//! code 4, address 0, count 8); the response is 25 bytes with the eight
//! big-endian u16 counts in bytes 9..24. Exactly one request is in flight:
//! a tick that finds the previous response missing demotes the state to
//! `Missed` instead of stacking a second request.

use damper_traits::AdcTransport;
use tracing::{info, warn};

use crate::calib::NUM_CHANNELS;

/// Txn 0x0100, Proto 0, Len 6, Unit 1, Func 4, Addr 0, Count 8.
pub const ADC_REQUEST: [u8; 12] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x08,
];
pub const ADC_RESPONSE_LEN: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcState {
    NotConnected,
    Bad,
    Ok,
    Waiting,
    Missed,
}

pub struct AdcClient {
    transport: Box<dyn AdcTransport + Send>,
    state: AdcState,
}

impl AdcClient {
    pub fn new(transport: Box<dyn AdcTransport + Send>) -> Self {
        Self {
            transport,
            state: AdcState::NotConnected,
        }
    }

    pub fn state(&self) -> AdcState {
        self.state
    }

    /// A fresh sample arrived since the last tick.
    pub fn is_ok(&self) -> bool {
        self.state == AdcState::Ok
    }

    /// Reconnect when the socket is absent. Only meaningful in the Bad and
    /// NotConnected states; the 80 ms tick is the only retry cadence.
    pub fn ensure_connected(&mut self) {
        if !matches!(self.state, AdcState::Bad | AdcState::NotConnected)
            || self.transport.is_connected()
        {
            return;
        }
        match self.transport.connect() {
            Ok(true) => {
                info!("ADC connected");
                self.state = AdcState::Ok;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "ADC connect failed");
            }
        }
    }

    /// Scheduler-tick send. Ok sends and starts waiting; Waiting means the
    /// previous response never came, so demote to Missed (the caller logs);
    /// Missed keeps re-asking at tick cadence until a response or a socket
    /// error resolves it.
    ///
    /// Returns true when this tick demoted Waiting to Missed.
    pub fn tick_send(&mut self) -> bool {
        match self.state {
            AdcState::Ok => {
                self.send_request();
                if self.state == AdcState::Ok {
                    self.state = AdcState::Waiting;
                }
                false
            }
            AdcState::Waiting => {
                self.state = AdcState::Missed;
                true
            }
            AdcState::Missed => {
                self.send_request();
                false
            }
            AdcState::Bad | AdcState::NotConnected => false,
        }
    }

    fn send_request(&mut self) {
        if let Err(e) = self.transport.send(&ADC_REQUEST) {
            warn!(error = %e, "ADC write failed");
            self.transport.close();
            self.state = AdcState::Bad;
        }
    }

    /// A frame arrived from the transport. Anything but exactly 25 bytes is
    /// ignored and does not advance the state machine.
    pub fn on_frame(&mut self, frame: &[u8]) -> Option<[u16; NUM_CHANNELS]> {
        if frame.len() != ADC_RESPONSE_LEN {
            return None;
        }
        if self.state == AdcState::Missed {
            info!("ADC OK");
        }
        self.state = AdcState::Ok;
        let mut counts = [0u16; NUM_CHANNELS];
        for (i, c) in counts.iter_mut().enumerate() {
            *c = u16::from_be_bytes([frame[9 + 2 * i], frame[10 + 2 * i]]);
        }
        Some(counts)
    }

    /// Socket close or read error observed by the transport reader.
    pub fn on_closed(&mut self) {
        self.transport.close();
        self.state = AdcState::Bad;
    }

    /// Shutdown path: destroy the socket.
    pub fn close(&mut self) {
        self.transport.close();
        self.state = AdcState::NotConnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingAdc;

    fn client() -> (AdcClient, crate::mocks::AdcProbe) {
        let (t, probe) = RecordingAdc::new();
        (AdcClient::new(Box::new(t)), probe)
    }

    fn frame_of(counts: [u16; 8]) -> Vec<u8> {
        let mut f = vec![0u8; 25];
        for (i, c) in counts.iter().enumerate() {
            f[9 + 2 * i..11 + 2 * i].copy_from_slice(&c.to_be_bytes());
        }
        f
    }

    #[test]
    fn connects_then_polls() {
        let (mut c, probe) = client();
        assert_eq!(c.state(), AdcState::NotConnected);
        c.ensure_connected();
        assert_eq!(c.state(), AdcState::Ok);
        assert!(!c.tick_send());
        assert_eq!(c.state(), AdcState::Waiting);
        assert_eq!(probe.sent_frames(), vec![ADC_REQUEST.to_vec()]);
    }

    #[test]
    fn waiting_tick_demotes_without_second_request() {
        let (mut c, probe) = client();
        c.ensure_connected();
        c.tick_send();
        assert!(c.tick_send());
        assert_eq!(c.state(), AdcState::Missed);
        // Only the original request went out.
        assert_eq!(probe.sent_frames().len(), 1);
    }

    #[test]
    fn short_frame_is_ignored() {
        let (mut c, _probe) = client();
        c.ensure_connected();
        c.tick_send();
        assert!(c.on_frame(&[0u8; 24]).is_none());
        assert_eq!(c.state(), AdcState::Waiting);
    }

    #[test]
    fn full_frame_decodes_big_endian_counts() {
        let (mut c, _probe) = client();
        c.ensure_connected();
        c.tick_send();
        let counts = [1u16, 2, 3, 4, 5, 6, 0x1234, 0];
        let got = c.on_frame(&frame_of(counts)).unwrap();
        assert_eq!(got, counts);
        assert_eq!(c.state(), AdcState::Ok);
    }

    #[test]
    fn missed_recovers_on_late_response() {
        let (mut c, _probe) = client();
        c.ensure_connected();
        c.tick_send();
        c.tick_send(); // -> Missed
        let got = c.on_frame(&frame_of([9; 8]));
        assert!(got.is_some());
        assert_eq!(c.state(), AdcState::Ok);
    }

    #[test]
    fn closed_socket_goes_bad_and_reconnects() {
        let (mut c, probe) = client();
        c.ensure_connected();
        c.on_closed();
        assert_eq!(c.state(), AdcState::Bad);
        assert!(!probe.is_connected());
        c.ensure_connected();
        assert_eq!(c.state(), AdcState::Ok);
    }
}
