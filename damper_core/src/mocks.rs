#![allow(clippy::unwrap_used)]
//! Test and helper doubles for damper_core.
//!
//! `RecordingLink` and `RecordingAdc` stand in for the hardware backends:
//! they record every frame the engine writes so tests can assert on exact
//! wire traffic, and expose probes to inject transport failures.

use std::sync::{Arc, Mutex};

use damper_traits::{AdcTransport, ControllerLink};

#[derive(Default)]
struct LinkState {
    sent: Vec<String>,
    released: bool,
    fail_send: bool,
}

/// Controller link that records sent frames.
pub struct RecordingLink {
    handle: String,
    state: Arc<Mutex<LinkState>>,
}

#[derive(Clone)]
pub struct LinkProbe(Arc<Mutex<LinkState>>);

impl RecordingLink {
    pub fn named(handle: &str) -> (Self, LinkProbe) {
        let state = Arc::new(Mutex::new(LinkState::default()));
        (
            Self {
                handle: handle.to_string(),
                state: state.clone(),
            },
            LinkProbe(state),
        )
    }
}

impl ControllerLink for RecordingLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.state.lock().unwrap();
        if st.fail_send {
            return Err(Box::new(std::io::Error::other("injected send failure")));
        }
        st.sent.push(String::from_utf8_lossy(frame).into_owned());
        Ok(())
    }

    fn handle(&self) -> &str {
        &self.handle
    }

    fn release(&mut self) {
        self.state.lock().unwrap().released = true;
    }
}

impl LinkProbe {
    pub fn sent_frames(&self) -> Vec<String> {
        self.0.lock().unwrap().sent.clone()
    }

    /// Drain recorded frames so the next assertion starts clean.
    pub fn take_frames(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().unwrap().sent)
    }

    pub fn released(&self) -> bool {
        self.0.lock().unwrap().released
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.0.lock().unwrap().fail_send = fail;
    }
}

#[derive(Default)]
struct AdcStateInner {
    connected: bool,
    sent: Vec<Vec<u8>>,
    fail_connect: bool,
    fail_send: bool,
}

/// ADC transport that records request frames.
pub struct RecordingAdc(Arc<Mutex<AdcStateInner>>);

#[derive(Clone)]
pub struct AdcProbe(Arc<Mutex<AdcStateInner>>);

impl RecordingAdc {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, AdcProbe) {
        let state = Arc::new(Mutex::new(AdcStateInner::default()));
        (Self(state.clone()), AdcProbe(state))
    }
}

impl AdcTransport for RecordingAdc {
    fn connect(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.0.lock().unwrap();
        if st.fail_connect {
            return Ok(false);
        }
        st.connected = true;
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = self.0.lock().unwrap();
        if st.fail_send || !st.connected {
            return Err(Box::new(std::io::Error::other("adc not writable")));
        }
        st.sent.push(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.0.lock().unwrap().connected = false;
    }
}

impl AdcProbe {
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().sent.clone()
    }

    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.0.lock().unwrap().sent)
    }

    pub fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.0.lock().unwrap().fail_connect = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.0.lock().unwrap().fail_send = fail;
    }
}

/// Build a well-formed 25-byte ADC response carrying `counts`.
pub fn adc_frame(counts: [u16; 8]) -> Vec<u8> {
    let mut f = vec![0u8; 25];
    f[0] = 0x01; // txn echo
    f[7] = 0x04; // function code
    f[8] = 16; // byte count
    for (i, c) in counts.iter().enumerate() {
        f[9 + 2 * i..11 + 2 * i].copy_from_slice(&c.to_be_bytes());
    }
    f
}
