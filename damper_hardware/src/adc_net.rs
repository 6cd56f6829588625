//! TCP transport to the ADAM ADC.
//!
//! The engine drives connect/send/close from its own thread; a reader
//! thread owns a clone of the stream and forwards complete Modbus frames
//! (or a close notice) through a channel. Reassembly uses the length field
//! of the 6-byte MBAP header, so a fragmented 25-byte response still
//! arrives as one frame.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use damper_traits::AdcTransport;
use tracing::{debug, warn};

use crate::error::HwError;

/// Out-of-band transport notifications for the engine's event funnel.
#[derive(Debug)]
pub enum AdcEvent {
    Frame(Vec<u8>),
    Closed,
}

pub struct TcpAdcTransport {
    addr: String,
    stream: Option<TcpStream>,
    events: Sender<AdcEvent>,
    /// A read stalling this long counts as a dead socket.
    read_timeout: Duration,
}

impl TcpAdcTransport {
    pub fn new(addr: impl Into<String>, events: Sender<AdcEvent>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            events,
            read_timeout: Duration::from_secs(10),
        }
    }

    fn spawn_reader(&self, stream: TcpStream) {
        let events = self.events.clone();
        let timeout = self.read_timeout;
        thread::spawn(move || {
            let _ = stream.set_read_timeout(Some(timeout));
            let mut stream = stream;
            loop {
                match read_frame(&mut stream) {
                    Ok(frame) => {
                        let _ = events.send(AdcEvent::Frame(frame));
                    }
                    Err(e) => {
                        debug!(error = %e, "ADC reader finished");
                        let _ = events.send(AdcEvent::Closed);
                        return;
                    }
                }
            }
        });
    }
}

/// Read one MBAP-framed response: 6-byte header, then `length` more bytes.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header)?;
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let mut frame = vec![0u8; 6 + length];
    frame[..6].copy_from_slice(&header);
    stream.read_exact(&mut frame[6..])?;
    Ok(frame)
}

impl AdcTransport for TcpAdcTransport {
    fn connect(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        if self.stream.is_some() {
            return Ok(true);
        }
        let addrs: Vec<_> = std::net::ToSocketAddrs::to_socket_addrs(&self.addr)?.collect();
        let Some(addr) = addrs.first() else {
            return Err(Box::new(HwError::Serial(format!(
                "cannot resolve {}",
                self.addr
            ))));
        };
        match TcpStream::connect_timeout(addr, Duration::from_millis(500)) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                self.spawn_reader(stream.try_clone()?);
                self.stream = Some(stream);
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, addr = %self.addr, "ADC connect attempt failed");
                Ok(false)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Box::new(HwError::NotConnected));
        };
        stream.write_all(frame).map_err(|e| {
            warn!(error = %e, "ADC write failed");
            Box::new(HwError::Io(e)) as Box<dyn std::error::Error + Send + Sync>
        })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
