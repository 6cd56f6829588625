//! Serial-port controller links (feature `hardware`).
//!
//! Controllers enumerate as USB CDC serial ports; discovery matches the
//! vendor/product pair and identity is confirmed over the wire by `a.ser`.
//! Writes go through a shared port handle; a reader thread per device
//! forwards raw bytes into the engine's event funnel and reports the device
//! gone on a hard error. Hot-plug is the OS's business: the watcher only
//! polls the port list and opens what appears.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use damper_traits::ControllerLink;
use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, warn};

use crate::LinkEvent;
use crate::error::HwError;

pub struct SerialControllerLink {
    handle: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    released: Arc<AtomicBool>,
}

impl ControllerLink for SerialControllerLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.released.load(Ordering::Relaxed) {
            return Err(Box::new(HwError::Released));
        }
        let mut port = self.port.lock().map_err(
            |_| -> Box<dyn std::error::Error + Send + Sync> {
                Box::new(HwError::Serial("port lock poisoned".into()))
            },
        )?;
        port.write_all(frame).map_err(|e| {
            Box::new(HwError::Io(e)) as Box<dyn std::error::Error + Send + Sync>
        })
    }

    fn handle(&self) -> &str {
        &self.handle
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::Relaxed);
    }
}

/// Open a controller port and start its reader thread.
pub fn open_link(
    path: &str,
    events: Sender<LinkEvent>,
) -> Result<SerialControllerLink, HwError> {
    let port = serialport::new(path, 115_200)
        // Bulk transfers carry a 1 s hardware timeout; mirror it here.
        .timeout(Duration::from_secs(1))
        .open()
        .map_err(|e| HwError::Serial(format!("open {path}: {e}")))?;
    let reader = port
        .try_clone()
        .map_err(|e| HwError::Serial(format!("clone {path}: {e}")))?;

    let released = Arc::new(AtomicBool::new(false));
    let handle = path.to_string();
    spawn_reader(reader, handle.clone(), events, released.clone());
    Ok(SerialControllerLink {
        handle,
        port: Arc::new(Mutex::new(port)),
        released,
    })
}

fn spawn_reader(
    mut reader: Box<dyn SerialPort>,
    handle: String,
    events: Sender<LinkEvent>,
    released: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            if released.load(Ordering::Relaxed) {
                debug!(%handle, "reader released");
                return;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = events.send(LinkEvent::Gone {
                        handle: handle.clone(),
                    });
                    return;
                }
                Ok(n) => {
                    let _ = events.send(LinkEvent::Data {
                        handle: handle.clone(),
                        bytes: buf[..n].to_vec(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(%handle, error = %e, "reader finished");
                    let _ = events.send(LinkEvent::Gone {
                        handle: handle.clone(),
                    });
                    return;
                }
            }
        }
    });
}

/// Paths of currently attached ports matching the vendor/product pair.
pub fn matching_ports(vid: u16, pid: u16) -> Vec<String> {
    let Ok(ports) = serialport::available_ports() else {
        return Vec::new();
    };
    ports
        .into_iter()
        .filter(|p| match &p.port_type {
            SerialPortType::UsbPort(info) => info.vid == vid && info.pid == pid,
            _ => false,
        })
        .map(|p| p.port_name)
        .collect()
}

/// Polls the port list and opens newly appeared controllers.
pub struct PortWatcher {
    stop: Arc<AtomicBool>,
}

impl PortWatcher {
    pub fn spawn(vid: u16, pid: u16, events: Sender<LinkEvent>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_bg = stop.clone();
        thread::spawn(move || {
            let mut seen: HashSet<String> = HashSet::new();
            while !stop_bg.load(Ordering::Relaxed) {
                let present: HashSet<String> = matching_ports(vid, pid).into_iter().collect();
                for path in present.difference(&seen) {
                    match open_link(path, events.clone()) {
                        Ok(link) => {
                            info!(%path, "controller port opened");
                            let _ = events.send(LinkEvent::Attached(Box::new(link)));
                        }
                        // Open failures log and skip; retried next scan.
                        Err(e) => warn!(%path, error = %e, "controller open failed"),
                    }
                }
                for path in seen.difference(&present) {
                    let _ = events.send(LinkEvent::Gone {
                        handle: path.clone(),
                    });
                }
                seen = present;
                thread::sleep(period);
            }
        });
        Self { stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
