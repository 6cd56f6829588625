//! Observer listener: plain TCP, one ASCII line per message.
//!
//! Each accepted client gets a reader thread (inbound command lines into
//! the engine's event funnel) and a writer thread draining a bounded
//! outbound channel, so a stalled client drops messages instead of
//! stalling the engine. The engine owns the observer list; this module
//! only moves bytes.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use damper_core::Event;
use eyre::WrapErr;
use tracing::{debug, info, warn};

/// Outbound queue depth per observer; history replay alone can be 600 lines.
const OUTBOUND_DEPTH: usize = 1024;

pub struct ObserverServer {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl ObserverServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ObserverServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind and start accepting observers, funneling their traffic into `events`.
pub fn spawn(bind: &str, events: Sender<Event>) -> eyre::Result<ObserverServer> {
    let listener = TcpListener::bind(bind).wrap_err_with(|| format!("bind {bind}"))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "observer listener up");

    let running = Arc::new(AtomicBool::new(true));
    let running_bg = running.clone();
    thread::spawn(move || {
        let ids = AtomicU64::new(1);
        while running_bg.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let id = ids.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = handle_client(stream, addr, id, events.clone()) {
                        warn!(%addr, error = %e, "observer setup failed");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    });

    Ok(ObserverServer {
        running,
        local_addr,
    })
}

fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    events: Sender<Event>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true).ok();
    let (tx, rx) = bounded::<String>(OUTBOUND_DEPTH);
    let _ = events.send(Event::ObserverConnected {
        id,
        addr: addr.to_string(),
        tx,
    });

    // Writer: drains until the engine drops the observer's sender.
    let mut writer = stream.try_clone()?;
    thread::spawn(move || {
        for msg in rx {
            if writeln!(writer, "{msg}").is_err() {
                break;
            }
        }
        debug!(%addr, "observer writer done");
    });

    // Reader: one command per line.
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    let _ = events.send(Event::ObserverLine { id, line });
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = events.send(Event::ObserverClosed { id });
    });
    Ok(())
}
