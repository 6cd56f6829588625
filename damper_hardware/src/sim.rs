//! Simulation backends satisfying the traits without any hardware.
//!
//! `SimulatedController` speaks the controller line protocol closely enough
//! for the full discovery/poll/control loop to run: serial and version
//! discovery, watchdog, motor ramp/halt/dir/pos/on, GPIO range reads for the
//! limit switches, and `BAD unknown cmd` for everything else. Replies go
//! out-of-band through the same channel shape the real backends use.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use damper_traits::{AdcTransport, ControllerLink};

use crate::LinkEvent;
use crate::adc_net::AdcEvent;
use crate::error::HwError;

pub const NUM_SIM_MOTORS: usize = 3;
pub const NUM_SIM_SWITCHES: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
struct SimMotor {
    sps: u32,
    dir_up: bool,
    on: bool,
    pos: i64,
}

#[derive(Debug)]
struct SimState {
    serial: String,
    wdt_secs: u32,
    motors: [SimMotor; NUM_SIM_MOTORS],
    /// '1' = switch open (not engaged).
    switches: [char; NUM_SIM_SWITCHES],
    released: bool,
}

/// Shared handle for tests and demos to inspect and perturb the device.
#[derive(Clone)]
pub struct SimProbe(Arc<Mutex<SimState>>);

impl SimProbe {
    pub fn set_switches(&self, bits: [char; NUM_SIM_SWITCHES]) {
        self.0.lock().unwrap().switches = bits;
    }

    pub fn motor_speed(&self, n: usize) -> i32 {
        let m = self.0.lock().unwrap().motors[n];
        signed_speed(&m)
    }

    pub fn motor_pos(&self, n: usize) -> i64 {
        self.0.lock().unwrap().motors[n].pos
    }

    pub fn set_motor_pos(&self, n: usize, pos: i64) {
        self.0.lock().unwrap().motors[n].pos = pos;
    }

    pub fn wdt_secs(&self) -> u32 {
        self.0.lock().unwrap().wdt_secs
    }

    pub fn released(&self) -> bool {
        self.0.lock().unwrap().released
    }
}

fn signed_speed(m: &SimMotor) -> i32 {
    let s = m.sps as i32;
    if m.dir_up { s } else { -s }
}

/// A controller whose firmware runs in-process.
pub struct SimulatedController {
    handle: String,
    state: Arc<Mutex<SimState>>,
    replies: Sender<LinkEvent>,
}

impl SimulatedController {
    pub fn new(handle: &str, serial: &str, replies: Sender<LinkEvent>) -> (Self, SimProbe) {
        let state = Arc::new(Mutex::new(SimState {
            serial: serial.to_string(),
            wdt_secs: 0,
            motors: [SimMotor::default(); NUM_SIM_MOTORS],
            switches: ['1'; NUM_SIM_SWITCHES],
            released: false,
        }));
        (
            Self {
                handle: handle.to_string(),
                state: state.clone(),
                replies,
            },
            SimProbe(state),
        )
    }

    fn exec(&self, item: &str) -> String {
        let mut st = self.state.lock().unwrap();
        let (idx, rest) = match item.as_bytes() {
            [i, b'.', ..] if i.is_ascii_lowercase() => (Some(*i as char), &item[2..]),
            _ => (None, item),
        };
        let mut tokens = rest.split_whitespace();
        let cmd = tokens.next().unwrap_or("");
        let args: Vec<&str> = tokens.collect();

        let result: Result<String, &str> = match cmd {
            "ser" => Ok(st.serial.clone()),
            "ver" => Ok("Version 1.08 (CUTE)".into()),
            "nop" => Ok(String::new()),
            "wdt" => {
                if let Some(arg) = args.first() {
                    match arg.parse::<u32>() {
                        Ok(secs) => {
                            st.wdt_secs = secs;
                            if secs > 0 {
                                Ok(format!("WDT set to {secs} seconds"))
                            } else {
                                Ok("WDT disabled".into())
                            }
                        }
                        Err(_) => Err("invalid channel"),
                    }
                } else if st.wdt_secs > 0 {
                    Ok(format!("WDT set to {} seconds", st.wdt_secs))
                } else {
                    Ok("WDT disabled".into())
                }
            }
            "halt" => {
                for m in &mut st.motors {
                    m.sps = 0;
                }
                Ok("HALTED".into())
            }
            m if m.len() == 2 && m.starts_with('m') => {
                match (m.as_bytes()[1] as char).to_digit(10) {
                    Some(n) if (n as usize) < NUM_SIM_MOTORS => {
                        Self::exec_motor(&mut st, n as usize, &args)
                    }
                    _ => Err("unknown cmd"),
                }
            }
            p if p.starts_with("pa") => Self::exec_gpio(&st, &p[2..], &args),
            _ => Err("unknown cmd"),
        };

        let mut out = String::new();
        if let Some(i) = idx {
            out.push(i);
            out.push('.');
        }
        match result {
            Ok(msg) => {
                out.push_str("OK");
                if !msg.is_empty() {
                    out.push(' ');
                    out.push_str(&msg);
                }
            }
            Err(e) => {
                out.push_str("BAD ");
                out.push_str(e);
            }
        }
        out.push('\n');
        out
    }

    fn exec_motor(
        st: &mut SimState,
        n: usize,
        args: &[&str],
    ) -> Result<String, &'static str> {
        let m = &mut st.motors[n];
        match args.first().copied() {
            // Status poll: the firmware ramp is collapsed to an immediate
            // speed change, which is all the server-side planner observes.
            None | Some("stat") => {
                let s = signed_speed(m);
                if s == 0 {
                    Ok(format!("m{n} SPD=0 POS={}", m.pos))
                } else {
                    Ok(format!("m{n} SPD={s:+} POS={}", m.pos))
                }
            }
            Some("ramp") | Some("spd") => {
                let v: u32 = args
                    .get(1)
                    .and_then(|a| a.parse().ok())
                    .ok_or("value out of range")?;
                m.sps = v;
                Ok(String::new())
            }
            Some("halt") | Some("stop") => {
                m.sps = 0;
                Ok(String::new())
            }
            Some("dir") => {
                m.dir_up = args.get(1) == Some(&"1");
                Ok(String::new())
            }
            Some("on") => {
                if args.get(1) == Some(&"1") {
                    m.on = true;
                } else if args.get(1) == Some(&"0") {
                    m.on = false;
                }
                // "+"/"-" set the on-signal polarity; accepted silently.
                Ok(String::new())
            }
            Some("pos") => {
                if let Some(p) = args.get(1).and_then(|a| a.parse().ok()) {
                    m.pos = p;
                    Ok(String::new())
                } else {
                    Ok(format!("m{n} POS={}", m.pos))
                }
            }
            Some(_) => Err("unknown cmd"),
        }
    }

    fn exec_gpio(st: &SimState, range: &str, args: &[&str]) -> Result<String, &'static str> {
        let (a, b) = match range.split_once('-') {
            Some((a, b)) => (
                a.parse::<usize>().map_err(|_| "invalid channel")?,
                b.parse::<usize>().map_err(|_| "invalid channel")?,
            ),
            None => {
                let n = range.parse::<usize>().map_err(|_| "invalid channel")?;
                (n, n)
            }
        };
        if !args.is_empty() {
            // Pin writes and pull-up configuration: accepted.
            return Ok(String::new());
        }
        let mut bits = String::new();
        for k in a..=b {
            bits.push(*st.switches.get(k).unwrap_or(&'1'));
        }
        if a == b {
            Ok(format!("pa{a} VAL={bits}"))
        } else {
            Ok(format!("pa{a}-{b} VAL={bits}"))
        }
    }
}

impl ControllerLink for SimulatedController {
    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.state.lock().unwrap().released {
            return Err(Box::new(HwError::Released));
        }
        let text = String::from_utf8_lossy(frame);
        let mut out = String::new();
        for item in text.split(['\n', ';']) {
            let item = item.trim_matches('\0');
            if item.is_empty() {
                continue;
            }
            out.push_str(&self.exec(item));
        }
        if !out.is_empty() {
            let _ = self.replies.send(LinkEvent::Data {
                handle: self.handle.clone(),
                bytes: out.into_bytes(),
            });
        }
        Ok(())
    }

    fn handle(&self) -> &str {
        &self.handle
    }

    fn release(&mut self) {
        self.state.lock().unwrap().released = true;
    }
}

/// In-process ADC answering the fixed read-input-registers poll.
pub struct SimulatedAdc {
    connected: bool,
    counts: Arc<Mutex<[u16; 8]>>,
    events: Sender<AdcEvent>,
}

#[derive(Clone)]
pub struct SimAdcProbe(Arc<Mutex<[u16; 8]>>);

impl SimAdcProbe {
    pub fn set_counts(&self, counts: [u16; 8]) {
        *self.0.lock().unwrap() = counts;
    }
}

impl SimulatedAdc {
    pub fn new(events: Sender<AdcEvent>) -> (Self, SimAdcProbe) {
        let counts = Arc::new(Mutex::new([0u16; 8]));
        (
            Self {
                connected: false,
                counts: counts.clone(),
                events,
            },
            SimAdcProbe(counts),
        )
    }
}

impl AdcTransport for SimulatedAdc {
    fn connect(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        self.connected = true;
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.connected {
            return Err(Box::new(HwError::NotConnected));
        }
        // Only the read-input-registers poll is understood.
        if frame.len() != 12 || frame[7] != 0x04 {
            return Ok(());
        }
        let counts = *self.counts.lock().unwrap();
        let mut resp = vec![0u8; 25];
        resp[..2].copy_from_slice(&frame[..2]); // txn echo
        resp[5] = 19; // remaining length
        resp[6] = 0x01; // unit
        resp[7] = 0x04; // function
        resp[8] = 16; // byte count
        for (i, c) in counts.iter().enumerate() {
            resp[9 + 2 * i..11 + 2 * i].copy_from_slice(&c.to_be_bytes());
        }
        let _ = self.events.send(AdcEvent::Frame(resp));
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn sim() -> (
        SimulatedController,
        SimProbe,
        crossbeam_channel::Receiver<LinkEvent>,
    ) {
        let (tx, rx) = unbounded();
        let (c, probe) = SimulatedController::new("sim0", "cafef00d", tx);
        (c, probe, rx)
    }

    fn reply(rx: &crossbeam_channel::Receiver<LinkEvent>) -> String {
        match rx.try_recv().unwrap() {
            LinkEvent::Data { bytes, .. } => String::from_utf8(bytes).unwrap(),
            _ => panic!("expected data event"),
        }
    }

    #[test]
    fn discovery_reports_serial_and_version() {
        let (mut c, _p, rx) = sim();
        c.send(b"a.ser;b.ver\n").unwrap();
        assert_eq!(
            reply(&rx),
            "a.OK cafef00d\nb.OK Version 1.08 (CUTE)\n"
        );
    }

    #[test]
    fn motor_poll_reflects_ramp_and_dir() {
        let (mut c, _p, rx) = sim();
        c.send(b"c.m0 dir 1;c.m0 ramp 200\n").unwrap();
        let _ = reply(&rx);
        c.send(b"f.m0\n").unwrap();
        assert_eq!(reply(&rx), "f.OK m0 SPD=+200 POS=0\n");
        c.send(b"c.m0 dir 0;c.m0 ramp 50\n").unwrap();
        let _ = reply(&rx);
        c.send(b"f.m0\n").unwrap();
        assert_eq!(reply(&rx), "f.OK m0 SPD=-50 POS=0\n");
    }

    #[test]
    fn gpio_range_read_matches_switch_bits() {
        let (mut c, p, rx) = sim();
        p.set_switches(['1', '0', '1', '1', '1', '1']);
        c.send(b"g.pa0-5\n").unwrap();
        assert_eq!(reply(&rx), "g.OK pa0-5 VAL=101111\n");
    }

    #[test]
    fn unknown_command_is_bad() {
        let (mut c, _p, rx) = sim();
        c.send(b"e.frobnicate\n").unwrap();
        assert_eq!(reply(&rx), "e.BAD unknown cmd\n");
    }

    #[test]
    fn wdt_enable_and_disable() {
        let (mut c, p, rx) = sim();
        c.send(b"c.wdt 1\n").unwrap();
        assert_eq!(reply(&rx), "c.OK WDT set to 1 seconds\n");
        assert_eq!(p.wdt_secs(), 1);
        c.send(b"z.wdt 0\n").unwrap();
        assert_eq!(reply(&rx), "z.OK WDT disabled\n");
        assert_eq!(p.wdt_secs(), 0);
    }

    #[test]
    fn halt_stops_all_motors() {
        let (mut c, p, rx) = sim();
        c.send(b"c.m1 dir 1;c.m1 ramp 1000;c.halt\n").unwrap();
        assert_eq!(reply(&rx), "c.OK\nc.OK\nc.OK HALTED\n");
        assert_eq!(p.motor_speed(1), 0);
    }
}
