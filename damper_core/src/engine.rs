//! The control and coordination engine.
//!
//! One engine value owns every piece of mutable state (slot table, motor
//! shadow, ADC state machine, history ring, observer list, activation flag)
//! and consumes a single stream of events: scheduler ticks, ADC frames,
//! controller data, observer traffic, shutdown. Feeding all completions
//! through one consumer makes the handlers mutually exclusive without any
//! locking.

use std::sync::Arc;

use crossbeam_channel::Sender;
use damper_traits::{AdcTransport, Clock, ControllerLink, MonotonicClock, TimeBase};
use tracing::{debug, info, warn};

use crate::adc::{AdcClient, AdcState};
use crate::calib::{self, CalibTable, Geometry, Physical};
use crate::codec::{self, ResponseLine};
use crate::control::{Activation, AxisInput, ControlParams, decide_axis};
use crate::error::{BuildError, Result};
use crate::eventlog::EventLog;
use crate::history::HistoryRing;
use crate::motor::{self, MotorPlane, NUM_MOTORS};
use crate::observer::{self, Command, Observer, ObserverId, OutMsg};
use crate::registry::{IdentifyOutcome, Liveness, MOTOR_SLOT, NUM_ROLE_SLOTS, Registry};
use crate::safety::{self, LimitSwitches, MalformedPoll, NUM_LIMIT};

/// Everything that can happen to the engine.
pub enum Event {
    Tick,
    AdcFrame(Vec<u8>),
    AdcClosed,
    ControllerAttached(Box<dyn ControllerLink + Send>),
    ControllerData { handle: String, bytes: Vec<u8> },
    ControllerGone { handle: String },
    ObserverConnected {
        id: ObserverId,
        addr: String,
        tx: Sender<String>,
    },
    ObserverLine { id: ObserverId, line: String },
    ObserverClosed { id: ObserverId },
    Shutdown,
}

/// Engine constants beyond the control envelope.
#[derive(Debug, Clone)]
pub struct EngineCfg {
    pub control: ControlParams,
    pub geometry: Geometry,
    /// Nominal per-damper load (kg).
    pub load_nom: f64,
    /// Load response to stage-minus-damper compression (kg/mm).
    pub force_const: f64,
    pub steps_per_mm: f64,
    pub motor_tol_mm: f64,
    pub max_bad_polls: u32,
    pub tick_ms: u64,
    /// Observer command allow-list ("*" wildcard).
    pub allow: Vec<String>,
    /// Heartbeat LED pin on controller 0.
    pub led_pin: u8,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            control: ControlParams::default(),
            geometry: Geometry::default(),
            load_nom: 45.0,
            force_const: 10.0,
            steps_per_mm: 1000.0,
            motor_tol_mm: 0.5,
            max_bad_polls: 3,
            tick_ms: 80,
            allow: vec!["*".into()],
            led_pin: 49,
        }
    }
}

pub struct Engine {
    cfg: EngineCfg,
    calib: CalibTable,
    /// History time is wall-clock seconds, anchored to the monotonic clock.
    time: TimeBase,

    registry: Registry,
    adc: AdcClient,
    raw: Option<[u16; 8]>,
    phys: Option<Physical>,
    motors: MotorPlane,
    switches: LimitSwitches,
    active: Activation,
    bad_polls: u32,
    full_poll: bool,
    history: HistoryRing,
    observers: Vec<Observer>,
    eventlog: EventLog,
    last_speeds: Option<[i32; NUM_MOTORS]>,
    last_sample_t: u64,
    last_filelog_min: u64,
    led_on: bool,
    led_last_s: u64,
    shutdown: bool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    // ----- accessors (observability for the binary and tests) -----

    pub fn activation(&self) -> Activation {
        self.active
    }

    pub fn adc_state(&self) -> AdcState {
        self.adc.state()
    }

    pub fn bad_polls(&self) -> u32 {
        self.bad_polls
    }

    pub fn found_count(&self) -> usize {
        self.registry.found_count()
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    pub fn switches(&self) -> &LimitSwitches {
        &self.switches
    }

    pub fn motor_target(&self, n: usize) -> i32 {
        self.motors.motor(n).target_sps
    }

    pub fn physical(&self) -> Option<&Physical> {
        self.phys.as_ref()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    // ----- event dispatch -----

    pub fn handle(&mut self, ev: Event) {
        match ev {
            Event::Tick => self.on_tick(),
            Event::AdcFrame(f) => self.on_adc_frame(&f),
            Event::AdcClosed => self.adc.on_closed(),
            Event::ControllerAttached(link) => self.on_attach(link),
            Event::ControllerData { handle, bytes } => self.on_controller_data(&handle, &bytes),
            Event::ControllerGone { handle } => self.on_detach(&handle),
            Event::ObserverConnected { id, addr, tx } => self.on_observer_connected(id, addr, tx),
            Event::ObserverLine { id, line } => self.on_observer_line(id, &line),
            Event::ObserverClosed { id } => self.on_observer_closed(id),
            Event::Shutdown => self.on_shutdown(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.time.now_unix_ms()
    }

    /// Event log: stamp, append to the monthly file, echo, fan out.
    fn log(&self, text: &str) {
        let line = self.eventlog.log_to_file(text);
        self.broadcast(&OutMsg::Console(line));
    }

    fn broadcast(&self, msg: &OutMsg) {
        for o in &self.observers {
            o.send(msg);
        }
    }

    // ----- scheduler tick (fixed cadence) -----

    fn on_tick(&mut self) {
        self.full_poll = !self.full_poll;
        let now_ms = self.now_ms();

        // 1. With the ADC down, keep the history dense and tell observers;
        //    reconnect when the socket is gone.
        if !self.adc.is_ok() {
            if self.full_poll {
                let t = self.history.add(now_ms, 0, &[]);
                self.broadcast(&OutMsg::Live { t, vals: None });
            }
            self.adc.ensure_connected();
        }

        // 2. Bad-poll accounting: deactivate after too many in a row.
        let bad = if !self.adc.is_ok() {
            Some("ADAM")
        } else if !self.registry.motor_slot_present()
            || !self.registry.slot(MOTOR_SLOT).is_some_and(|s| s.poll_acked)
        {
            Some("AVR0")
        } else {
            None
        };
        if let Some(who) = bad {
            self.bad_polls += 1;
            if self.active.is_active() && self.bad_polls >= self.cfg.max_bad_polls {
                self.log(&format!("deactivating: {who} not responding"));
                self.deactivate();
            }
        } else {
            self.bad_polls = 0;
        }

        // 3. Drive the ADC request cycle.
        if self.adc.tick_send() {
            self.log("ADAM not responding");
        }

        // 4. Poll every occupied controller slot.
        for idx in self.registry.occupied_indices() {
            if let Some(slot) = self.registry.slot_mut(idx) {
                slot.poll_acked = false;
            }
            let limit_range = format!("pa0-{}", NUM_LIMIT - 1);
            let frame = match idx {
                MOTOR_SLOT => codec::encode(&[
                    ('f', "m0"),
                    ('f', "m1"),
                    ('f', "m2"),
                    ('g', limit_range.as_str()),
                ]),
                i if i < NUM_ROLE_SLOTS => codec::encode(&[('c', "nop")]),
                _ => codec::encode(&[('a', "ser"), ('b', "ver")]),
            };
            self.send_to_slot(idx, &frame);
        }

        // Heartbeat LED on controller 0, at most one change per second.
        let now_s = now_ms / 1000;
        if self.registry.motor_slot_present() && now_s != self.led_last_s {
            self.led_last_s = now_s;
            self.led_on = !self.led_on;
            let cmd = format!("pa{} {}", self.cfg.led_pin, u8::from(self.led_on));
            let frame = codec::encode(&[('c', cmd.as_str())]);
            self.send_to_slot(MOTOR_SLOT, &frame);
        }
    }

    // ----- ADC data path -----

    fn on_adc_frame(&mut self, frame: &[u8]) {
        let was_missed = self.adc.state() == AdcState::Missed;
        let Some(raw) = self.adc.on_frame(frame) else {
            return;
        };
        if was_missed {
            self.log("ADAM OK");
        }
        self.raw = Some(raw);
        let phys = calib::derive(
            &self.calib,
            &self.cfg.geometry,
            self.cfg.load_nom,
            self.cfg.force_const,
            &raw,
        );
        self.phys = Some(phys);

        if self.full_poll {
            let vals = [
                phys.damper_mm[0],
                phys.damper_mm[1],
                phys.damper_mm[2],
                phys.add_weight_kg[0],
                phys.add_weight_kg[1],
                phys.add_weight_kg[2],
                phys.pressure_hpa,
            ];
            let t = self.history.add(self.now_ms(), 0, &vals);
            self.broadcast(&OutMsg::Live { t, vals: Some(vals) });
            self.on_second_sample(t, &phys);
        }

        if self.active.is_active() {
            self.run_control(&phys);
            if self.active == Activation::Starting {
                self.active = Activation::On;
            }
        }
    }

    /// Once per second: verbose observers get the sample as a console line,
    /// and once per minute it goes to the log file (file only).
    fn on_second_sample(&mut self, t: u64, phys: &Physical) {
        if t == self.last_sample_t {
            return;
        }
        self.last_sample_t = t;
        let line = format!(
            "sample d=[{:.2} {:.2} {:.2}] w=[{:.2} {:.2} {:.2}] p={:.2}",
            phys.damper_mm[0],
            phys.damper_mm[1],
            phys.damper_mm[2],
            phys.add_weight_kg[0],
            phys.add_weight_kg[1],
            phys.add_weight_kg[2],
            phys.pressure_hpa,
        );
        let msg = OutMsg::Console(line.clone());
        for o in self.observers.iter().filter(|o| o.verbose) {
            o.send(&msg);
        }
        if t / 60 != self.last_filelog_min {
            self.last_filelog_min = t / 60;
            self.eventlog.log_to_file(&line);
        }
    }

    fn run_control(&mut self, phys: &Physical) {
        for i in 0..NUM_MOTORS {
            let inp = AxisInput {
                pos: phys.damper_mm[i],
                load: phys.load_kg[i],
                spd: self.motors.motor(i).reported_sps,
                top_hit: self.switches.top_hit(i),
                bottom_hit: self.switches.bottom_hit(i),
                starting: self.active == Activation::Starting,
            };
            let target = decide_axis(&self.cfg.control, &inp);
            self.ramp_motor(i, target);
        }
    }

    fn ramp_motor(&mut self, n: usize, sps: i32) {
        let cmds = self.motors.plan_ramp(n, sps);
        if cmds.is_empty() {
            return;
        }
        let items: Vec<(char, &str)> = cmds.iter().map(|c| ('c', c.as_str())).collect();
        let frame = codec::encode(&items);
        self.send_to_slot(MOTOR_SLOT, &frame);
    }

    fn halt_all(&mut self) {
        let cmd = self.motors.plan_halt_all();
        let frame = codec::encode(&[('c', cmd.as_str())]);
        self.send_to_slot(MOTOR_SLOT, &frame);
    }

    // ----- controller data path -----

    fn on_attach(&mut self, link: Box<dyn ControllerLink + Send>) {
        let idx = self.registry.attach(link);
        info!(slot = idx, "controller attached");
        self.send_to_slot(idx, &codec::encode(&[('a', "ser"), ('b', "ver")]));
    }

    fn on_detach(&mut self, handle: &str) {
        match self.registry.detach_by_handle(handle) {
            Some((idx, mut slot)) => {
                slot.link.release();
                self.log(&format!("controller detached (slot {idx})"));
            }
            None => warn!(%handle, "detach for unknown device"),
        }
    }

    fn on_controller_data(&mut self, handle: &str, bytes: &[u8]) {
        let Some(idx) = self.registry.slot_by_handle(handle) else {
            debug!(%handle, "data from unknown device");
            return;
        };
        let lines = match self.registry.slot_mut(idx) {
            Some(slot) => slot.rx.push(bytes),
            None => return,
        };
        for line in lines {
            match codec::parse_line(&line) {
                ResponseLine::Reply { id, ok, body } => self.on_reply(idx, id, ok, &body),
                ResponseLine::Continuation(text) => self.route_operator_echo(idx, &text),
            }
        }
    }

    fn on_reply(&mut self, idx: usize, id: char, ok: bool, body: &str) {
        if let Some(slot) = self.registry.slot_mut(idx) {
            slot.poll_acked = true;
            if slot.liveness == Liveness::Absent {
                slot.liveness = Liveness::UnknownSerial;
            }
        }
        if !ok {
            // Device-side error: logged, but the device is alive.
            self.log(&format!("AVR{idx} error: {body}"));
            return;
        }
        match id {
            'a' => self.on_serial(idx, body.trim()),
            'b' => self.on_version(idx, body),
            'c' | 'd' => {}
            'e' => self.route_operator_echo(idx, body),
            'f' => self.on_motor_feedback(idx, body),
            'g' => self.on_limit_poll(idx, body),
            'z' => self.on_wdt_ack(idx),
            other => warn!(id = %other, "unknown response class"),
        }
    }

    fn on_serial(&mut self, idx: usize, serial: &str) {
        match self.registry.identify(idx, serial) {
            IdentifyOutcome::Role(role) => {
                self.log(&format!("AVR{role} found (serial {serial})"));
                self.setup_role_slot(role);
            }
            IdentifyOutcome::Duplicate { role } => {
                self.log(&format!(
                    "error: duplicate controller for slot {role} (serial {serial})"
                ));
                self.setup_role_slot(role);
            }
            IdentifyOutcome::Foreign => {
                let pending = self
                    .registry
                    .slot(idx)
                    .is_none_or(|s| s.forget_pending);
                if !pending {
                    self.log(&format!(
                        "unknown controller serial {serial}; disabling its watchdog"
                    ));
                    if let Some(slot) = self.registry.slot_mut(idx) {
                        slot.forget_pending = true;
                    }
                    self.send_to_slot(idx, &codec::encode(&[('z', "wdt 0")]));
                }
            }
        }
    }

    fn on_version(&mut self, idx: usize, body: &str) {
        let logged = self.registry.slot(idx).is_none_or(|s| s.version_logged);
        if !logged {
            if let Some(slot) = self.registry.slot_mut(idx) {
                slot.version_logged = true;
            }
            self.log(&format!("AVR{idx}: {body}"));
        }
    }

    /// Watchdog on for identified controllers; slot 0 also gets limit-switch
    /// pull-ups and motor on-signal polarity.
    fn setup_role_slot(&mut self, role: usize) {
        let frame = if role == MOTOR_SLOT {
            let pullups = format!("pa0-{} {}", NUM_LIMIT - 1, "+".repeat(NUM_LIMIT));
            codec::encode(&[
                ('c', "wdt 1"),
                ('c', pullups.as_str()),
                ('c', "m0 on +"),
                ('c', "m1 on +"),
                ('c', "m2 on +"),
            ])
        } else {
            codec::encode(&[('c', "wdt 1")])
        };
        self.send_to_slot(role, &frame);
    }

    fn on_motor_feedback(&mut self, idx: usize, body: &str) {
        if idx != MOTOR_SLOT {
            return;
        }
        let Some((n, sps, pos)) = motor::parse_feedback(body) else {
            warn!(%body, "unparseable motor feedback");
            return;
        };
        self.motors.note_feedback(n, sps, pos);

        // Position-consistency interlock: the device's step counter must
        // track the measured stage position.
        if self.active.is_active()
            && let (Some(p), Some(phys)) = (pos, self.phys.as_ref())
            && !safety::position_consistent(
                self.cfg.steps_per_mm,
                self.cfg.motor_tol_mm,
                p,
                phys.stage_mm[n],
            )
        {
            self.log(&format!(
                "motor {n} position disagrees with stage; deactivating"
            ));
            self.deactivate();
        }

        if n == NUM_MOTORS - 1 && self.full_poll {
            let speeds = self.motors.reported_speeds();
            if self.last_speeds != Some(speeds) {
                self.last_speeds = Some(speeds);
                self.broadcast(&OutMsg::Speeds(speeds));
            }
        }
    }

    fn on_limit_poll(&mut self, idx: usize, body: &str) {
        if idx != MOTOR_SLOT {
            return;
        }
        match self.switches.update_from_poll(body) {
            Ok(()) => {
                for axis in 0..NUM_MOTORS {
                    let sps = self.motors.motor(axis).reported_sps;
                    if self.switches.blocks(axis, sps) {
                        let cmd = self.motors.plan_halt(axis);
                        let frame = codec::encode(&[('c', cmd.as_str())]);
                        self.send_to_slot(MOTOR_SLOT, &frame);
                        self.log(&format!("limit switch engaged; halting motor {axis}"));
                    }
                }
            }
            Err(MalformedPoll) => {
                self.log("malformed limit-switch poll; halting motors");
                self.halt_all();
            }
        }
    }

    fn on_wdt_ack(&mut self, idx: usize) {
        if self.registry.slot(idx).is_some_and(|s| s.forget_pending)
            && let Some(mut slot) = self.registry.forget(idx)
        {
            slot.link.release();
            self.log(&format!("released unknown controller (slot {idx})"));
        }
    }

    /// Operator echo (`e.` replies and their continuation lines) goes back
    /// to the observer that issued the command, or to everyone if it left.
    fn route_operator_echo(&mut self, idx: usize, text: &str) {
        let op = self.registry.slot(idx).and_then(|s| s.last_operator);
        let msg = OutMsg::Console(format!("AVR{idx}: {text}"));
        match op.and_then(|id| self.observers.iter().find(|o| o.id == id)) {
            Some(o) => o.send(&msg),
            None => self.broadcast(&msg),
        }
    }

    /// Send a frame to a slot; a transport error forgets the device.
    fn send_to_slot(&mut self, idx: usize, frame: &str) -> bool {
        let Some(slot) = self.registry.slot_mut(idx) else {
            return false;
        };
        match slot.link.send(frame.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                if let Some(mut slot) = self.registry.forget(idx) {
                    slot.link.release();
                }
                self.log(&format!("send to AVR{idx} failed ({e}); dropping it"));
                false
            }
        }
    }

    // ----- activation -----

    fn activate(&mut self, mode: Activation) -> std::result::Result<(), String> {
        if self.active.is_active() {
            return Err("already active".into());
        }
        if !self.registry.motor_slot_present() {
            return Err("controller 0 not present".into());
        }
        let Some(phys) = self.phys else {
            return Err("no ADC data yet".into());
        };
        for i in 0..NUM_MOTORS {
            let steps = (phys.stage_mm[i] * self.cfg.steps_per_mm).floor() as i64;
            let cmds = self.motors.plan_activate(i, steps);
            let items: Vec<(char, &str)> = cmds.iter().map(|c| ('c', c.as_str())).collect();
            let frame = codec::encode(&items);
            self.send_to_slot(MOTOR_SLOT, &frame);
        }
        self.bad_polls = 0;
        self.active = mode;
        self.broadcast(&OutMsg::Active(true));
        self.log("control activated");
        Ok(())
    }

    fn deactivate(&mut self) {
        if !self.active.is_active() {
            return;
        }
        self.active = Activation::Off;
        self.halt_all();
        self.broadcast(&OutMsg::Active(false));
    }

    // ----- observers -----

    fn on_observer_connected(&mut self, id: ObserverId, addr: String, tx: Sender<String>) {
        let authorized = observer::is_allowed(&addr, &self.cfg.allow);
        let obs = Observer::new(id, addr.clone(), authorized, tx);
        obs.send(&OutMsg::Console(format!(
            "damper control server v{}; send 'help' for commands",
            env!("CARGO_PKG_VERSION")
        )));
        obs.send(&OutMsg::Active(self.active.is_active()));
        obs.send(&OutMsg::Speeds(self.motors.reported_speeds()));
        for (seq, vals) in self.history.replay() {
            obs.send(&OutMsg::History { seq, vals });
        }
        info!(%addr, authorized, "observer connected");
        self.observers.push(obs);
    }

    fn on_observer_closed(&mut self, id: ObserverId) {
        if let Some(pos) = self.observers.iter().position(|o| o.id == id) {
            let obs = self.observers.remove(pos);
            info!(addr = %obs.addr, "observer disconnected");
        }
    }

    fn on_observer_line(&mut self, id: ObserverId, line: &str) {
        let Some(pos) = self.observers.iter().position(|o| o.id == id) else {
            return;
        };
        if !self.observers[pos].authorized {
            self.reply(pos, "not authorized".into());
            return;
        }
        match observer::parse_command(line) {
            Err(msg) => self.reply(pos, msg),
            Ok(cmd) => self.exec_command(pos, cmd),
        }
    }

    fn reply(&self, pos: usize, text: String) {
        self.observers[pos].send(&OutMsg::Console(text));
    }

    fn exec_command(&mut self, pos: usize, cmd: Command) {
        use observer::ActiveArg;
        match cmd {
            Command::Help => {
                self.reply(
                    pos,
                    "commands: help, active [on|off|start], cal, list, log <msg>, \
                     name [who], verbose [on|off], who, avrN <raw>"
                        .into(),
                );
            }
            Command::Active(None) => {
                let state = match self.active {
                    Activation::Off => "off",
                    Activation::On => "on",
                    Activation::Starting => "starting",
                };
                self.reply(pos, format!("active: {state}"));
            }
            Command::Active(Some(arg)) => match arg {
                ActiveArg::Off => {
                    if self.active.is_active() {
                        let who = self.observers[pos].name.clone();
                        self.deactivate();
                        self.log(&format!("control deactivated by {who}"));
                    } else {
                        self.reply(pos, "already off".into());
                    }
                }
                ActiveArg::On | ActiveArg::Start => {
                    let mode = if arg == ActiveArg::Start {
                        Activation::Starting
                    } else {
                        Activation::On
                    };
                    if let Err(msg) = self.activate(mode) {
                        self.reply(pos, format!("cannot activate: {msg}"));
                    }
                }
            },
            Command::Cal => match &self.phys {
                Some(p) => {
                    self.reply(
                        pos,
                        format!(
                            "damper [{:.2} {:.2} {:.2}] mm",
                            p.damper_mm[0], p.damper_mm[1], p.damper_mm[2]
                        ),
                    );
                    self.reply(
                        pos,
                        format!(
                            "stage [{:.2} {:.2} {:.2}] mm",
                            p.stage_mm[0], p.stage_mm[1], p.stage_mm[2]
                        ),
                    );
                    self.reply(
                        pos,
                        format!(
                            "load [{:.2} {:.2} {:.2}] kg, add [{:.2} {:.2} {:.2}] kg",
                            p.load_kg[0],
                            p.load_kg[1],
                            p.load_kg[2],
                            p.add_weight_kg[0],
                            p.add_weight_kg[1],
                            p.add_weight_kg[2]
                        ),
                    );
                    self.reply(pos, format!("pressure {:.2} hPa", p.pressure_hpa));
                    if let Some(raw) = self.raw {
                        self.reply(pos, format!("raw {raw:?}"));
                    }
                }
                None => self.reply(pos, "no ADC data yet".into()),
            },
            Command::List => {
                let lines: Vec<String> = self
                    .observers
                    .iter()
                    .map(|o| format!("{} ({})", o.name, o.addr))
                    .collect();
                self.reply(pos, lines.join(", "));
            }
            Command::Log(msg) => {
                let who = self.observers[pos].name.clone();
                self.log(&format!("{who}: {msg}"));
            }
            Command::Name(Some(name)) => {
                self.observers[pos].name = name.clone();
                self.reply(pos, format!("name set to {name}"));
            }
            Command::Name(None) => {
                let name = self.observers[pos].name.clone();
                self.reply(pos, format!("name: {name}"));
            }
            Command::Verbose(arg) => {
                if let Some(v) = arg {
                    self.observers[pos].verbose = v;
                }
                let v = self.observers[pos].verbose;
                self.reply(pos, format!("verbose: {}", if v { "on" } else { "off" }));
            }
            Command::Who => {
                let o = &self.observers[pos];
                self.reply(pos, format!("you are {} ({})", o.name, o.addr));
            }
            Command::Avr { slot, raw } => {
                if self.registry.slot(slot).is_none() {
                    self.reply(pos, format!("no controller in slot {slot}"));
                    return;
                }
                let id = self.observers[pos].id;
                if let Some(s) = self.registry.slot_mut(slot) {
                    s.last_operator = Some(id);
                }
                let frame = codec::encode(&[('e', raw.as_str())]);
                self.send_to_slot(slot, &frame);
            }
        }
    }

    // ----- lifecycle -----

    fn on_shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.log("shutting down");
        if self.registry.motor_slot_present() {
            self.halt_all();
        }
        for mut slot in self.registry.drain() {
            slot.link.release();
        }
        self.adc.close();
        self.shutdown = true;
    }
}

/// Builder in the validate-everything-up-front style.
#[derive(Default)]
pub struct EngineBuilder {
    cfg: Option<EngineCfg>,
    calib: Option<CalibTable>,
    adc: Option<Box<dyn AdcTransport + Send>>,
    expected_serials: Option<Vec<String>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    eventlog: Option<EventLog>,
    wall_epoch_ms: Option<u64>,
}

impl EngineBuilder {
    pub fn with_cfg(mut self, cfg: EngineCfg) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn with_calibration(mut self, calib: CalibTable) -> Self {
        self.calib = Some(calib);
        self
    }

    pub fn with_adc_transport(mut self, adc: Box<dyn AdcTransport + Send>) -> Self {
        self.adc = Some(adc);
        self
    }

    pub fn with_expected_serials(mut self, serials: Vec<String>) -> Self {
        self.expected_serials = Some(serials);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.eventlog = Some(log);
        self
    }

    /// Anchor history time for deterministic tests; defaults to the system
    /// clock at build.
    pub fn with_wall_epoch_ms(mut self, ms: u64) -> Self {
        self.wall_epoch_ms = Some(ms);
        self
    }

    pub fn try_build(self) -> Result<Engine> {
        let adc = self
            .adc
            .ok_or_else(|| eyre::Report::new(BuildError::MissingAdc))?;
        let expected = self
            .expected_serials
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSerials))?;
        if expected.len() < NUM_ROLE_SLOTS {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "expected serials must cover both role slots",
            )));
        }
        let cfg = self.cfg.unwrap_or_default();
        if cfg.control.load_min >= cfg.control.load_max {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "load_min must be < load_max",
            )));
        }
        if cfg.control.position_fast <= cfg.control.position_tol {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "position_fast must be > position_tol",
            )));
        }
        if cfg.steps_per_mm <= 0.0 || cfg.motor_tol_mm <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "steps_per_mm and motor_tol_mm must be > 0",
            )));
        }
        if cfg.tick_ms == 0 || cfg.max_bad_polls == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "tick_ms and max_bad_polls must be > 0",
            )));
        }
        let clock: Arc<dyn Clock + Send + Sync> =
            self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let time = match self.wall_epoch_ms {
            Some(ms) => TimeBase::anchored(clock, ms),
            None => TimeBase::new(clock),
        };
        Ok(Engine {
            cfg,
            calib: self.calib.unwrap_or_default(),
            time,
            registry: Registry::new(expected),
            adc: AdcClient::new(adc),
            raw: None,
            phys: None,
            motors: MotorPlane::new(),
            switches: LimitSwitches::default(),
            active: Activation::Off,
            bad_polls: 0,
            full_poll: false,
            history: HistoryRing::new(),
            observers: Vec::new(),
            eventlog: self
                .eventlog
                .unwrap_or_else(|| EventLog::new(std::env::temp_dir())),
            last_speeds: None,
            last_sample_t: 0,
            last_filelog_min: 0,
            led_on: false,
            led_last_s: 0,
            shutdown: false,
        })
    }
}
