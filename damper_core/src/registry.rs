//! Controller slot table.
//!
//! Slots 0..NUM_ROLE_SLOTS are functional roles (slot 0 owns motors and
//! limit switches, slot 1 is reserved); higher slots are holding positions
//! for devices that have not yet answered `a.ser`. A device moves to its
//! role slot on the first serial response that matches the expected table,
//! and is dropped (watchdog disabled first) when the serial is unknown.

use crate::codec::LineBuffer;
use damper_traits::ControllerLink;

pub const NUM_ROLE_SLOTS: usize = 2;
/// The role slot wired to the motors and limit switches.
pub const MOTOR_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ok,
    UnknownSerial,
    Absent,
}

pub struct Slot {
    pub link: Box<dyn ControllerLink + Send>,
    pub serial: Option<String>,
    pub liveness: Liveness,
    /// Acknowledged the poll sent this tick.
    pub poll_acked: bool,
    /// Foreign device awaiting the `z` watchdog-disable acknowledge.
    pub forget_pending: bool,
    pub rx: LineBuffer,
    /// Observer that last routed an operator command here.
    pub last_operator: Option<u64>,
    /// Firmware version reported once already.
    pub version_logged: bool,
}

impl Slot {
    fn new(link: Box<dyn ControllerLink + Send>) -> Self {
        Self {
            link,
            serial: None,
            liveness: Liveness::UnknownSerial,
            poll_acked: false,
            forget_pending: false,
            rx: LineBuffer::new(),
            last_operator: None,
            version_logged: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// Device homed to (or confirmed in) its role slot.
    Role(usize),
    /// Serial matched a role slot already occupied by a different device;
    /// the stale occupant was dropped and the new device installed.
    Duplicate { role: usize },
    /// Serial not in the expected table; caller disables its watchdog and
    /// frees the slot on the `z` acknowledge.
    Foreign,
}

pub struct Registry {
    expected: Vec<String>,
    slots: Vec<Option<Slot>>,
}

impl Registry {
    pub fn new(expected: Vec<String>) -> Self {
        let mut slots = Vec::with_capacity(NUM_ROLE_SLOTS + 2);
        slots.resize_with(NUM_ROLE_SLOTS, || None);
        Self { expected, slots }
    }

    /// Place a newly attached device in a holding slot (index ≥ NUM_ROLE_SLOTS).
    pub fn attach(&mut self, link: Box<dyn ControllerLink + Send>) -> usize {
        for i in NUM_ROLE_SLOTS..self.slots.len() {
            if self.slots[i].is_none() {
                self.slots[i] = Some(Slot::new(link));
                return i;
            }
        }
        self.slots.push(Some(Slot::new(link)));
        self.slots.len() - 1
    }

    /// Handle an `a.OK <serial>` response on `slot`.
    ///
    /// `ser` is only ever polled on holding slots, so a known serial always
    /// re-homes the device from `slot` into its role slot.
    pub fn identify(&mut self, slot: usize, serial: &str) -> IdentifyOutcome {
        let Some(role) = self.expected.iter().position(|s| s == serial) else {
            if let Some(s) = self.slot_mut(slot) {
                s.liveness = Liveness::UnknownSerial;
            }
            return IdentifyOutcome::Foreign;
        };
        let duplicate = self.slots[role].is_some();
        let mut moved = match self.slots[slot].take() {
            Some(s) => s,
            None => return IdentifyOutcome::Foreign,
        };
        moved.serial = Some(serial.to_string());
        moved.liveness = Liveness::Ok;
        let stale = self.slots[role].replace(moved);
        if let Some(mut stale) = stale {
            stale.link.release();
        }
        if duplicate {
            IdentifyOutcome::Duplicate { role }
        } else {
            IdentifyOutcome::Role(role)
        }
    }

    /// Remove the slot owning `handle` (USB detach). Returns its index and
    /// the slot for the caller to release and log.
    pub fn detach_by_handle(&mut self, handle: &str) -> Option<(usize, Slot)> {
        let idx = self.slot_by_handle(handle)?;
        self.slots[idx].take().map(|s| (idx, s))
    }

    pub fn slot_by_handle(&self, handle: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.link.handle() == handle))
    }

    /// Drop a slot outright (send failure, foreign device acknowledged).
    pub fn forget(&mut self, slot: usize) -> Option<Slot> {
        self.slots.get_mut(slot)?.take()
    }

    pub fn slot(&self, i: usize) -> Option<&Slot> {
        self.slots.get(i)?.as_ref()
    }

    pub fn slot_mut(&mut self, i: usize) -> Option<&mut Slot> {
        self.slots.get_mut(i)?.as_mut()
    }

    /// Occupied role slots with a confirmed identity.
    pub fn found_count(&self) -> usize {
        self.slots[..NUM_ROLE_SLOTS]
            .iter()
            .filter(|s| s.as_ref().is_some_and(|s| s.liveness == Liveness::Ok))
            .count()
    }

    pub fn motor_slot_present(&self) -> bool {
        self.slot(MOTOR_SLOT)
            .is_some_and(|s| s.liveness == Liveness::Ok)
    }

    pub fn occupied_indices(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }

    /// Drain every slot for shutdown; caller releases the links.
    pub fn drain(&mut self) -> Vec<Slot> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}
