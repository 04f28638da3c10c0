//! Packet identifier lines for the two acknowledged delivery grades.
//!
//! Requirements from the MQTT specification:
//! - [MQTT-2.3.1-2] a new packet must get a currently unused identifier
//! - [MQTT-2.3.1-3] a re-sent packet must keep its original identifier
//!
//! The two lines draw from disjoint identifier ranges so that persistence
//! keys derived from an identifier can never collide, and both stay clear of
//! the reserved subscription identifier. `assign` blocks once the configured
//! number of exchanges is in flight, which is what bounds memory and
//! persistence growth under a burst of concurrent publishers.

use std::collections::HashMap;

use linemq_core::ProtocolError;
use parking_lot::{Condvar, Mutex};

use crate::error::{ClientError, Result};

/// High bits of at-least-once packet identifiers.
pub(crate) const AT_LEAST_ONCE_BASE: u16 = 0x8000;
/// High bits of exactly-once packet identifiers.
pub(crate) const EXACTLY_ONCE_BASE: u16 = 0x4000;

/// Identifiers cycle through the low 14 bits of their range.
const SEQ_MASK: u16 = 0x3FFF;

/// Largest in-flight capacity either line accepts.
pub(crate) const LINE_MAX: usize = SEQ_MASK as usize + 1;

/// Outbound exactly-once exchange states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qos2State {
    /// PUBLISH written, awaiting PUBREC.
    Sent,
    /// PUBREC received, PUBREL replaces the stored PUBLISH.
    Released,
}

struct LineState<S> {
    in_flight: HashMap<u16, S>,
    next_seq: u16,
    closed: bool,
}

struct Line<S> {
    base: u16,
    limit: usize,
    state: Mutex<LineState<S>>,
    vacancy: Condvar,
}

impl<S: Copy> Line<S> {
    fn new(base: u16, limit: usize) -> Self {
        Self {
            base,
            limit: limit.clamp(1, LINE_MAX),
            state: Mutex::new(LineState {
                in_flight: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            vacancy: Condvar::new(),
        }
    }

    /// Block until an identifier is free, then mark it in flight as `init`.
    fn assign(&self, init: S) -> Result<u16> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(ClientError::Closed);
            }
            if state.in_flight.len() < self.limit {
                break;
            }
            self.vacancy.wait(&mut state);
        }

        let id = loop {
            let id = self.base | (state.next_seq & SEQ_MASK);
            state.next_seq = state.next_seq.wrapping_add(1);
            if !state.in_flight.contains_key(&id) {
                break id;
            }
        };
        state.in_flight.insert(id, init);
        Ok(id)
    }

    /// Re-register an identifier found in persistence, e.g. after a restart.
    /// Capacity is exceeded on purpose; the entry is already durable.
    fn restore(&self, id: u16, init: S) {
        self.state.lock().in_flight.entry(id).or_insert(init);
    }

    /// Take back a just-assigned identifier whose publish never started.
    fn rollback(&self, id: u16) {
        let mut state = self.state.lock();
        if state.in_flight.remove(&id).is_some() {
            self.vacancy.notify_one();
        }
    }

    /// Fail every blocked and future `assign` with `Closed`.
    fn close(&self) {
        self.state.lock().closed = true;
        self.vacancy.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// Identifier line for outbound at-least-once publishes.
pub(crate) struct AtLeastOnceLine {
    line: Line<()>,
}

impl AtLeastOnceLine {
    pub fn new(limit: usize) -> Self {
        Self {
            line: Line::new(AT_LEAST_ONCE_BASE, limit),
        }
    }

    pub fn assign(&self) -> Result<u16> {
        self.line.assign(())
    }

    /// Release `id` on its PUBACK.
    pub fn free(&self, id: u16) -> Result<()> {
        let mut state = self.line.state.lock();
        if state.in_flight.remove(&id).is_none() {
            return Err(ProtocolError::PacketIdUnknown(id).into());
        }
        self.line.vacancy.notify_one();
        Ok(())
    }

    pub fn restore(&self, id: u16) {
        self.line.restore(id, ());
    }

    pub fn rollback(&self, id: u16) {
        self.line.rollback(id);
    }

    pub fn close(&self) {
        self.line.close();
    }

    pub fn len(&self) -> usize {
        self.line.len()
    }
}

/// Identifier line for outbound exactly-once publishes.
pub(crate) struct ExactlyOnceLine {
    line: Line<Qos2State>,
}

impl ExactlyOnceLine {
    pub fn new(limit: usize) -> Self {
        Self {
            line: Line::new(EXACTLY_ONCE_BASE, limit),
        }
    }

    pub fn assign(&self) -> Result<u16> {
        self.line.assign(Qos2State::Sent)
    }

    /// Transition SENT to RELEASED on PUBREC.
    pub fn release(&self, id: u16) -> Result<()> {
        let mut state = self.line.state.lock();
        match state.in_flight.get_mut(&id) {
            None => Err(ProtocolError::PacketIdUnknown(id).into()),
            Some(s @ Qos2State::Sent) => {
                *s = Qos2State::Released;
                Ok(())
            }
            Some(Qos2State::Released) => Err(ProtocolError::PacketIdOutOfOrder(id).into()),
        }
    }

    /// Release `id` on its PUBCOMP; only legal from RELEASED.
    pub fn free(&self, id: u16) -> Result<()> {
        let mut state = self.line.state.lock();
        match state.in_flight.get(&id) {
            None => return Err(ProtocolError::PacketIdUnknown(id).into()),
            Some(Qos2State::Sent) => return Err(ProtocolError::PacketIdOutOfOrder(id).into()),
            Some(Qos2State::Released) => {}
        }
        state.in_flight.remove(&id);
        self.line.vacancy.notify_one();
        Ok(())
    }

    pub fn restore_sent(&self, id: u16) {
        self.line.restore(id, Qos2State::Sent);
    }

    pub fn restore_released(&self, id: u16) {
        self.line.restore(id, Qos2State::Released);
    }

    pub fn rollback(&self, id: u16) {
        self.line.rollback(id);
    }

    pub fn close(&self) {
        self.line.close();
    }

    pub fn len(&self) -> usize {
        self.line.len()
    }
}
