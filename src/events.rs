//! Readiness event sets and pollable object kinds.
//!
//! Readiness is modeled as a small typed bitset instead of raw integers so
//! the rest of the runtime cannot mix event bits with other numerics.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Kind of a pollable object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Network socket
    Sock,
    /// Anonymous or named pipe
    Pipe,
    /// Child process
    Proc,
}

/// A set of readiness events.
///
/// `RECV` and `SEND` are the two wait directions. `EOF` and `ERROR` are
/// delivered by the poller alongside a direction. `CLEAR` is not a readiness
/// event: it requests edge-trigger-clear semantics at registration time and
/// never appears in a delivered set.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const NONE: EventSet = EventSet(0);
    /// Receive readiness.
    pub const RECV: EventSet = EventSet(1 << 0);
    /// Send readiness.
    pub const SEND: EventSet = EventSet(1 << 1);
    /// End of stream. Sticky: converted into cached readiness on delivery.
    pub const EOF: EventSet = EventSet(1 << 2);
    /// Error condition on the object.
    pub const ERROR: EventSet = EventSet(1 << 3);
    /// Registration flag requesting edge-trigger-clear mode.
    pub const CLEAR: EventSet = EventSet(1 << 4);

    /// Both wait directions.
    pub const BOTH: EventSet = EventSet(Self::RECV.0 | Self::SEND.0);

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every event in `other` is present in `self`.
    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share at least one event.
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Set difference.
    pub fn without(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;
    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

impl BitAndAssign for EventSet {
    fn bitand_assign(&mut self, rhs: EventSet) {
        self.0 &= rhs.0;
    }
}

impl Not for EventSet {
    type Output = EventSet;
    fn not(self) -> EventSet {
        // Only the defined bits participate; the complement stays in-domain.
        EventSet(!self.0 & 0x1f)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut names = Vec::new();
        for (flag, name) in [
            (Self::RECV, "RECV"),
            (Self::SEND, "SEND"),
            (Self::EOF, "EOF"),
            (Self::ERROR, "ERROR"),
            (Self::CLEAR, "CLEAR"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        f.write_str(&names.join("|"))
    }
}
