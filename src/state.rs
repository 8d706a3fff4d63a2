//! Device state machine types.
//!
//! The device has one authoritative state variable shared across the input
//! worker, the message dispatcher, and the transport event handler. It is
//! stored in a [`StateCell`] so every transition is an atomic swap — there is
//! no window where two contexts observe a half-written state. The transitions
//! themselves are still not mutually serialized across contexts; the
//! consistency repair in the input arbiter reconciles the races that remain.

use std::sync::atomic::{AtomicU8, Ordering};

/// The device-level conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// No active session (boot, connection lost, or session ended).
    Unknown = 0,
    /// Connected with a valid session, ready for input.
    Idle = 1,
    /// Microphone streaming to the server.
    Listening = 2,
    /// Receiving and playing synthesized speech.
    Speaking = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Idle,
            2 => Self::Listening,
            3 => Self::Speaking,
            _ => Self::Unknown,
        }
    }
}

/// Atomically swapped container for the current [`DeviceState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell starting in [`DeviceState::Unknown`].
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(DeviceState::Unknown as u8))
    }

    /// Current state.
    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Replace the state, returning the previous one.
    pub fn set(&self, state: DeviceState) -> DeviceState {
        let prev = DeviceState::from_u8(self.0.swap(state as u8, Ordering::SeqCst));
        if prev != state {
            tracing::debug!("device state {prev:?} -> {state:?}");
        }
        prev
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn starts_unknown() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), DeviceState::Unknown);
    }

    #[test]
    fn set_returns_previous() {
        let cell = StateCell::new();
        assert_eq!(cell.set(DeviceState::Idle), DeviceState::Unknown);
        assert_eq!(cell.set(DeviceState::Listening), DeviceState::Idle);
        assert_eq!(cell.get(), DeviceState::Listening);
    }

    #[test]
    fn from_u8_out_of_range_is_unknown() {
        assert_eq!(DeviceState::from_u8(42), DeviceState::Unknown);
    }
}
