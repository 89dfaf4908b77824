//! HTTP/2 flow control (RFC 9113 §5.2).
//!
//! [`Window`] is the raw credit counter used for both directions.
//! [`ReceiveWindow`] adds the refill policy for windows we grant to the peer:
//! credit is handed back in one WINDOW_UPDATE once at least half of the
//! initial window has been consumed.

use thiserror::Error;

use crate::settings::MAX_WINDOW_SIZE;

/// Connection-level window; SETTINGS never changes it (RFC 9113 §6.9.2).
pub const DEFAULT_CONNECTION_WINDOW_SIZE: u32 = 65535;

/// A debit larger than the window or a credit that would pass 2^31-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flow control window violated")]
pub struct FlowControlViolation;

/// Flow control window tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Send windows can go negative when SETTINGS shrinks the initial size.
    window: i64,
}

impl Window {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
        }
    }

    /// Current available window (negative when overdrawn by SETTINGS).
    pub fn available(&self) -> i64 {
        self.window
    }

    /// Consume `n` bytes. Nothing is consumed on failure.
    pub fn debit(&mut self, n: u32) -> Result<(), FlowControlViolation> {
        if (n as i64) > self.window {
            return Err(FlowControlViolation);
        }
        self.window -= n as i64;
        Ok(())
    }

    /// Add `n` bytes back to the window.
    pub fn credit(&mut self, n: u32) -> Result<(), FlowControlViolation> {
        let new_window = self.window + n as i64;
        if new_window > MAX_WINDOW_SIZE as i64 {
            return Err(FlowControlViolation);
        }
        self.window = new_window;
        Ok(())
    }

    /// Shift the window by the change in SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn adjust(&mut self, delta: i64) -> Result<(), FlowControlViolation> {
        let new_window = self.window + delta;
        if new_window > MAX_WINDOW_SIZE as i64 {
            return Err(FlowControlViolation);
        }
        self.window = new_window;
        Ok(())
    }
}

/// A window we advertise to the peer, with batched replenishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    initial: u32,
    window: Window,
}

impl ReceiveWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            window: Window::new(initial),
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> i64 {
        self.window.available()
    }

    /// Account for `n` received payload bytes.
    pub fn consume(&mut self, n: u32) -> Result<(), FlowControlViolation> {
        self.window.debit(n)
    }

    /// If at least half of the initial window is used up, restore it fully and
    /// return the increment to announce in a WINDOW_UPDATE.
    pub fn reclaim(&mut self) -> Option<u32> {
        let reclaimable = self.initial as i64 - self.window.available();
        if reclaimable <= 0 || reclaimable < (self.initial / 2) as i64 {
            return None;
        }
        let amount = reclaimable as u32;
        self.window.credit(amount).ok()?;
        Some(amount)
    }
}
