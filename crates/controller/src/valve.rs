//! Valve driver (C2): eight solenoid outputs, exclusively owned here.
//!
//! The backend (real GPIO vs simulated) is chosen once at construction by
//! the process entry point, never by `#[cfg(...)]` branches scattered
//! through call sites — only the concrete hardware struct's *definition*
//! sits behind a feature flag.

use crate::error::{ControlError, ControlResult};

pub const NUM_CHANNELS: usize = 8;

/// Output backend for the eight valve channels. Implementations must make
/// `close_all` idempotent and infallible from the caller's point of view —
/// a backend that cannot guarantee a physical close still reports success
/// here and lets the flow monitor's anomaly detection catch the mismatch.
pub trait ValvePort: Send + Sync {
    fn open(&mut self, id: u8) -> ControlResult<()>;
    fn close(&mut self, id: u8) -> ControlResult<()>;
    fn close_all(&mut self);
    fn is_open(&self, id: u8) -> bool;
}

fn check_id(id: u8) -> ControlResult<()> {
    if (id as usize) >= NUM_CHANNELS {
        return Err(ControlError::InvalidParam(format!(
            "channel id {id} out of range (0..{NUM_CHANNELS})"
        )));
    }
    Ok(())
}

/// In-process simulated valve board. Used by default so the crate runs on
/// a developer machine with no GPIO attached; also the natural backend for
/// deterministic tests.
pub struct SimValveBoard {
    open: [bool; NUM_CHANNELS],
}

impl SimValveBoard {
    pub fn new() -> Self {
        Self {
            open: [false; NUM_CHANNELS],
        }
    }
}

impl Default for SimValveBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ValvePort for SimValveBoard {
    fn open(&mut self, id: u8) -> ControlResult<()> {
        check_id(id)?;
        self.open[id as usize] = true;
        tracing::debug!(channel = id, "sim valve opened");
        Ok(())
    }

    fn close(&mut self, id: u8) -> ControlResult<()> {
        check_id(id)?;
        self.open[id as usize] = false;
        tracing::debug!(channel = id, "sim valve closed");
        Ok(())
    }

    fn close_all(&mut self) {
        for v in self.open.iter_mut() {
            *v = false;
        }
        tracing::debug!("sim valve board: all closed");
    }

    fn is_open(&self, id: u8) -> bool {
        self.open.get(id as usize).copied().unwrap_or(false)
    }
}

/// Raspberry Pi GPIO backend. Only compiled with the `hw` feature so the
/// `rppal` dependency stays opt-in for non-Pi builds.
#[cfg(feature = "hw")]
pub struct GpioValveBoard {
    pins: Vec<rppal::gpio::OutputPin>,
}

#[cfg(feature = "hw")]
impl GpioValveBoard {
    /// `bcm_pins[i]` is the BCM GPIO number driving channel `i`.
    pub fn new(bcm_pins: [u8; NUM_CHANNELS]) -> anyhow::Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let mut pins = Vec::with_capacity(NUM_CHANNELS);
        for pin in bcm_pins {
            let mut out = gpio.get(pin)?.into_output();
            out.set_low();
            pins.push(out);
        }
        tracing::info!(pins = ?bcm_pins, "gpio valve board initialised");
        Ok(Self { pins })
    }
}

#[cfg(feature = "hw")]
impl ValvePort for GpioValveBoard {
    fn open(&mut self, id: u8) -> ControlResult<()> {
        check_id(id)?;
        self.pins[id as usize].set_high();
        Ok(())
    }

    fn close(&mut self, id: u8) -> ControlResult<()> {
        check_id(id)?;
        self.pins[id as usize].set_low();
        Ok(())
    }

    fn close_all(&mut self) {
        for p in self.pins.iter_mut() {
            p.set_low();
        }
    }

    fn is_open(&self, id: u8) -> bool {
        self.pins
            .get(id as usize)
            .map(|p| p.is_set_high())
            .unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_closed_on_construction() {
        let v = SimValveBoard::new();
        for id in 0..NUM_CHANNELS as u8 {
            assert!(!v.is_open(id));
        }
    }

    #[test]
    fn open_then_close_round_trips() {
        let mut v = SimValveBoard::new();
        v.open(2).unwrap();
        assert!(v.is_open(2));
        v.close(2).unwrap();
        assert!(!v.is_open(2));
    }

    #[test]
    fn close_all_is_idempotent() {
        let mut v = SimValveBoard::new();
        v.open(0).unwrap();
        v.open(5).unwrap();
        v.close_all();
        v.close_all();
        for id in 0..NUM_CHANNELS as u8 {
            assert!(!v.is_open(id));
        }
    }

    #[test]
    fn out_of_range_channel_rejected() {
        let mut v = SimValveBoard::new();
        assert!(matches!(v.open(8), Err(ControlError::InvalidParam(_))));
    }

    #[test]
    fn at_most_one_open_is_a_caller_discipline_not_enforced_here() {
        // The single-open invariant is enforced by the executor (C5), which
        // never opens a second channel without closing the first. The
        // driver itself allows it so the monitor can detect violations.
        let mut v = SimValveBoard::new();
        v.open(0).unwrap();
        v.open(1).unwrap();
        assert!(v.is_open(0));
        assert!(v.is_open(1));
    }
}
