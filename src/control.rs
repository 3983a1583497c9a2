//! Runtime knobs shared between the capture loop and the serving layer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use tracing::debug;

pub const MIN_GAIN: f32 = 0.1;
pub const MAX_GAIN: f32 = 20.0;

/// Lock-free control state. Every field is a single atomic so readers on
/// other threads never see a torn value.
#[derive(Debug)]
pub struct ControlSurface {
    gain_bits: AtomicU32,
    trigger: AtomicBool,
    running: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlStatus {
    pub running: bool,
    pub digital_gain: f32,
}

impl Default for ControlSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSurface {
    pub fn new() -> Self {
        Self {
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            trigger: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Store `clamp(value, 0.1, 20.0)`. NaN leaves the gain unchanged.
    pub fn set_gain(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.gain();
        }
        let clamped = value.clamp(MIN_GAIN, MAX_GAIN);
        self.gain_bits.store(clamped.to_bits(), Ordering::Release);
        debug!(requested = value, applied = clamped, "digital gain updated");
        clamped
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Acquire))
    }

    pub fn simulate_trigger(&self) {
        self.trigger.store(true, Ordering::Release);
    }

    /// Edge read: returns the latched trigger and clears it in one step.
    pub fn check_and_clear_io(&self) -> bool {
        self.trigger.swap(false, Ordering::AcqRel)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn status(&self) -> ControlStatus {
        ControlStatus {
            running: self.is_running(),
            digital_gain: self.gain(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_is_clamped() {
        let control = ControlSurface::new();
        for (input, expected) in [
            (-5.0, MIN_GAIN),
            (0.0, MIN_GAIN),
            (0.1, 0.1),
            (1.5, 1.5),
            (20.0, 20.0),
            (250.0, MAX_GAIN),
            (f32::INFINITY, MAX_GAIN),
            (f32::NEG_INFINITY, MIN_GAIN),
        ] {
            control.set_gain(input);
            assert_eq!(control.gain(), expected, "input {input}");
        }
    }

    #[test]
    fn nan_gain_is_ignored() {
        let control = ControlSurface::new();
        control.set_gain(3.0);
        assert_eq!(control.set_gain(f32::NAN), 3.0);
        assert_eq!(control.gain(), 3.0);
    }

    #[test]
    fn trigger_fires_once() {
        let control = ControlSurface::new();
        assert!(!control.check_and_clear_io());
        control.simulate_trigger();
        assert!(control.check_and_clear_io());
        assert!(!control.check_and_clear_io());
    }

    #[test]
    fn status_reflects_state() {
        let control = ControlSurface::new();
        assert_eq!(
            control.status(),
            ControlStatus {
                running: false,
                digital_gain: 1.0
            }
        );
        control.set_running(true);
        control.set_gain(2.5);
        assert_eq!(
            control.status(),
            ControlStatus {
                running: true,
                digital_gain: 2.5
            }
        );
    }
}
