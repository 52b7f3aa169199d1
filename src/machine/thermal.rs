//! Boiler temperature acquisition and sensor health.
//!
//! The thermocouple is sampled every 250 ms. Individual bad reads are
//! normal (SPI glitches, open-circuit blips) and are bridged with the
//! last good value; a rolling window tracks validity, and more than 50 %
//! invalid reads in the last 20 samples marks the sensor unhealthy. An
//! unhealthy sensor disables the heater — the supervisor treats it like a
//! runaway.

use log::warn;

use crate::error::SensorError;

/// Rolling health window length.
const HEALTH_WINDOW: usize = 20;
/// Plausible boiler range; readings outside are invalid.
const MIN_PLAUSIBLE_C: f32 = -20.0;
const MAX_PLAUSIBLE_C: f32 = 200.0;

pub struct BoilerSensor {
    window: [bool; HEALTH_WINDOW],
    cursor: usize,
    filled: usize,
    last_good_c: Option<f32>,
}

impl BoilerSensor {
    pub fn new() -> Self {
        Self {
            window: [true; HEALTH_WINDOW],
            cursor: 0,
            filled: 0,
            last_good_c: None,
        }
    }

    /// Record one acquisition. Returns the temperature to use for
    /// control, or `Err(Unhealthy)` once the window degrades.
    pub fn record(
        &mut self,
        reading: Result<f32, SensorError>,
    ) -> Result<f32, SensorError> {
        let valid = match reading {
            Ok(t) if t.is_finite() && (MIN_PLAUSIBLE_C..=MAX_PLAUSIBLE_C).contains(&t) => {
                self.last_good_c = Some(t);
                true
            }
            Ok(t) => {
                warn!("boiler sensor: implausible reading {t:.1} C");
                false
            }
            Err(e) => {
                warn!("boiler sensor: read failed: {e}");
                false
            }
        };

        self.window[self.cursor] = valid;
        self.cursor = (self.cursor + 1) % HEALTH_WINDOW;
        self.filled = (self.filled + 1).min(HEALTH_WINDOW);

        if !self.healthy() {
            return Err(SensorError::Unhealthy);
        }
        self.last_good_c.ok_or(SensorError::ReadFailed)
    }

    /// At most half of the window may be invalid.
    pub fn healthy(&self) -> bool {
        if self.filled < HEALTH_WINDOW {
            return true;
        }
        let invalid = self.window.iter().filter(|v| !**v).count();
        invalid * 2 <= HEALTH_WINDOW
    }

    pub fn last_temperature_c(&self) -> Option<f32> {
        self.last_good_c
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_readings_pass_through() {
        let mut s = BoilerSensor::new();
        assert_eq!(s.record(Ok(93.2)), Ok(93.2));
        assert_eq!(s.last_temperature_c(), Some(93.2));
    }

    #[test]
    fn single_bad_read_bridged_with_last_good() {
        let mut s = BoilerSensor::new();
        let _ = s.record(Ok(93.0));
        assert_eq!(s.record(Err(SensorError::ReadFailed)), Ok(93.0));
        assert!(s.healthy());
    }

    #[test]
    fn out_of_range_counts_as_invalid() {
        let mut s = BoilerSensor::new();
        let _ = s.record(Ok(93.0));
        assert_eq!(s.record(Ok(f32::NAN)), Ok(93.0));
        assert_eq!(s.record(Ok(400.0)), Ok(93.0));
    }

    #[test]
    fn majority_invalid_window_is_unhealthy() {
        let mut s = BoilerSensor::new();
        // Fill the window with alternating good/bad: 50 % invalid is
        // still healthy.
        for i in 0..HEALTH_WINDOW {
            let r = if i % 2 == 0 {
                Ok(93.0)
            } else {
                Err(SensorError::ReadFailed)
            };
            let _ = s.record(r);
        }
        assert!(s.healthy());

        // One more failure tips the window past 50 %.
        assert_eq!(
            s.record(Err(SensorError::ReadFailed)),
            Err(SensorError::Unhealthy)
        );
    }

    #[test]
    fn recovers_when_window_refills_with_good_reads() {
        let mut s = BoilerSensor::new();
        for _ in 0..HEALTH_WINDOW {
            let _ = s.record(Err(SensorError::ReadFailed));
        }
        assert!(!s.healthy());
        for _ in 0..HEALTH_WINDOW {
            let _ = s.record(Ok(92.0));
        }
        assert!(s.healthy());
        assert_eq!(s.record(Ok(92.5)), Ok(92.5));
    }
}
