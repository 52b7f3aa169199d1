//! Hardware port trait — the boundary between control logic and pins.
//!
//! One `Hardware` value implements this trait and is passed by reference
//! into every tick; there are no process-wide singletons. Pin polarity is
//! a logic concern (see [`Relay`](crate::machine::supervisor::Relay)), so
//! the port deals in raw levels.

use crate::error::SensorError;

/// Everything the machine node touches on the board.
pub trait MachineIo {
    // ── Actuator pins (raw levels) ────────────────────────────

    fn heater_pin(&mut self, high: bool);

    /// Pump drive pin: pulse-skip relay or PSM-gated SSR.
    fn pump_pin(&mut self, high: bool);

    fn valve_pin(&mut self, high: bool);

    fn alt_pin(&mut self, high: bool);

    /// Analogue pump reference (DAC), 0–5 V.
    fn pump_dac_volts(&mut self, volts: f32);

    // ── Sensors ───────────────────────────────────────────────

    /// Boiler thermocouple, °C.
    fn read_boiler_c(&mut self) -> Result<f32, SensorError>;

    /// Pressure transducer, raw 12-bit ADC count.
    fn pressure_adc(&mut self) -> u16;

    /// Cumulative pump tach edge count.
    fn tach_pulses(&mut self) -> u32;

    // ── Inputs ────────────────────────────────────────────────

    fn brew_button_level(&mut self) -> bool;

    fn steam_button_level(&mut self) -> bool;
}
