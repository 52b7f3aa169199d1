//! Deterministic boiler/hydraulics plant for host-side runs.
//!
//! Implements [`MachineIo`] against a small physical model: a first-order
//! boiler, a pump head curve against a configurable puck resistance, and
//! a scale that integrates puck outflow. The simulation binary and the
//! end-to-end tests drive both nodes against this plant with a virtual
//! clock — no timers, no hardware, fully reproducible.

use crate::error::SensorError;
use crate::machine::ports::MachineIo;

/// Heater power, W.
const HEATER_W: f32 = 1_400.0;
/// Boiler thermal gain, °C per joule-ish lump.
const HEAT_GAIN: f32 = 0.0025;
/// Ambient loss coefficient, 1/s.
const LOSS_COEFF: f32 = 0.02;
const AMBIENT_C: f32 = 20.0;

/// Pump free flow, ml/s.
const PUMP_FREE_FLOW: f32 = 10.0;
/// Pump stall head, bar.
const PUMP_STALL_BAR: f32 = 15.0;
/// Pressure response rate, 1/s.
const PRESSURE_RATE: f32 = 3.0;
/// Transducer span used for the simulated ADC.
const ADC_SCALE_BAR: f32 = 20.68;
/// Tach pulses per revolution and top speed.
const PULSES_PER_REV: f32 = 2.0;
const MAX_RPM: f32 = 5_000.0;

/// The simulated machine: plant state plus pin mirror.
pub struct SimMachine {
    pub boiler_c: f32,
    pub pressure_bar: f32,
    /// Scale weight (1 g ≈ 1 ml of espresso).
    pub scale_g: f64,
    /// Hydraulic resistance of the loaded puck, bar·s²/ml².
    pub puck_resistance: f32,

    heater_on: bool,
    pump_duty: f32,
    valve_open: bool,
    alt_on: bool,
    tach_accum: f32,

    /// When set, boiler reads fail (sensor-fault scenarios).
    pub boiler_fault: bool,
    pub brew_button: bool,
    pub steam_button: bool,
}

impl SimMachine {
    pub fn new() -> Self {
        Self {
            boiler_c: AMBIENT_C,
            pressure_bar: 0.0,
            scale_g: 0.0,
            puck_resistance: 0.35,
            heater_on: false,
            pump_duty: 0.0,
            valve_open: false,
            alt_on: false,
            tach_accum: 0.0,
            boiler_fault: false,
            brew_button: false,
            steam_button: false,
        }
    }

    /// Advance the physics by `dt` seconds.
    pub fn step(&mut self, dt: f32) {
        // Boiler.
        let heat = if self.heater_on { HEATER_W * HEAT_GAIN } else { 0.0 };
        self.boiler_c += (heat - (self.boiler_c - AMBIENT_C) * LOSS_COEFF) * dt;

        // Hydraulics: duty sets the working point on the head curve; the
        // puck sets the head the flow develops.
        let duty = self.pump_duty / 100.0;
        let q_avail = (PUMP_FREE_FLOW * (1.0 - self.pressure_bar / PUMP_STALL_BAR)).max(0.0);
        let q = duty * q_avail;

        let p_target = if duty <= 0.0 {
            0.0
        } else if self.valve_open {
            self.puck_resistance * q * q
        } else {
            // Dead-headed against the closed valve.
            PUMP_STALL_BAR * duty
        };
        self.pressure_bar += (p_target - self.pressure_bar) * (PRESSURE_RATE * dt).min(1.0);
        self.pressure_bar = self.pressure_bar.clamp(0.0, PUMP_STALL_BAR);

        if self.valve_open {
            self.scale_g += f64::from(q) * f64::from(dt);
        }

        // Tach follows commanded duty.
        let rpm = duty * MAX_RPM;
        self.tach_accum += rpm / 60.0 * PULSES_PER_REV * dt;
    }

    pub fn pump_duty(&self) -> f32 {
        self.pump_duty
    }

    pub fn heater_on(&self) -> bool {
        self.heater_on
    }

    pub fn valve_open(&self) -> bool {
        self.valve_open
    }

    pub fn alt_on(&self) -> bool {
        self.alt_on
    }
}

impl MachineIo for SimMachine {
    fn heater_pin(&mut self, high: bool) {
        self.heater_on = high;
    }

    fn pump_pin(&mut self, _high: bool) {
        // The dimmed pump's authoritative demand arrives via the DAC;
        // individual PSM half-cycles are below the plant's resolution.
    }

    fn valve_pin(&mut self, high: bool) {
        self.valve_open = high;
    }

    fn alt_pin(&mut self, high: bool) {
        self.alt_on = high;
    }

    fn pump_dac_volts(&mut self, volts: f32) {
        self.pump_duty = (volts / 5.0 * 100.0).clamp(0.0, 100.0);
    }

    fn read_boiler_c(&mut self) -> Result<f32, SensorError> {
        if self.boiler_fault {
            Err(SensorError::ReadFailed)
        } else {
            Ok(self.boiler_c)
        }
    }

    fn pressure_adc(&mut self) -> u16 {
        (self.pressure_bar / ADC_SCALE_BAR * 4095.0).clamp(0.0, 4095.0) as u16
    }

    fn tach_pulses(&mut self) -> u32 {
        self.tach_accum as u32
    }

    fn brew_button_level(&mut self) -> bool {
        self.brew_button
    }

    fn steam_button_level(&mut self) -> bool {
        self.steam_button
    }
}

// ── Tests ────────────────────────────────────────────────────
