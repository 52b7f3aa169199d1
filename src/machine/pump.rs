//! Pump drivers: pulse-skip relay pump and phase-angle dimmed pump.
//!
//! `SimplePump` gates a relay over a long modulation window — whole
//! half-cycle bursts, fine for vibratory pumps behind a mechanical
//! bypass. `DimmedPump` owns the pressure sensor, tachometer, PSM and a
//! 0–5 V DAC reference, and routes `set_power` through the
//! [`PressureController`] so its effective mode is Power, Pressure or
//! Flow rather than raw duty.

use log::{debug, info};

use crate::link::messages::PumpModel;
use crate::machine::flow_map;
use crate::machine::ports::MachineIo;
use crate::machine::pressure::{ControlInputs, ControlMode, PressureController};
use crate::machine::sensors::{PressureSensor, RpmSensor};

/// Pulse-skip window for relay pumps.
const PUMP_CYCLE_MS: u64 = 5_000;
/// Shorter window for SSR-switched pumps.
const SSR_PUMP_CYCLE_MS: u64 = 1_000;
/// DAC full scale.
const DAC_VOLTS: f32 = 5.0;
/// Below this pressure the RPM→flow map is not trustworthy.
const PRESSURE_MIN_FOR_EST: f32 = 0.5;
/// Smoothing factor for the mapped flow estimate.
const FLOW_FILTER_ALPHA: f32 = 0.2;

// ---------------------------------------------------------------------------
// Modulators
// ---------------------------------------------------------------------------

/// Time-proportioned pulse skipping: the pump conducts for the leading
/// `duty` fraction of each window. The counter resets every window.
pub struct PulseSkipModulator {
    period_ms: u64,
    duty_pct: f32,
}

impl PulseSkipModulator {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            duty_pct: 0.0,
        }
    }

    pub fn set_duty(&mut self, duty_pct: f32) {
        self.duty_pct = duty_pct.clamp(0.0, 100.0);
    }

    pub fn output(&self, now_ms: u64) -> bool {
        let phase = now_ms % self.period_ms;
        (phase as f32) < self.duty_pct / 100.0 * self.period_ms as f32
    }
}

/// Phase-skip modulator clocked by mains zero crossings.
///
/// A Bresenham accumulator spreads conducted half-cycles evenly across
/// the duty range, so 50 % conducts every other half-cycle rather than
/// bursting.
pub struct Psm {
    duty_pct: f32,
    accumulator: f32,
}

impl Psm {
    pub fn new() -> Self {
        Self {
            duty_pct: 0.0,
            accumulator: 0.0,
        }
    }

    pub fn set_duty(&mut self, duty_pct: f32) {
        let duty = duty_pct.clamp(0.0, 100.0);
        if duty == 0.0 {
            self.accumulator = 0.0;
        }
        self.duty_pct = duty;
    }

    pub fn duty(&self) -> f32 {
        self.duty_pct
    }

    /// One mains zero crossing: conduct this half-cycle?
    pub fn on_zero_cross(&mut self) -> bool {
        self.accumulator += self.duty_pct;
        if self.accumulator >= 100.0 {
            self.accumulator -= 100.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Simple pump
// ---------------------------------------------------------------------------

/// Relay pump with pulse-skip modulation.
pub struct SimplePump {
    modulator: PulseSkipModulator,
    power_pct: f32,
    on_high: bool,
}

impl SimplePump {
    pub fn new(ssr: bool, on_high: bool) -> Self {
        let period = if ssr { SSR_PUMP_CYCLE_MS } else { PUMP_CYCLE_MS };
        Self {
            modulator: PulseSkipModulator::new(period),
            power_pct: 0.0,
            on_high,
        }
    }

    pub fn set_power(&mut self, pct: f32) {
        self.power_pct = pct.clamp(0.0, 100.0);
        self.modulator.set_duty(self.power_pct);
    }

    pub fn power(&self) -> f32 {
        self.power_pct
    }

    /// Drive the relay for this instant.
    pub fn tick(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        let on = self.power_pct > 0.0 && self.modulator.output(now_ms);
        io.pump_pin(on == self.on_high);
    }
}

// ---------------------------------------------------------------------------
// Dimmed pump
// ---------------------------------------------------------------------------

/// Phase-angle dimmed gear/vibratory pump with closed-loop control.
pub struct DimmedPump {
    psm: Psm,
    pressure_sensor: PressureSensor,
    rpm_sensor: RpmSensor,
    controller: PressureController,

    mode: ControlMode,
    power_pct: f32,
    ctrl_pressure_bar: f32,
    ctrl_flow_mlps: f32,
    valve_open: bool,

    current_pressure_bar: f32,
    estimated_flow_mlps: f32,
    pump_model: Option<PumpModel>,
}

impl DimmedPump {
    pub fn new(dt: f32) -> Self {
        Self {
            psm: Psm::new(),
            pressure_sensor: PressureSensor::new(),
            rpm_sensor: RpmSensor::new(),
            controller: PressureController::new(dt),
            mode: ControlMode::Power,
            power_pct: 0.0,
            ctrl_pressure_bar: 0.0,
            ctrl_flow_mlps: 0.0,
            valve_open: false,
            current_pressure_bar: 0.0,
            estimated_flow_mlps: 0.0,
            pump_model: None,
        }
    }

    // ── Commands ──────────────────────────────────────────────

    pub fn set_power(&mut self, pct: f32) {
        self.mode = ControlMode::Power;
        self.power_pct = pct.clamp(0.0, 100.0);
    }

    pub fn set_pressure_target(&mut self, pressure_bar: f32, flow_limit_mlps: f32) {
        self.mode = ControlMode::Pressure;
        self.ctrl_pressure_bar = pressure_bar;
        self.ctrl_flow_mlps = flow_limit_mlps;
    }

    pub fn set_flow_target(&mut self, flow_mlps: f32, pressure_limit_bar: f32) {
        self.mode = ControlMode::Flow;
        self.ctrl_flow_mlps = flow_mlps;
        self.ctrl_pressure_bar = pressure_limit_bar;
    }

    pub fn set_valve_state(&mut self, open: bool) {
        self.valve_open = open;
    }

    pub fn set_pressure_scale(&mut self, scale_bar: f32) {
        info!("pump: pressure scale {scale_bar:.2} bar");
        self.pressure_sensor.set_scale(scale_bar);
    }

    pub fn set_pump_model(&mut self, model: PumpModel) {
        info!("pump: flow model {model:?}");
        self.pump_model = Some(model);
    }

    pub fn tare(&mut self) {
        self.controller.tare();
    }

    // ── Control loop ──────────────────────────────────────────

    /// 30 ms control period: sample, estimate available flow, run the
    /// controller, apply PSM duty and DAC reference.
    pub fn control_tick(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        self.current_pressure_bar = self.pressure_sensor.read_bar(io);

        self.rpm_sensor.update(io.tach_pulses(), now_ms);
        let rpm = self.rpm_sensor.rpm();

        let mapped_mlps = self.available_flow_mlps(rpm, self.current_pressure_bar);
        low_pass_alpha(&mut self.estimated_flow_mlps, mapped_mlps, FLOW_FILTER_ALPHA);

        // The RPM map is only trustworthy under real head; a configured
        // pump model is valid from standstill.
        if self.pump_model.is_some() || self.current_pressure_bar >= PRESSURE_MIN_FOR_EST {
            self.controller.inject_available_flow(mapped_mlps);
        } else {
            self.controller.clear_available_flow();
        }

        let inputs = ControlInputs {
            raw_pressure_bar: self.current_pressure_bar,
            pressure_setpoint_bar: self.ctrl_pressure_bar,
            flow_setpoint_mlps: self.ctrl_flow_mlps,
            applied_duty_pct: self.power_pct,
            valve_open: self.valve_open,
        };
        let duty = self.controller.update(self.mode, &inputs);
        if self.mode != ControlMode::Power {
            self.power_pct = duty;
        }
        self.power_pct = self.power_pct.clamp(0.0, 100.0);

        self.psm.set_duty(self.power_pct);
        io.pump_dac_volts(DAC_VOLTS * self.power_pct / 100.0);
        debug!(
            "pump: mode={:?} duty={:.1}% p={:.2} bar",
            self.mode, self.power_pct, self.current_pressure_bar
        );
    }

    /// Mains zero-crossing: gate the next half-cycle.
    pub fn on_zero_cross(&mut self, io: &mut impl MachineIo) {
        let conduct = self.psm.on_zero_cross();
        io.pump_pin(conduct);
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn power(&self) -> f32 {
        self.power_pct
    }

    pub fn pressure_bar(&self) -> f32 {
        self.current_pressure_bar
    }

    pub fn pump_flow_mlps(&self) -> f32 {
        self.estimated_flow_mlps
    }

    pub fn puck_flow_mlps(&self) -> f32 {
        self.controller.puck_flow_mlps()
    }

    pub fn puck_resistance(&self) -> f32 {
        self.controller.puck_resistance()
    }

    pub fn coffee_volume_ml(&self) -> f32 {
        self.controller.coffee_output_ml()
    }

    // ── Internal ──────────────────────────────────────────────

    /// Available flow in ml/s: configured pump model if one was sent,
    /// else the datasheet RPM×pressure map.
    fn available_flow_mlps(&self, rpm: f32, pressure_bar: f32) -> f32 {
        if let Some(model) = &self.pump_model {
            return model_flow_ml_per_min(model, pressure_bar).max(0.0) / 60.0;
        }
        if rpm < flow_map::RPM_AXIS[0] {
            return 0.0;
        }
        flow_map::flow_ml_per_min(rpm, pressure_bar) / 60.0
    }
}

/// Evaluate a pump flow model in ml/min at the given head.
fn model_flow_ml_per_min(model: &PumpModel, pressure_bar: f32) -> f32 {
    match *model {
        PumpModel::TwoPoint {
            one_bar_flow,
            nine_bar_flow,
        } => {
            // Linear through the 1 bar and 9 bar anchor points.
            let slope = (nine_bar_flow - one_bar_flow) / 8.0;
            one_bar_flow + slope * (pressure_bar - 1.0)
        }
        PumpModel::Polynomial { a, b, c, d } => {
            let p = pressure_bar;
            a + b * p + c * p * p + d * p * p * p
        }
    }
}

/// Exponential smoothing with an explicit alpha (the control loop runs at
/// a fixed period, so a cutoff-derived alpha is overkill here).
fn low_pass_alpha(state: &mut f32, input: f32, alpha: f32) {
    *state = alpha * input + (1.0 - alpha) * *state;
}

// ---------------------------------------------------------------------------
// Pump dispatch
// ---------------------------------------------------------------------------

/// The machine has exactly one pump; variants are fixed per board.
pub enum Pump {
    Simple(SimplePump),
    Dimmed(Box<DimmedPump>),
}

impl Pump {
    /// Open-loop power command (from basic `OutputControl`).
    pub fn set_power(&mut self, pct: f32) {
        match self {
            Self::Simple(p) => p.set_power(pct),
            Self::Dimmed(p) => p.set_power(pct),
        }
    }

    pub fn power(&self) -> f32 {
        match self {
            Self::Simple(p) => p.power(),
            Self::Dimmed(p) => p.power(),
        }
    }

    pub fn as_dimmed_mut(&mut self) -> Option<&mut DimmedPump> {
        match self {
            Self::Dimmed(p) => Some(p),
            Self::Simple(_) => None,
        }
    }

    pub fn as_dimmed(&self) -> Option<&DimmedPump> {
        match self {
            Self::Dimmed(p) => Some(p),
            Self::Simple(_) => None,
        }
    }

    /// Control-loop tick. The simple pump only needs its window timer;
    /// the dimmed pump runs the full controller.
    pub fn control_tick(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        match self {
            Self::Simple(p) => p.tick(io, now_ms),
            Self::Dimmed(p) => p.control_tick(io, now_ms),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;

    struct FakeIo {
        pressure_adc: u16,
        tach: u32,
        pump_pin: bool,
        dac: f32,
    }

    impl FakeIo {
        fn new() -> Self {
            Self {
                pressure_adc: 0,
                tach: 0,
                pump_pin: false,
                dac: 0.0,
            }
        }
    }

    impl MachineIo for FakeIo {
        fn heater_pin(&mut self, _high: bool) {}
        fn pump_pin(&mut self, high: bool) {
            self.pump_pin = high;
        }
        fn valve_pin(&mut self, _high: bool) {}
        fn alt_pin(&mut self, _high: bool) {}
        fn pump_dac_volts(&mut self, volts: f32) {
            self.dac = volts;
        }
        fn read_boiler_c(&mut self) -> Result<f32, SensorError> {
            Ok(20.0)
        }
        fn pressure_adc(&mut self) -> u16 {
            self.pressure_adc
        }
        fn tach_pulses(&mut self) -> u32 {
            self.tach
        }
        fn brew_button_level(&mut self) -> bool {
            false
        }
        fn steam_button_level(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn psm_spreads_half_cycles_evenly() {
        let mut psm = Psm::new();
        psm.set_duty(30.0);
        let conducted = (0..100).filter(|_| psm.on_zero_cross()).count();
        assert!((29..=31).contains(&conducted), "got {conducted}");

        psm.set_duty(100.0);
        assert!((0..10).all(|_| psm.on_zero_cross()));

        psm.set_duty(0.0);
        assert!((0..10).all(|_| !psm.on_zero_cross()));
    }

    #[test]
    fn psm_never_bursts_at_half_duty() {
        let mut psm = Psm::new();
        psm.set_duty(50.0);
        let pattern: Vec<bool> = (0..12).map(|_| psm.on_zero_cross()).collect();
        // Alternating, not six-on six-off.
        for pair in pattern.chunks(2) {
            assert_eq!(pair.iter().filter(|c| **c).count(), 1);
        }
    }

    #[test]
    fn pulse_skip_window_proportions_time() {
        let mut m = PulseSkipModulator::new(5_000);
        m.set_duty(40.0);
        let on_ms = (0..5_000).filter(|ms| m.output(*ms)).count();
        assert_eq!(on_ms, 2_000);
    }

    #[test]
    fn simple_pump_drives_relay_with_polarity() {
        let mut io = FakeIo::new();
        let mut pump = SimplePump::new(false, true);
        pump.set_power(100.0);
        pump.tick(&mut io, 10);
        assert!(io.pump_pin);

        pump.set_power(0.0);
        pump.tick(&mut io, 20);
        assert!(!io.pump_pin);

        // Active-low wiring inverts the level.
        let mut pump = SimplePump::new(false, false);
        pump.set_power(100.0);
        pump.tick(&mut io, 30);
        assert!(!io.pump_pin);
    }

    #[test]
    fn dimmed_pump_power_mode_sets_psm_and_dac() {
        let mut io = FakeIo::new();
        let mut pump = DimmedPump::new(0.03);
        pump.set_power(60.0);
        pump.control_tick(&mut io, 30);
        assert!((pump.power() - 60.0).abs() < 1e-3);
        assert!((io.dac - 3.0).abs() < 1e-3);
        assert!((pump.psm.duty() - 60.0).abs() < 1e-3);
    }

    #[test]
    fn dimmed_pump_flow_mode_uses_mapped_flow() {
        let mut io = FakeIo::new();
        io.pressure_adc = (9.0 / 20.68 * 4095.0) as u16;

        let mut pump = DimmedPump::new(0.03);
        pump.set_valve_state(true);
        pump.set_flow_target(2.0, 12.0);

        // Spin the tach at 3000 RPM: 100 pulses per second at 2 ppr.
        let mut now = 0;
        for _ in 0..20 {
            now += 30;
            io.tach = (now / 10) as u32;
            pump.control_tick(&mut io, now);
        }
        // Map at 3000 RPM / 9 bar ≈ 544 ml/min ≈ 9.07 ml/s; demanding
        // 2 ml/s lands near 22 % duty.
        assert!(
            pump.power() > 5.0 && pump.power() < 50.0,
            "duty {}",
            pump.power()
        );
    }

    #[test]
    fn pump_model_replaces_map() {
        let mut io = FakeIo::new();
        io.pressure_adc = (9.0 / 20.68 * 4095.0) as u16;

        let mut pump = DimmedPump::new(0.03);
        pump.set_pump_model(PumpModel::TwoPoint {
            one_bar_flow: 480.0,
            nine_bar_flow: 240.0,
        });
        pump.set_flow_target(2.0, 12.0);
        pump.control_tick(&mut io, 30);
        // Model at 9 bar: 240 ml/min = 4 ml/s → 50 % duty.
        assert!((pump.power() - 50.0).abs() < 2.0, "duty {}", pump.power());
    }

    #[test]
    fn two_point_model_interpolates() {
        let model = PumpModel::TwoPoint {
            one_bar_flow: 480.0,
            nine_bar_flow: 240.0,
        };
        assert!((model_flow_ml_per_min(&model, 1.0) - 480.0).abs() < 1e-3);
        assert!((model_flow_ml_per_min(&model, 9.0) - 240.0).abs() < 1e-3);
        assert!((model_flow_ml_per_min(&model, 5.0) - 360.0).abs() < 1e-3);
    }
}
