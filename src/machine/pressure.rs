//! Cascaded pressure / flow / power controller for the dimmed pump.
//!
//! Runs at the 30 ms control period as a pure function of the latest
//! sensor snapshot: the control loop feeds it raw pressure, setpoints and
//! valve state, and takes back a pump duty. The pump is a sink — the
//! controller holds no reference to it, which keeps the ownership graph
//! acyclic.

use log::debug;

use crate::machine::estimator::{low_pass, FlowEstimator, HydraulicEstimator, Kalman};

/// Control law applied to the duty output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Open loop: duty = setpoint.
    #[default]
    Power,
    /// Regulate boiler pressure towards the pressure setpoint.
    Pressure,
    /// Feed-forward flow towards the flow setpoint.
    Flow,
}

/// Inputs sampled by the control loop each period.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlInputs {
    pub raw_pressure_bar: f32,
    pub pressure_setpoint_bar: f32,
    pub flow_setpoint_mlps: f32,
    /// Duty currently applied to the pump (percent).
    pub applied_duty_pct: f32,
    pub valve_open: bool,
}

// Controller gains and limits.
const PRESSURE_KP: f32 = 0.15;
const PRESSURE_KI: f32 = 0.05;
const INTEGRAL_LIMIT: f32 = 1.0;
const MAX_PRESSURE_BAR: f32 = 15.0;
const MIN_PRESSURE_SETPOINT: f32 = 0.2;
const MIN_AVAILABLE_FLOW: f32 = 1e-3;
const DERIVATIVE_CLAMP: f32 = 20.0;
const DERIVATIVE_FILTER_HZ: f32 = 2.0;

pub struct PressureController {
    dt: f32,

    pressure_filter: Kalman,
    filtered_pressure: f32,
    filtered_derivative: f32,
    last_filtered: f32,

    flow_estimator: FlowEstimator,
    hydraulics: HydraulicEstimator,

    pump_flow_mlps: f32,
    puck_flow_mlps: f32,
    coffee_output_ml: f32,
    puck_resistance: f32,

    error_integral: f32,

    /// RPM-map flow, injected by the pump loop when pressure is valid.
    available_flow_override: Option<f32>,
}

impl PressureController {
    pub fn new(dt: f32) -> Self {
        Self {
            dt,
            pressure_filter: Kalman::new(0.1, 10.0, dt * dt),
            filtered_pressure: 0.0,
            filtered_derivative: 0.0,
            last_filtered: 0.0,
            flow_estimator: FlowEstimator::new(dt),
            hydraulics: HydraulicEstimator::new(),
            pump_flow_mlps: 0.0,
            puck_flow_mlps: 0.0,
            coffee_output_ml: 0.0,
            puck_resistance: 0.0,
            error_integral: 0.0,
            available_flow_override: None,
        }
    }

    /// One control period. Returns the duty (percent) to apply.
    pub fn update(&mut self, mode: ControlMode, inputs: &ControlInputs) -> f32 {
        self.filter_sensor(inputs.raw_pressure_bar);

        let available_flow = self.available_flow();
        self.pump_flow_mlps = available_flow * (inputs.applied_duty_pct / 100.0);

        self.flow_estimator.update(
            self.pump_flow_mlps,
            self.filtered_pressure,
            self.filtered_derivative,
            inputs.valve_open,
        );
        self.puck_flow_mlps = self.flow_estimator.flow();
        if inputs.valve_open {
            self.coffee_output_ml += self.puck_flow_mlps * self.dt;
        }

        self.hydraulics
            .update(inputs.applied_duty_pct, inputs.raw_pressure_bar);
        if self.hydraulics.converged() {
            self.puck_resistance = self.hydraulics.resistance();
        }

        match mode {
            ControlMode::Power => inputs.applied_duty_pct.clamp(0.0, 100.0),
            ControlMode::Pressure => self.duty_for_pressure(inputs.pressure_setpoint_bar),
            ControlMode::Flow => self.duty_for_flow(inputs.flow_setpoint_mlps),
        }
    }

    /// Zero the shot accumulators before a new extraction.
    pub fn tare(&mut self) {
        debug!("pressure controller: tare");
        self.reset();
    }

    pub fn reset(&mut self) {
        self.error_integral = 0.0;
        self.coffee_output_ml = 0.0;
        self.puck_flow_mlps = 0.0;
        self.pump_flow_mlps = 0.0;
        self.puck_resistance = 0.0;
        self.flow_estimator.reset();
        self.hydraulics.reset();
    }

    /// Datasheet-map flow injection from the pump loop. Valid until
    /// [`clear_available_flow`](Self::clear_available_flow).
    pub fn inject_available_flow(&mut self, flow_mlps: f32) {
        self.available_flow_override = Some(flow_mlps.max(0.0));
    }

    pub fn clear_available_flow(&mut self) {
        self.available_flow_override = None;
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn filtered_pressure(&self) -> f32 {
        self.filtered_pressure
    }

    /// Estimated total output this shot, ml.
    pub fn coffee_output_ml(&self) -> f32 {
        self.coffee_output_ml.max(0.0)
    }

    pub fn puck_flow_mlps(&self) -> f32 {
        self.puck_flow_mlps
    }

    pub fn pump_flow_mlps(&self) -> f32 {
        self.pump_flow_mlps
    }

    pub fn puck_resistance(&self) -> f32 {
        self.puck_resistance
    }

    // ── Internal ──────────────────────────────────────────────

    fn filter_sensor(&mut self, raw_pressure: f32) {
        let filtered = self.pressure_filter.update(raw_pressure);
        let slope = ((filtered - self.last_filtered) / self.dt)
            .clamp(-DERIVATIVE_CLAMP, DERIVATIVE_CLAMP);
        low_pass(
            &mut self.filtered_derivative,
            slope,
            DERIVATIVE_FILTER_HZ,
            self.dt,
        );
        self.last_filtered = filtered;
        self.filtered_pressure = filtered;

        if self.hydraulics.converged() {
            self.filtered_pressure = self.hydraulics.pressure();
            self.filtered_derivative = (self.filtered_pressure - self.last_filtered) / self.dt;
            self.puck_resistance = self.hydraulics.resistance();
        }
    }

    fn available_flow(&self) -> f32 {
        match self.available_flow_override {
            Some(flow) => flow,
            None if self.hydraulics.converged() => {
                self.hydraulics.available_flow(self.filtered_pressure)
            }
            None => 0.0,
        }
    }

    fn duty_for_pressure(&mut self, setpoint_bar: f32) -> f32 {
        if setpoint_bar < MIN_PRESSURE_SETPOINT {
            return 0.0;
        }

        let error = (self.filtered_pressure - setpoint_bar) / MAX_PRESSURE_BAR;
        self.error_integral =
            (self.error_integral + error * self.dt).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);

        let u = -PRESSURE_KP * error - PRESSURE_KI * self.error_integral;
        (u * 100.0).clamp(0.0, 100.0)
    }

    fn duty_for_flow(&mut self, setpoint_mlps: f32) -> f32 {
        let available = self.available_flow();
        if available < MIN_AVAILABLE_FLOW {
            return 0.0;
        }
        (setpoint_mlps / available * 100.0).clamp(0.0, 100.0)
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 0.03;

    fn settle(pc: &mut PressureController, pressure: f32, steps: usize) {
        for _ in 0..steps {
            let _ = pc.update(
                ControlMode::Power,
                &ControlInputs {
                    raw_pressure_bar: pressure,
                    applied_duty_pct: 0.0,
                    ..ControlInputs::default()
                },
            );
        }
    }

    #[test]
    fn power_mode_passes_duty_through() {
        let mut pc = PressureController::new(DT);
        let duty = pc.update(
            ControlMode::Power,
            &ControlInputs {
                raw_pressure_bar: 0.0,
                applied_duty_pct: 64.0,
                ..ControlInputs::default()
            },
        );
        assert_eq!(duty, 64.0);
    }

    #[test]
    fn pressure_mode_cuts_below_min_setpoint() {
        let mut pc = PressureController::new(DT);
        let duty = pc.update(
            ControlMode::Pressure,
            &ControlInputs {
                raw_pressure_bar: 0.0,
                pressure_setpoint_bar: 0.1,
                ..ControlInputs::default()
            },
        );
        assert_eq!(duty, 0.0);
    }

    #[test]
    fn pressure_mode_drives_towards_setpoint() {
        let mut pc = PressureController::new(DT);
        settle(&mut pc, 1.0, 50);
        // Below setpoint: positive duty demanded.
        let duty = pc.update(
            ControlMode::Pressure,
            &ControlInputs {
                raw_pressure_bar: 1.0,
                pressure_setpoint_bar: 9.0,
                ..ControlInputs::default()
            },
        );
        assert!(duty > 0.0);

        // Well above setpoint: duty collapses to zero.
        let mut pc = PressureController::new(DT);
        settle(&mut pc, 14.0, 50);
        let duty = pc.update(
            ControlMode::Pressure,
            &ControlInputs {
                raw_pressure_bar: 14.0,
                pressure_setpoint_bar: 2.0,
                ..ControlInputs::default()
            },
        );
        assert_eq!(duty, 0.0);
    }

    #[test]
    fn integral_is_clamped() {
        let mut pc = PressureController::new(DT);
        settle(&mut pc, 0.0, 10);
        // Hold a large error for a long time; the integral limit keeps
        // the demanded duty finite and bounded.
        let mut duty = 0.0;
        for _ in 0..100_000 {
            duty = pc.update(
                ControlMode::Pressure,
                &ControlInputs {
                    raw_pressure_bar: 0.0,
                    pressure_setpoint_bar: 9.0,
                    ..ControlInputs::default()
                },
            );
        }
        assert!(duty <= 100.0);
        assert!(pc.error_integral >= -INTEGRAL_LIMIT && pc.error_integral <= INTEGRAL_LIMIT);
    }

    #[test]
    fn flow_mode_scales_by_available_flow() {
        let mut pc = PressureController::new(DT);
        pc.inject_available_flow(8.0);
        let duty = pc.update(
            ControlMode::Flow,
            &ControlInputs {
                raw_pressure_bar: 2.0,
                flow_setpoint_mlps: 4.0,
                ..ControlInputs::default()
            },
        );
        assert!((duty - 50.0).abs() < 1e-3);
    }

    #[test]
    fn flow_mode_zero_without_available_flow() {
        let mut pc = PressureController::new(DT);
        let duty = pc.update(
            ControlMode::Flow,
            &ControlInputs {
                raw_pressure_bar: 2.0,
                flow_setpoint_mlps: 4.0,
                ..ControlInputs::default()
            },
        );
        assert_eq!(duty, 0.0);
    }

    #[test]
    fn coffee_output_accumulates_only_with_valve_open() {
        let mut pc = PressureController::new(DT);
        pc.inject_available_flow(5.0);

        for _ in 0..400 {
            let _ = pc.update(
                ControlMode::Power,
                &ControlInputs {
                    raw_pressure_bar: 9.0,
                    applied_duty_pct: 100.0,
                    valve_open: true,
                    ..ControlInputs::default()
                },
            );
        }
        let with_valve = pc.coffee_output_ml();
        assert!(with_valve > 0.0);

        let mut pc = PressureController::new(DT);
        pc.inject_available_flow(5.0);
        for _ in 0..400 {
            let _ = pc.update(
                ControlMode::Power,
                &ControlInputs {
                    raw_pressure_bar: 9.0,
                    applied_duty_pct: 100.0,
                    valve_open: false,
                    ..ControlInputs::default()
                },
            );
        }
        assert_eq!(pc.coffee_output_ml(), 0.0);
    }

    #[test]
    fn tare_zeroes_shot_state() {
        let mut pc = PressureController::new(DT);
        pc.inject_available_flow(5.0);
        for _ in 0..200 {
            let _ = pc.update(
                ControlMode::Power,
                &ControlInputs {
                    raw_pressure_bar: 9.0,
                    applied_duty_pct: 100.0,
                    valve_open: true,
                    ..ControlInputs::default()
                },
            );
        }
        assert!(pc.coffee_output_ml() > 0.0);
        pc.tare();
        assert_eq!(pc.coffee_output_ml(), 0.0);
        assert_eq!(pc.puck_flow_mlps(), 0.0);
    }
}
