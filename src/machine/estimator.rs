//! Online estimators for the hydraulic path.
//!
//! - [`Kalman`]: scalar filter smoothing the raw pressure reading.
//! - [`FlowEstimator`]: puck outflow from pump flow and pressure slope —
//!   water compressing the system (line compliance) is pump flow that
//!   never reached the puck.
//! - [`HydraulicEstimator`]: recursive fit of the puck law `p ≈ R·q²`
//!   from (pump duty, pressure). Its outputs only count once the
//!   innovation variance settles; until then the datasheet flow map is
//!   the source of available flow.

use core::f32::consts::PI;

// ---------------------------------------------------------------------------
// Scalar Kalman filter
// ---------------------------------------------------------------------------

/// One-dimensional Kalman filter.
pub struct Kalman {
    err_measure: f32,
    err_estimate: f32,
    q: f32,
    last_estimate: f32,
    primed: bool,
}

impl Kalman {
    pub fn new(err_measure: f32, err_estimate: f32, q: f32) -> Self {
        Self {
            err_measure,
            err_estimate,
            q,
            last_estimate: 0.0,
            primed: false,
        }
    }

    pub fn update(&mut self, measurement: f32) -> f32 {
        if !self.primed {
            self.primed = true;
            self.last_estimate = measurement;
            return measurement;
        }
        let gain = self.err_estimate / (self.err_estimate + self.err_measure);
        let estimate = self.last_estimate + gain * (measurement - self.last_estimate);
        self.err_estimate = (1.0 - gain) * self.err_estimate
            + (self.last_estimate - estimate).abs() * self.q;
        self.last_estimate = estimate;
        estimate
    }

    pub fn reset(&mut self) {
        self.primed = false;
        self.last_estimate = 0.0;
    }
}

// ---------------------------------------------------------------------------
// First-order low-pass
// ---------------------------------------------------------------------------

/// In-place first-order low-pass step.
pub fn low_pass(state: &mut f32, input: f32, cutoff_hz: f32, dt: f32) {
    let alpha = dt / (dt + 1.0 / (2.0 * PI * cutoff_hz));
    *state += alpha * (input - *state);
}

// ---------------------------------------------------------------------------
// Puck flow estimator
// ---------------------------------------------------------------------------

/// Line compliance: ml of apparent flow absorbed per bar/s of pressure
/// slope.
const COMPLIANCE_ML_PER_BAR: f32 = 3.0;
/// Output filter cutoff.
const FLOW_FILTER_HZ: f32 = 1.0;
/// Below this pressure the puck cannot be flowing.
const MIN_FLOW_PRESSURE_BAR: f32 = 0.5;
/// Pressure-slope clamp.
const DERIVATIVE_CLAMP: f32 = 20.0;

pub struct FlowEstimator {
    dt: f32,
    filtered_flow: f32,
}

impl FlowEstimator {
    pub fn new(dt: f32) -> Self {
        Self {
            dt,
            filtered_flow: 0.0,
        }
    }

    /// Advance one sample. `pump_flow` in ml/s, slope in bar/s.
    pub fn update(
        &mut self,
        pump_flow_mlps: f32,
        pressure_bar: f32,
        pressure_slope: f32,
        valve_open: bool,
    ) {
        if !valve_open || pressure_bar < MIN_FLOW_PRESSURE_BAR {
            self.filtered_flow = 0.0;
            return;
        }
        let slope = pressure_slope.clamp(-DERIVATIVE_CLAMP, DERIVATIVE_CLAMP);
        let raw = (pump_flow_mlps - COMPLIANCE_ML_PER_BAR * slope).max(0.0);
        low_pass(&mut self.filtered_flow, raw, FLOW_FILTER_HZ, self.dt);
    }

    /// Filtered puck flow in ml/s.
    pub fn flow(&self) -> f32 {
        self.filtered_flow
    }

    pub fn reset(&mut self) {
        self.filtered_flow = 0.0;
    }
}

// ---------------------------------------------------------------------------
// Hydraulic parameter estimator
// ---------------------------------------------------------------------------

/// Nominal free flow of the pump at zero head, ml/s.
const NOMINAL_FREE_FLOW_MLPS: f32 = 10.0;
/// Nominal stall pressure of the pump, bar.
const NOMINAL_STALL_BAR: f32 = 15.0;
/// Normalised-LMS adaptation gain.
const LMS_GAIN: f32 = 0.4;
/// Innovation-variance smoothing factor.
const VAR_ALPHA: f32 = 0.05;
/// Variance below this (bar²) counts as settled.
const CONVERGENCE_VAR: f32 = 0.05;
/// Samples required before convergence may be declared.
const MIN_SAMPLES: u32 = 100;

/// Recursive estimator of puck resistance and pump-available flow.
///
/// Model: the pump follows a linear head curve
/// `q_avail = q_free · (1 − p / p_stall)` and the puck obeys
/// `p = R · q²` with `q = duty · q_avail`. Each sample nudges `R` along
/// the normalised-LMS gradient of the pressure residual; the exponential
/// variance of that residual gates convergence.
pub struct HydraulicEstimator {
    resistance: f32,
    residual_var: f32,
    samples: u32,
    converged: bool,
    last_pressure: f32,
}

impl HydraulicEstimator {
    pub fn new() -> Self {
        Self {
            resistance: 0.0,
            residual_var: f32::MAX,
            samples: 0,
            converged: false,
            last_pressure: 0.0,
        }
    }

    /// Advance one sample. `pump_duty` in percent, pressure in bar.
    pub fn update(&mut self, pump_duty_pct: f32, pressure_bar: f32) {
        self.last_pressure = pressure_bar;

        let q = pump_duty_pct / 100.0 * self.available_flow(pressure_bar);
        let q2 = q * q;
        // The fit is only informative while water actually moves.
        if q2 < 1e-3 || pressure_bar < MIN_FLOW_PRESSURE_BAR {
            return;
        }

        let residual = pressure_bar - self.resistance * q2;
        self.resistance += LMS_GAIN * residual * q2 / (1.0 + q2 * q2);
        self.resistance = self.resistance.max(0.0);

        if self.residual_var == f32::MAX {
            self.residual_var = residual * residual;
        } else {
            self.residual_var =
                (1.0 - VAR_ALPHA) * self.residual_var + VAR_ALPHA * residual * residual;
        }

        self.samples = self.samples.saturating_add(1);
        if self.samples >= MIN_SAMPLES && self.residual_var < CONVERGENCE_VAR {
            self.converged = true;
        }
    }

    /// Whether the fit has settled enough to trust.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Estimated puck resistance (bar·s²/ml²).
    pub fn resistance(&self) -> f32 {
        self.resistance
    }

    /// Pump-available flow at the given head, ml/s.
    pub fn available_flow(&self, pressure_bar: f32) -> f32 {
        (NOMINAL_FREE_FLOW_MLPS * (1.0 - pressure_bar / NOMINAL_STALL_BAR)).max(0.0)
    }

    /// Model pressure at the last sample.
    pub fn pressure(&self) -> f32 {
        self.last_pressure
    }

    pub fn reset(&mut self) {
        self.resistance = 0.0;
        self.residual_var = f32::MAX;
        self.samples = 0;
        self.converged = false;
        self.last_pressure = 0.0;
    }
}

// ── Tests ────────────────────────────────────────────────────
