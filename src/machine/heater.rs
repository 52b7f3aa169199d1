//! Boiler heater: PID, relay-feedback autotune, runaway protection.
//!
//! The heater pin is time-proportioned over a 1 s window; the PID output
//! is the on-fraction of that window. Control follows the setpoint except
//! during autotune, when a relay experiment owns the output. The runaway
//! detector is always armed — autotune included — and latches until
//! device reset.
//!
//! Runaway state machine:
//!
//! ```text
//! IDLE ──(|err| < 5 °C)─────────────────────▶ STABLE
//! IDLE ──(heating > 60 s and ΔT < 2 °C)─────▶ RUNAWAY
//! STABLE ──(|err| > 15 °C)──────────────────▶ IDLE
//! any ──(temp > 170 °C)─────────────────────▶ RUNAWAY   (latched)
//! ```

use log::{error, info, warn};

use crate::config::{HEATER_WINDOW_MS, MAX_SAFE_TEMP_C};
use crate::link::messages::{AutotuneResult, PidSettings};

// ---------------------------------------------------------------------------
// PID
// ---------------------------------------------------------------------------

/// Positional PID with derivative-on-measurement.
///
/// Anti-windup keeps the integral term inside the band that still maps
/// to a duty in [0, 1]: while the output is saturated the integrator
/// stops accumulating, so it holds whatever value the window can
/// actually deliver.
pub struct HeaterPid {
    kp: f32,
    ki: f32,
    kd: f32,
    integral: f32,
    last_measurement: Option<f32>,
}

impl HeaterPid {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_measurement: None,
        }
    }

    pub fn set_tunings(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn tunings(&self) -> (f32, f32, f32) {
        (self.kp, self.ki, self.kd)
    }

    /// Compute the duty in [0, 1]. A zero setpoint resets the integrator
    /// so cooldown cannot wind it up.
    pub fn compute(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        if setpoint <= 0.0 {
            self.reset();
            self.last_measurement = Some(measurement);
            return 0.0;
        }

        let error = setpoint - measurement;
        let p = self.kp * error;

        let d = match self.last_measurement {
            Some(last) if dt > 0.0 => -self.kd * (measurement - last) / dt,
            _ => 0.0,
        };
        self.last_measurement = Some(measurement);

        self.integral += self.ki * error * dt;
        let raw = p + self.integral + d;
        let output = raw.clamp(0.0, 1.0);

        // Saturated: back the integration out so the term stays within
        // what the output window can realise.
        if raw != output {
            self.integral -= self.ki * error * dt;
        }

        output
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_measurement = None;
    }
}

// ---------------------------------------------------------------------------
// Runaway detector
// ---------------------------------------------------------------------------

/// Error band that captures STABLE.
const STABLE_BAND_C: f32 = 5.0;
/// Error band that releases STABLE back to IDLE.
const UNSTABLE_BAND_C: f32 = 15.0;
/// Continuous heating beyond this without temperature rise is a stall.
const HEATING_TIME_MAX_MS: u64 = 60_000;
/// Minimum rise expected within the stall window.
const MIN_TEMP_RISE_C: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunawayState {
    Idle,
    Stable,
    Runaway,
}

pub struct RunawayDetector {
    state: RunawayState,
    /// Start of the current continuous-heating stretch: (time, temp).
    heating_since: Option<(u64, f32)>,
}

impl RunawayDetector {
    pub fn new() -> Self {
        Self {
            state: RunawayState::Idle,
            heating_since: None,
        }
    }

    pub fn state(&self) -> RunawayState {
        self.state
    }

    pub fn fired(&self) -> bool {
        self.state == RunawayState::Runaway
    }

    /// Advance the detector. Returns true the moment runaway fires.
    pub fn update(&mut self, temp_c: f32, setpoint_c: f32, heating: bool, now_ms: u64) -> bool {
        if self.state == RunawayState::Runaway {
            return false;
        }

        if temp_c > MAX_SAFE_TEMP_C {
            error!("runaway: boiler at {temp_c:.1} C exceeds {MAX_SAFE_TEMP_C} C");
            self.state = RunawayState::Runaway;
            return true;
        }

        match self.state {
            RunawayState::Idle => {
                if setpoint_c > 0.0 && (temp_c - setpoint_c).abs() < STABLE_BAND_C {
                    self.state = RunawayState::Stable;
                    self.heating_since = None;
                    return false;
                }
                if heating {
                    let (since, start_temp) = *self
                        .heating_since
                        .get_or_insert((now_ms, temp_c));
                    if now_ms.saturating_sub(since) > HEATING_TIME_MAX_MS
                        && temp_c - start_temp < MIN_TEMP_RISE_C
                    {
                        error!(
                            "runaway: {HEATING_TIME_MAX_MS} ms of heating raised only {:.1} C",
                            temp_c - start_temp
                        );
                        self.state = RunawayState::Runaway;
                        return true;
                    }
                } else {
                    self.heating_since = None;
                }
            }
            RunawayState::Stable => {
                if setpoint_c > 0.0 && (temp_c - setpoint_c).abs() > UNSTABLE_BAND_C {
                    warn!("runaway detector: lost stability ({temp_c:.1} C)");
                    self.state = RunawayState::Idle;
                    self.heating_since = None;
                }
            }
            RunawayState::Runaway => {}
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Relay-feedback autotune
// ---------------------------------------------------------------------------

/// Relay output ceiling during autotune; full power is never applied.
const AUTOTUNE_CEILING: f32 = 0.5;
/// Relay hysteresis around the setpoint.
const AUTOTUNE_HYSTERESIS_C: f32 = 0.5;
/// Relay target when autotune is requested with no active setpoint
/// (the display drops to standby for the run).
const AUTOTUNE_DEFAULT_TARGET_C: f32 = 93.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum AutotuneStep {
    Running(f32),
    Done(AutotuneResult),
    TimedOut,
}

struct Autotuner {
    setpoint_c: f32,
    samples_wanted: u32,
    deadline_ms: u64,
    relay_on: bool,
    /// Times of relay ON switches, bounding full oscillation cycles.
    last_on_switch_ms: Option<u64>,
    periods_ms: Vec<u64>,
    amplitudes_c: Vec<f32>,
    cycle_min_c: f32,
    cycle_max_c: f32,
}

impl Autotuner {
    fn new(setpoint_c: f32, test_time_s: u32, samples: u32, now_ms: u64) -> Self {
        Self {
            setpoint_c,
            samples_wanted: samples.max(1),
            deadline_ms: now_ms + u64::from(test_time_s) * 1_000,
            relay_on: false,
            last_on_switch_ms: None,
            periods_ms: Vec::new(),
            amplitudes_c: Vec::new(),
            cycle_min_c: f32::MAX,
            cycle_max_c: f32::MIN,
        }
    }

    fn update(&mut self, temp_c: f32, now_ms: u64) -> AutotuneStep {
        if now_ms > self.deadline_ms {
            return if self.periods_ms.len() >= 2 {
                AutotuneStep::Done(self.compute_result())
            } else {
                AutotuneStep::TimedOut
            };
        }

        self.cycle_min_c = self.cycle_min_c.min(temp_c);
        self.cycle_max_c = self.cycle_max_c.max(temp_c);

        if self.relay_on && temp_c > self.setpoint_c + AUTOTUNE_HYSTERESIS_C {
            self.relay_on = false;
        } else if !self.relay_on && temp_c < self.setpoint_c - AUTOTUNE_HYSTERESIS_C {
            self.relay_on = true;
            if let Some(last) = self.last_on_switch_ms {
                self.periods_ms.push(now_ms - last);
                self.amplitudes_c
                    .push((self.cycle_max_c - self.cycle_min_c) / 2.0);
                self.cycle_min_c = temp_c;
                self.cycle_max_c = temp_c;
            }
            self.last_on_switch_ms = Some(now_ms);
        }

        if self.periods_ms.len() >= self.samples_wanted as usize {
            return AutotuneStep::Done(self.compute_result());
        }

        AutotuneStep::Running(if self.relay_on { AUTOTUNE_CEILING } else { 0.0 })
    }

    /// Ziegler–Nichols PID constants from the observed limit cycle.
    fn compute_result(&self) -> AutotuneResult {
        let n = self.periods_ms.len().max(1) as f32;
        let tu_s = self.periods_ms.iter().sum::<u64>() as f32 / n / 1_000.0;
        let amplitude = (self.amplitudes_c.iter().sum::<f32>() / n).max(0.01);

        let relay_amplitude = AUTOTUNE_CEILING / 2.0;
        let ku = 4.0 * relay_amplitude / (core::f32::consts::PI * amplitude);
        let tu = tu_s.max(0.1);

        AutotuneResult {
            kp: 0.6 * ku,
            ki: 1.2 * ku / tu,
            kd: 0.075 * ku * tu,
        }
    }
}

// ---------------------------------------------------------------------------
// Heater
// ---------------------------------------------------------------------------

/// Events surfaced from a heater tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaterEvent {
    /// The runaway detector fired; latched until reset.
    RunawayFired,
    /// Autotune finished with new tunings.
    AutotuneDone(AutotuneResult),
    /// Autotune ran out its test time before seeing enough cycles.
    AutotuneFailed,
}

pub struct Heater {
    pid: HeaterPid,
    runaway: RunawayDetector,
    autotune: Option<Autotuner>,
    setpoint_c: f32,
    duty: f32,
    /// Cleared when the temperature sensor goes unhealthy.
    enabled: bool,
}

impl Heater {
    pub fn new(tunings: PidSettings) -> Self {
        Self {
            pid: HeaterPid::new(tunings.kp, tunings.ki, tunings.kd),
            runaway: RunawayDetector::new(),
            autotune: None,
            setpoint_c: 0.0,
            duty: 0.0,
            enabled: true,
        }
    }

    /// Target temperature. Forced to zero while runaway is latched.
    pub fn set_setpoint(&mut self, setpoint_c: f32) {
        self.setpoint_c = if self.runaway.fired() { 0.0 } else { setpoint_c };
    }

    pub fn setpoint_c(&self) -> f32 {
        self.setpoint_c
    }

    pub fn set_tunings(&mut self, s: PidSettings) {
        info!("heater: tunings kp={} ki={} kd={}", s.kp, s.ki, s.kd);
        self.pid.set_tunings(s.kp, s.ki, s.kd);
    }

    /// Begin a relay-feedback autotune around the current setpoint, or
    /// the default brew temperature when idle. Ignored while runaway is
    /// latched.
    pub fn start_autotune(&mut self, test_time_s: u32, samples: u32, now_ms: u64) {
        if self.runaway.fired() || !self.enabled {
            warn!("heater: autotune refused");
            return;
        }
        let target = if self.setpoint_c > 0.0 {
            self.setpoint_c
        } else {
            AUTOTUNE_DEFAULT_TARGET_C
        };
        info!("heater: autotune start at {target} C ({test_time_s} s, {samples} samples)");
        self.autotune = Some(Autotuner::new(target, test_time_s, samples, now_ms));
    }

    pub fn autotuning(&self) -> bool {
        self.autotune.is_some()
    }

    pub fn runaway_latched(&self) -> bool {
        self.runaway.fired()
    }

    /// Permanently disable the heater (unhealthy sensor). Output goes to
    /// zero until reset.
    pub fn disable(&mut self) {
        if self.enabled {
            error!("heater: disabled");
        }
        self.enabled = false;
        self.duty = 0.0;
    }

    /// One thermal tick. Returns the event, if any, that this tick
    /// produced.
    pub fn tick(&mut self, temp_c: f32, now_ms: u64, dt: f32) -> Option<HeaterEvent> {
        // Runaway detection stays armed in every mode, autotune included.
        let fired = self
            .runaway
            .update(temp_c, self.setpoint_c, self.duty > 0.0, now_ms);
        if fired {
            self.setpoint_c = 0.0;
            self.duty = 0.0;
            self.autotune = None;
            return Some(HeaterEvent::RunawayFired);
        }

        if self.runaway.fired() || !self.enabled {
            self.duty = 0.0;
            return None;
        }

        if let Some(tuner) = &mut self.autotune {
            match tuner.update(temp_c, now_ms) {
                AutotuneStep::Running(duty) => {
                    self.duty = duty;
                    return None;
                }
                AutotuneStep::Done(result) => {
                    info!(
                        "heater: autotune done kp={:.3} ki={:.3} kd={:.3}",
                        result.kp, result.ki, result.kd
                    );
                    self.autotune = None;
                    self.pid.reset();
                    self.duty = 0.0;
                    return Some(HeaterEvent::AutotuneDone(result));
                }
                AutotuneStep::TimedOut => {
                    warn!("heater: autotune timed out");
                    self.autotune = None;
                    self.pid.reset();
                    self.duty = 0.0;
                    return Some(HeaterEvent::AutotuneFailed);
                }
            }
        }

        self.duty = self.pid.compute(self.setpoint_c, temp_c, dt);
        None
    }

    /// Current duty, 0–1 of the time-proportioning window.
    pub fn duty(&self) -> f32 {
        self.duty
    }

    /// Time-proportioned pin level for the 1 s output window.
    pub fn pin_state(&self, now_ms: u64) -> bool {
        let phase = now_ms % HEATER_WINDOW_MS;
        (phase as f32) < self.duty * HEATER_WINDOW_MS as f32
    }
}

// ── Tests ────────────────────────────────────────────────────
