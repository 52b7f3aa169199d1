//! Process state machines: brew, steam, hot water, grind.
//!
//! A process is sampled by the display supervisor every 100 ms for its
//! valve state, pump demand and temperature, and advanced by `progress`.
//! Brew executes the selected profile phase by phase; steam and water are
//! thin time-bounded wrappers; grind mirrors brew on the alt relay.
//!
//! Volumetric exits are predictive: the phase ends when the measured
//! volume plus the in-flight volume (`rate × brew_delay`) reaches the
//! target, and the delay itself is re-learned from each shot's overshoot.

use std::collections::VecDeque;

use log::{debug, info};

use crate::config::{
    BREW_SAFETY_DURATION_MS, DISPLAY_TICK_MS, HOT_WATER_SAFETY_DURATION_MS, PREDICTIVE_TIME_MS,
    STEAM_SAFETY_DURATION_MS,
};
use crate::display::profile::{Profile, PumpSetting, Target, TargetKind, Transition};
use crate::display::Mode;
use crate::link::messages::AdvancedPump;

/// Seconds advanced per `progress` call.
const TICK_S: f32 = DISPLAY_TICK_MS as f32 / 1_000.0;

/// What a process asks of the pump right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PumpCommand {
    Off,
    /// Open-loop percentage.
    Simple(f32),
    /// Closed-loop pressure/flow target.
    Advanced(AdvancedPump),
}

/// How the process decides completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTarget {
    Time,
    Volumetric,
}

// ---------------------------------------------------------------------------
// Volumetric rate
// ---------------------------------------------------------------------------

/// Least-squares slope of the weight stream over a sliding window.
pub struct VolumetricRateCalculator {
    window_ms: f64,
    samples: VecDeque<(u64, f64)>,
}

impl VolumetricRateCalculator {
    pub fn new(window_ms: f64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    pub fn add(&mut self, now_ms: u64, volume_ml: f64) {
        self.samples.push_back((now_ms, volume_ml));
        let cutoff = now_ms.saturating_sub(self.window_ms as u64);
        while let Some(&(t, _)) = self.samples.front() {
            if t < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Slope in ml per millisecond; 0 when falling or under-sampled.
    pub fn rate_ml_per_ms(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }

        let t_mean = self.samples.iter().map(|(t, _)| *t as f64).sum::<f64>() / n as f64;
        let v_mean = self.samples.iter().map(|(_, v)| *v).sum::<f64>() / n as f64;

        let mut num = 0.0;
        let mut den = 0.0;
        for (t, v) in &self.samples {
            let td = *t as f64 - t_mean;
            num += td * (*v - v_mean);
            den += td * td;
        }
        if den <= 0.0 {
            return 0.0;
        }
        (num / den).max(0.0)
    }

    /// Delay correction from a finished shot: the overshoot converted to
    /// milliseconds of pumping at the measured rate. Positive after an
    /// overshoot (stop earlier next time), negative after an undershoot.
    pub fn overshoot_adjust_ms(&self, target_ml: f64, final_ml: f64) -> f64 {
        let rate = self.rate_ml_per_ms();
        if rate <= 0.0 {
            return 0.0;
        }
        (final_ml - target_ml) / rate
    }
}

// ---------------------------------------------------------------------------
// Brew
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessPhase {
    Running,
    Finished,
}

pub struct BrewProcess {
    profile: Profile,
    pub target: ProcessTarget,
    brew_delay_ms: f64,

    phase_index: usize,
    phase_started_ms: u64,
    state: ProcessPhase,
    finished_ms: u64,

    water_pumped_ml: f32,
    current_volume_ml: f64,
    current_flow_mlps: f32,
    current_pressure_bar: f32,

    rate: VolumetricRateCalculator,
    /// Pump demand of the previous phase, the ramp origin for `Linear`
    /// transitions.
    previous_demand: PumpCommand,
}

impl BrewProcess {
    pub fn new(profile: Profile, target: ProcessTarget, brew_delay_ms: f64, now_ms: u64) -> Self {
        debug_assert!(!profile.phases.is_empty(), "validated at selection");
        info!(
            "brew: profile '{}' target {:?} delay {:.0} ms",
            profile.label, target, brew_delay_ms
        );
        Self {
            profile,
            target,
            brew_delay_ms,
            phase_index: 0,
            phase_started_ms: now_ms,
            state: ProcessPhase::Running,
            finished_ms: 0,
            water_pumped_ml: 0.0,
            current_volume_ml: 0.0,
            current_flow_mlps: 0.0,
            current_pressure_bar: 0.0,
            rate: VolumetricRateCalculator::new(PREDICTIVE_TIME_MS),
            previous_demand: PumpCommand::Off,
        }
    }

    /// Weight/volume sample. Recorded for rate fitting while the process
    /// still runs; the raw value keeps updating afterwards so delay
    /// learning sees the settled weight.
    pub fn update_volume(&mut self, now_ms: u64, volume_ml: f64) {
        self.current_volume_ml = volume_ml;
        if self.state != ProcessPhase::Finished {
            self.rate.add(now_ms, volume_ml);
        }
    }

    pub fn update_flow(&mut self, flow_mlps: f32) {
        self.current_flow_mlps = flow_mlps;
    }

    pub fn update_pressure(&mut self, pressure_bar: f32) {
        self.current_pressure_bar = pressure_bar;
    }

    /// 100 ms tick: accumulate pumped water, evaluate the phase exit.
    pub fn progress(&mut self, now_ms: u64) {
        if self.state == ProcessPhase::Finished {
            return;
        }
        self.water_pumped_ml += self.current_flow_mlps * TICK_S;

        if self.phase_finished(now_ms) {
            if self.phase_index + 1 < self.profile.phases.len() {
                self.previous_demand = self.nominal_demand();
                self.phase_index += 1;
                self.phase_started_ms = now_ms;
                self.water_pumped_ml = 0.0;
                info!(
                    "brew: phase {}/{} '{}'",
                    self.phase_index + 1,
                    self.profile.phases.len(),
                    self.current_phase().name
                );
            } else {
                info!("brew: finished");
                self.state = ProcessPhase::Finished;
                self.finished_ms = now_ms;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ProcessPhase::Running
    }

    /// Whether delay learning may run. A time shot completes with the
    /// process; a volumetric shot keeps collecting weight for one
    /// predictive window after the pump stops.
    pub fn is_complete(&self, now_ms: u64) -> bool {
        match self.target {
            ProcessTarget::Time => !self.is_active(),
            ProcessTarget::Volumetric => {
                self.state == ProcessPhase::Finished
                    && now_ms.saturating_sub(self.finished_ms) > PREDICTIVE_TIME_MS as u64
            }
        }
    }

    pub fn valve_open(&self) -> bool {
        self.state == ProcessPhase::Running && self.current_phase().valve
    }

    /// Current pump demand, transition ramp applied.
    pub fn pump_command(&self, now_ms: u64) -> PumpCommand {
        if self.state == ProcessPhase::Finished {
            return PumpCommand::Off;
        }
        let phase = self.current_phase();
        let demand = match phase.pump {
            PumpSetting::Simple(pct) => PumpCommand::Simple(pct),
            PumpSetting::Advanced(adv) => PumpCommand::Advanced(adv),
        };
        match phase.transition {
            Transition::Instant => demand,
            Transition::Linear { duration_s } => {
                let elapsed_s = (now_ms.saturating_sub(self.phase_started_ms)) as f32 / 1_000.0;
                ramp_demand(self.previous_demand, demand, elapsed_s, duration_s)
            }
        }
    }

    /// Phase temperature override, else the profile temperature.
    pub fn temperature_c(&self) -> f32 {
        let phase = self.current_phase();
        if phase.temperature_c > 0.0 {
            phase.temperature_c
        } else {
            self.profile.temperature_c
        }
    }

    pub fn utility(&self) -> bool {
        self.profile.utility
    }

    pub fn current_volume_ml(&self) -> f64 {
        self.current_volume_ml
    }

    /// Learned delay for the next shot, bounded to the predictive
    /// window.
    pub fn new_delay_ms(&self) -> f64 {
        let Some(target) = self.profile.volumetric_target_value() else {
            return self.brew_delay_ms;
        };
        let adjust = self.rate.overshoot_adjust_ms(target, self.current_volume_ml);
        (self.brew_delay_ms + adjust).clamp(0.0, PREDICTIVE_TIME_MS)
    }

    // ── Internal ──────────────────────────────────────────────

    fn current_phase(&self) -> &crate::display::profile::Phase {
        &self.profile.phases[self.phase_index.min(self.profile.phases.len() - 1)]
    }

    fn nominal_demand(&self) -> PumpCommand {
        match self.current_phase().pump {
            PumpSetting::Simple(pct) => PumpCommand::Simple(pct),
            PumpSetting::Advanced(adv) => PumpCommand::Advanced(adv),
        }
    }

    fn phase_finished(&mut self, now_ms: u64) -> bool {
        let elapsed_ms = now_ms.saturating_sub(self.phase_started_ms);
        if elapsed_ms > BREW_SAFETY_DURATION_MS {
            debug!("brew: phase safety bound hit");
            return true;
        }

        let phase = self.current_phase();
        let elapsed_s = elapsed_ms as f32 / 1_000.0;
        if elapsed_s >= phase.duration_s {
            return true;
        }

        let predicted_volume = if self.current_volume_ml > 0.0 {
            self.current_volume_ml + self.rate.rate_ml_per_ms() * self.brew_delay_ms
        } else {
            0.0
        };

        phase.targets.iter().any(|t| {
            self.target_satisfied(t, elapsed_s, predicted_volume)
        })
    }

    fn target_satisfied(&self, t: &Target, elapsed_s: f32, predicted_volume: f64) -> bool {
        let value = f64::from(t.value);
        match t.kind {
            TargetKind::Time => t.op.satisfied(f64::from(elapsed_s), value),
            TargetKind::Pumped => t.op.satisfied(f64::from(self.water_pumped_ml), value),
            TargetKind::Pressure => t.op.satisfied(f64::from(self.current_pressure_bar), value),
            TargetKind::Flow => t.op.satisfied(f64::from(self.current_flow_mlps), value),
            // Volumetric targets are only honoured when the process
            // committed to a volumetric source at start.
            TargetKind::Volumetric => {
                self.target == ProcessTarget::Volumetric
                    && t.op.satisfied(predicted_volume, value)
            }
            TargetKind::Weight => {
                self.target == ProcessTarget::Volumetric
                    && t.op.satisfied(self.current_volume_ml, value)
            }
        }
    }
}

/// Interpolate between two pump demands for a linear transition.
fn ramp_demand(from: PumpCommand, to: PumpCommand, elapsed_s: f32, duration_s: f32) -> PumpCommand {
    if duration_s <= 0.0 || elapsed_s >= duration_s {
        return to;
    }
    let k = (elapsed_s / duration_s).clamp(0.0, 1.0);

    let start = match from {
        PumpCommand::Simple(pct) => pct,
        PumpCommand::Advanced(adv) => adv.pressure_bar,
        PumpCommand::Off => 0.0,
    };
    match to {
        PumpCommand::Simple(pct) => {
            let from_pct = if matches!(from, PumpCommand::Simple(_)) {
                start
            } else {
                0.0
            };
            PumpCommand::Simple(from_pct + (pct - from_pct) * k)
        }
        PumpCommand::Advanced(adv) => {
            let from_bar = if matches!(from, PumpCommand::Advanced(_)) {
                start
            } else {
                0.0
            };
            PumpCommand::Advanced(AdvancedPump {
                pressure_bar: from_bar + (adv.pressure_bar - from_bar) * k,
                ..adv
            })
        }
        PumpCommand::Off => PumpCommand::Off,
    }
}

// ---------------------------------------------------------------------------
// Steam and hot water
// ---------------------------------------------------------------------------

/// Low-duty pump assist while steaming keeps the boiler fed.
pub struct SteamProcess {
    started_ms: u64,
    duration_ms: u64,
    pump_pct: f32,
}

impl SteamProcess {
    pub fn new(pump_pct: f32, now_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            duration_ms: STEAM_SAFETY_DURATION_MS,
            pump_pct,
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) < self.duration_ms
    }

    pub fn pump_command(&self, now_ms: u64) -> PumpCommand {
        if self.is_active(now_ms) {
            PumpCommand::Simple(self.pump_pct)
        } else {
            PumpCommand::Off
        }
    }
}

pub struct WaterProcess {
    started_ms: u64,
    duration_ms: u64,
}

impl WaterProcess {
    pub fn new(now_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            duration_ms: HOT_WATER_SAFETY_DURATION_MS,
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) < self.duration_ms
    }

    pub fn pump_command(&self, now_ms: u64) -> PumpCommand {
        if self.is_active(now_ms) {
            PumpCommand::Simple(100.0)
        } else {
            PumpCommand::Off
        }
    }
}

// ---------------------------------------------------------------------------
// Grind
// ---------------------------------------------------------------------------

/// Grinder control through the alt relay, with the same predictive
/// volumetric exit as brewing.
pub struct GrindProcess {
    pub target: ProcessTarget,
    duration_ms: u64,
    volume_target_ml: f64,
    grind_delay_ms: f64,
    started_ms: u64,
    finished: bool,
    finished_ms: u64,
    current_volume_ml: f64,
    rate: VolumetricRateCalculator,
}

impl GrindProcess {
    pub fn new(
        target: ProcessTarget,
        duration_ms: u64,
        volume_target_ml: f64,
        grind_delay_ms: f64,
        now_ms: u64,
    ) -> Self {
        info!("grind: target {target:?} volume {volume_target_ml} g");
        Self {
            target,
            duration_ms,
            volume_target_ml,
            grind_delay_ms,
            started_ms: now_ms,
            finished: false,
            finished_ms: 0,
            current_volume_ml: 0.0,
            rate: VolumetricRateCalculator::new(PREDICTIVE_TIME_MS),
        }
    }

    pub fn update_volume(&mut self, now_ms: u64, volume_ml: f64) {
        self.current_volume_ml = volume_ml;
        if !self.finished {
            self.rate.add(now_ms, volume_ml);
        }
    }

    pub fn progress(&mut self, now_ms: u64) {
        if self.finished {
            return;
        }
        let done = match self.target {
            ProcessTarget::Time => now_ms.saturating_sub(self.started_ms) >= self.duration_ms,
            ProcessTarget::Volumetric => {
                let predicted =
                    self.current_volume_ml + self.rate.rate_ml_per_ms() * self.grind_delay_ms;
                predicted >= self.volume_target_ml
                    || now_ms.saturating_sub(self.started_ms) >= BREW_SAFETY_DURATION_MS
            }
        };
        if done {
            info!("grind: finished");
            self.finished = true;
            self.finished_ms = now_ms;
        }
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }

    pub fn is_complete(&self, now_ms: u64) -> bool {
        match self.target {
            ProcessTarget::Time => self.finished,
            ProcessTarget::Volumetric => {
                self.finished
                    && now_ms.saturating_sub(self.finished_ms) > PREDICTIVE_TIME_MS as u64
            }
        }
    }

    pub fn alt_on(&self) -> bool {
        !self.finished
    }

    pub fn new_delay_ms(&self) -> f64 {
        let adjust = self
            .rate
            .overshoot_adjust_ms(self.volume_target_ml, self.current_volume_ml);
        (self.grind_delay_ms + adjust).clamp(0.0, PREDICTIVE_TIME_MS)
    }
}

// ---------------------------------------------------------------------------
// Process dispatch
// ---------------------------------------------------------------------------

/// The one process the display supervisor may own at a time.
pub enum Process {
    Brew(BrewProcess),
    Steam(SteamProcess),
    Water(WaterProcess),
    Grind(GrindProcess),
}

impl Process {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Brew(_) => Mode::Brew,
            Self::Steam(_) => Mode::Steam,
            Self::Water(_) => Mode::Water,
            Self::Grind(_) => Mode::Grind,
        }
    }

    pub fn progress(&mut self, now_ms: u64) {
        match self {
            Self::Brew(p) => p.progress(now_ms),
            Self::Grind(p) => p.progress(now_ms),
            // Steam and water are pure time bounds; nothing to advance.
            Self::Steam(_) | Self::Water(_) => {}
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        match self {
            Self::Brew(p) => p.is_active(),
            Self::Steam(p) => p.is_active(now_ms),
            Self::Water(p) => p.is_active(now_ms),
            Self::Grind(p) => p.is_active(),
        }
    }

    pub fn is_complete(&self, now_ms: u64) -> bool {
        match self {
            Self::Brew(p) => p.is_complete(now_ms),
            Self::Steam(p) => !p.is_active(now_ms),
            Self::Water(p) => !p.is_active(now_ms),
            Self::Grind(p) => p.is_complete(now_ms),
        }
    }

    pub fn pump_command(&self, now_ms: u64) -> PumpCommand {
        match self {
            Self::Brew(p) => p.pump_command(now_ms),
            Self::Steam(p) => p.pump_command(now_ms),
            Self::Water(p) => p.pump_command(now_ms),
            Self::Grind(_) => PumpCommand::Off,
        }
    }

    pub fn valve_open(&self) -> bool {
        match self {
            Self::Brew(p) => p.valve_open(),
            _ => false,
        }
    }

    pub fn alt_on(&self) -> bool {
        match self {
            Self::Grind(p) => p.alt_on(),
            _ => false,
        }
    }

    pub fn update_volume(&mut self, now_ms: u64, volume_ml: f64) {
        match self {
            Self::Brew(p) => p.update_volume(now_ms, volume_ml),
            Self::Grind(p) => p.update_volume(now_ms, volume_ml),
            Self::Steam(_) | Self::Water(_) => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::profile::{Phase, PhaseKind, ProfileKind, TargetOp};

    fn volumetric_profile(volume: f32, duration_s: f32) -> Profile {
        Profile {
            id: "t".into(),
            label: "test".into(),
            description: String::new(),
            kind: ProfileKind::Pro,
            temperature_c: 93.0,
            phases: vec![Phase {
                name: "Brew".into(),
                kind: PhaseKind::Brew,
                valve: true,
                duration_s,
                temperature_c: 0.0,
                pump: PumpSetting::Simple(100.0),
                targets: vec![Target {
                    kind: TargetKind::Volumetric,
                    op: TargetOp::Ge,
                    value: volume,
                }],
                transition: Transition::Instant,
            }],
            utility: false,
        }
    }

    /// Drive a brew with a linear weight ramp of `rate_mlps`, returning
    /// the time the process finished.
    fn run_linear_shot(
        process: &mut BrewProcess,
        rate_mlps: f64,
        until_ms: u64,
    ) -> Option<u64> {
        let mut now = 0;
        while now <= until_ms {
            now += DISPLAY_TICK_MS;
            process.update_volume(now, rate_mlps * now as f64 / 1_000.0);
            process.progress(now);
            if !process.is_active() {
                return Some(now);
            }
        }
        None
    }

    #[test]
    fn rate_calculator_fits_linear_stream() {
        let mut rc = VolumetricRateCalculator::new(PREDICTIVE_TIME_MS);
        // 2 ml/s sampled every 100 ms.
        for i in 0..50u64 {
            rc.add(i * 100, i as f64 * 0.2);
        }
        let rate = rc.rate_ml_per_ms();
        assert!((rate - 0.002).abs() < 1e-5, "got {rate}");
    }

    #[test]
    fn rate_calculator_clamps_negative_slope() {
        let mut rc = VolumetricRateCalculator::new(PREDICTIVE_TIME_MS);
        for i in 0..20u64 {
            rc.add(i * 100, 100.0 - i as f64);
        }
        assert_eq!(rc.rate_ml_per_ms(), 0.0);
    }

    #[test]
    fn volumetric_exit_fires_before_duration() {
        // 36 g target, weight reaches it at ~8 s of a 10 s phase.
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 10.0),
            ProcessTarget::Volumetric,
            0.0,
            0,
        );
        let end = run_linear_shot(&mut p, 4.5, 20_000).expect("must finish");
        assert!((7_500..=8_500).contains(&end), "ended at {end} ms");
    }

    #[test]
    fn duration_bounds_volumetric_phase() {
        // Weight never reaches 36 g: the 10 s duration ends the phase.
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 10.0),
            ProcessTarget::Volumetric,
            0.0,
            0,
        );
        let end = run_linear_shot(&mut p, 0.5, 20_000).expect("must finish");
        assert!((9_900..=10_100).contains(&end), "ended at {end} ms");
    }

    #[test]
    fn safety_bound_overrides_everything() {
        // Absurd duration, no weight: safety duration terminates.
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 600.0),
            ProcessTarget::Volumetric,
            0.0,
            0,
        );
        let mut now = 0;
        while p.is_active() && now < 2 * BREW_SAFETY_DURATION_MS {
            now += DISPLAY_TICK_MS;
            p.progress(now);
        }
        assert!(!p.is_active());
        assert!(now <= BREW_SAFETY_DURATION_MS + 2 * DISPLAY_TICK_MS);
    }

    #[test]
    fn predictive_delay_ends_shot_early() {
        // With a 1 s delay at 4.5 ml/s, the predictor sees ~4.5 g in
        // flight and stops roughly a second earlier.
        let mut with_delay = BrewProcess::new(
            volumetric_profile(36.0, 30.0),
            ProcessTarget::Volumetric,
            1_000.0,
            0,
        );
        let early = run_linear_shot(&mut with_delay, 4.5, 40_000).unwrap();

        let mut without = BrewProcess::new(
            volumetric_profile(36.0, 30.0),
            ProcessTarget::Volumetric,
            0.0,
            0,
        );
        let base = run_linear_shot(&mut without, 4.5, 40_000).unwrap();

        assert!(early < base, "{early} !< {base}");
        assert!((base - early) >= 800 && (base - early) <= 1_200);
    }

    #[test]
    fn volumetric_targets_ignored_for_time_process() {
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 10.0),
            ProcessTarget::Time,
            0.0,
            0,
        );
        // Weight rockets past the target; the time process ignores it.
        let end = run_linear_shot(&mut p, 50.0, 20_000).expect("must finish");
        assert!((9_900..=10_100).contains(&end), "ended at {end} ms");
    }

    #[test]
    fn new_delay_is_clamped_to_predictive_window() {
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 30.0),
            ProcessTarget::Volumetric,
            2_900.0,
            0,
        );
        let _ = run_linear_shot(&mut p, 4.5, 40_000);
        // Massive overshoot reported after the fact.
        p.update_volume(41_000, 80.0);
        let delay = p.new_delay_ms();
        assert!((0.0..=PREDICTIVE_TIME_MS).contains(&delay), "delay {delay}");

        // And a huge undershoot cannot push it above the window either.
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 30.0),
            ProcessTarget::Volumetric,
            2_900.0,
            0,
        );
        let _ = run_linear_shot(&mut p, 4.5, 40_000);
        p.update_volume(41_000, 1.0);
        let delay = p.new_delay_ms();
        assert!((0.0..=PREDICTIVE_TIME_MS).contains(&delay), "delay {delay}");
    }

    #[test]
    fn water_pumped_accumulates_from_flow() {
        let mut p = BrewProcess::new(
            volumetric_profile(36.0, 30.0),
            ProcessTarget::Time,
            0.0,
            0,
        );
        p.update_flow(5.0);
        for tick in 1..=10u64 {
            p.progress(tick * DISPLAY_TICK_MS);
        }
        // 5 ml/s over 1 s.
        assert!((p.water_pumped_ml - 5.0).abs() < 1e-3);
    }

    #[test]
    fn multi_phase_advances_and_resets_pumped_counter() {
        let mut profile = volumetric_profile(36.0, 30.0);
        profile.phases.insert(
            0,
            Phase {
                name: "Preinfusion".into(),
                kind: PhaseKind::Preinfusion,
                valve: true,
                duration_s: 2.0,
                temperature_c: 0.0,
                pump: PumpSetting::Simple(30.0),
                targets: Vec::new(),
                transition: Transition::Instant,
            },
        );
        let mut p = BrewProcess::new(profile, ProcessTarget::Time, 0.0, 0);
        p.update_flow(3.0);

        assert_eq!(p.pump_command(0), PumpCommand::Simple(30.0));
        let mut now = 0;
        while now < 2_500 {
            now += DISPLAY_TICK_MS;
            p.progress(now);
        }
        assert_eq!(p.pump_command(now), PumpCommand::Simple(100.0));
        assert!(p.water_pumped_ml < 2.0, "counter reset on phase change");
    }

    #[test]
    fn phase_temperature_override() {
        let mut profile = volumetric_profile(36.0, 30.0);
        profile.phases[0].temperature_c = 88.0;
        let p = BrewProcess::new(profile, ProcessTarget::Time, 0.0, 0);
        assert_eq!(p.temperature_c(), 88.0);

        let p2 = BrewProcess::new(volumetric_profile(36.0, 30.0), ProcessTarget::Time, 0.0, 0);
        assert_eq!(p2.temperature_c(), 93.0);
    }

    #[test]
    fn steam_and_water_respect_safety_durations() {
        let steam = SteamProcess::new(4.0, 0);
        assert!(steam.is_active(STEAM_SAFETY_DURATION_MS - 1));
        assert!(!steam.is_active(STEAM_SAFETY_DURATION_MS));
        assert_eq!(steam.pump_command(1_000), PumpCommand::Simple(4.0));
        assert_eq!(
            steam.pump_command(STEAM_SAFETY_DURATION_MS),
            PumpCommand::Off
        );

        let water = WaterProcess::new(0);
        assert!(water.is_active(HOT_WATER_SAFETY_DURATION_MS - 1));
        assert!(!water.is_active(HOT_WATER_SAFETY_DURATION_MS));
    }

    #[test]
    fn grind_volumetric_predictive_exit() {
        let mut g = GrindProcess::new(ProcessTarget::Volumetric, 0, 18.0, 500.0, 0);
        let mut now = 0;
        // 1 g per 500 ms.
        while g.is_active() && now < 30_000 {
            now += DISPLAY_TICK_MS;
            g.update_volume(now, now as f64 / 500.0);
            g.progress(now);
        }
        assert!(!g.is_active());
        // 18 g at 9 s; the 500 ms delay predicts ~1 g in flight.
        assert!((8_000..=9_100).contains(&now), "ended at {now}");
        assert!(!g.alt_on());
    }

    #[test]
    fn grind_time_exit() {
        let mut g = GrindProcess::new(ProcessTarget::Time, 5_000, 0.0, 0.0, 0);
        let mut now = 0;
        while g.is_active() && now < 30_000 {
            now += DISPLAY_TICK_MS;
            g.progress(now);
        }
        assert_eq!(now, 5_000);
    }
}
