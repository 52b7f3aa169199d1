//! In-memory brew profile model.
//!
//! A profile is a temperature plus an ordered list of phases; each phase
//! carries a pump demand, a valve state and exit targets. Storage format
//! and authoring live outside the core — only this shape matters here.

use serde::{Deserialize, Serialize};

use crate::link::messages::AdvancedPump;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileKind {
    /// Time-driven phases only.
    Standard,
    /// Full target set, advanced pump control.
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseKind {
    Preinfusion,
    Brew,
}

/// Pump demand for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PumpSetting {
    /// Open-loop percentage.
    Simple(f32),
    /// Closed-loop pressure or flow target.
    Advanced(AdvancedPump),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    /// Predicted volume (measured + in-flight) reaches the value.
    Volumetric,
    /// Raw scale weight reaches the value.
    Weight,
    /// Accumulated pumped water reaches the value.
    Pumped,
    Pressure,
    Flow,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetOp {
    Ge,
    Le,
    Eq,
}

impl TargetOp {
    /// Evaluate `current op value`. `Eq` uses a small tolerance — exact
    /// float equality never fires on sampled data.
    pub fn satisfied(self, current: f64, value: f64) -> bool {
        match self {
            Self::Ge => current >= value,
            Self::Le => current <= value,
            Self::Eq => (current - value).abs() < 1e-2,
        }
    }
}

/// One phase exit condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub op: TargetOp,
    pub value: f32,
}

/// How the pump demand moves when the phase begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// Jump straight to the phase demand.
    Instant,
    /// Ramp linearly from the previous phase's demand.
    Linear { duration_s: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub kind: PhaseKind,
    pub valve: bool,
    pub duration_s: f32,
    /// 0 inherits the profile temperature.
    pub temperature_c: f32,
    pub pump: PumpSetting,
    pub targets: Vec<Target>,
    pub transition: Transition,
}

impl Phase {
    pub fn has_non_time_targets(&self) -> bool {
        self.targets.iter().any(|t| t.kind != TargetKind::Time)
    }

    pub fn volumetric_target(&self) -> Option<Target> {
        self.targets
            .iter()
            .find(|t| matches!(t.kind, TargetKind::Volumetric | TargetKind::Weight))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub label: String,
    pub description: String,
    pub kind: ProfileKind,
    pub temperature_c: f32,
    pub phases: Vec<Phase>,
    /// Utility profiles (flush, descale) are hidden from normal
    /// selection and never learn predictive delays.
    pub utility: bool,
}

impl Profile {
    /// Structural invariants: at least one phase, and standard profiles
    /// are strictly time-based.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.phases.is_empty() {
            return Err("profile has no phases");
        }
        if self.kind == ProfileKind::Standard {
            for phase in &self.phases {
                if phase.has_non_time_targets() {
                    return Err("standard profile phase has non-time targets");
                }
                if matches!(phase.pump, PumpSetting::Advanced(_)) {
                    return Err("standard profile phase has advanced pump");
                }
            }
        }
        Ok(())
    }

    /// Last volumetric/weight target value across the phases, if any.
    pub fn volumetric_target_value(&self) -> Option<f64> {
        self.phases
            .iter()
            .filter_map(|p| p.volumetric_target())
            .next_back()
            .map(|t| f64::from(t.value))
    }

    /// Built-in group-head flush: one full-power, valve-open, time-bound
    /// phase.
    pub fn flush(duration_s: f32) -> Self {
        Self {
            id: "flush".into(),
            label: "Flush".into(),
            description: String::new(),
            kind: ProfileKind::Standard,
            temperature_c: 93.0,
            phases: vec![Phase {
                name: "Flush".into(),
                kind: PhaseKind::Brew,
                valve: true,
                duration_s,
                temperature_c: 0.0,
                pump: PumpSetting::Simple(100.0),
                targets: Vec::new(),
                transition: Transition::Instant,
            }],
            utility: true,
        }
    }

    /// Default single-phase brew used before any profile is stored.
    pub fn default_brew() -> Self {
        Self {
            id: "default".into(),
            label: "Espresso".into(),
            description: "Straight 9 bar shot".into(),
            kind: ProfileKind::Standard,
            temperature_c: 93.0,
            phases: vec![Phase {
                name: "Brew".into(),
                kind: PhaseKind::Brew,
                valve: true,
                duration_s: 25.0,
                temperature_c: 0.0,
                pump: PumpSetting::Simple(100.0),
                targets: Vec::new(),
                transition: Transition::Instant,
            }],
            utility: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Profile storage port
// ---------------------------------------------------------------------------

/// Profile storage boundary. The on-disk format is not the core's
/// concern; the display supervisor only selects and reads.
pub trait ProfileStore {
    fn profiles(&self) -> &[Profile];

    fn by_id(&self, id: &str) -> Option<&Profile> {
        self.profiles().iter().find(|p| p.id == id)
    }
}

/// In-memory store for tests and the simulator.
pub struct MemoryProfileStore {
    profiles: Vec<Profile>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    pub fn add(&mut self, profile: Profile) {
        self.profiles.push(profile);
    }
}

impl ProfileStore for MemoryProfileStore {
    fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

// ── Tests ────────────────────────────────────────────────────
