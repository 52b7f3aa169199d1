//! Persisted display-node settings.
//!
//! Values live in a string key/value store behind [`SettingsStore`] — any
//! stable backend will do (NVS on hardware, a map in tests). `Settings`
//! is the typed in-memory view: it loads once at boot, setters mark it
//! dirty, and the supervisor flushes it back opportunistically. Malformed
//! stored values fall back to their defaults rather than failing boot.
//!
//! PID tunings persist as `"kp,ki,kd"` and the pump model as
//! `"a,b,c,d"` (a NaN `c`/`d` pair marks the legacy two-point form) so
//! stores written by earlier firmware keep loading.

use std::collections::HashMap;

use log::warn;

use crate::config::STANDBY_TIMEOUT_MS;
use crate::display::Mode;
use crate::link::messages::{PidSettings, PumpModel};
use crate::machine::sensors::DEFAULT_PRESSURE_SCALE_BAR;

// ---------------------------------------------------------------------------
// Storage port
// ---------------------------------------------------------------------------

/// String key/value persistence boundary.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

/// In-memory store for tests and the simulator.
#[derive(Default)]
pub struct MemorySettingsStore {
    map: HashMap<String, String>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

// ---------------------------------------------------------------------------
// Typed settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub startup_mode: Mode,
    pub target_steam_temp_c: f32,
    pub target_water_temp_c: f32,
    pub temperature_offset_c: f32,
    pub pid: PidSettings,
    pub pump_model: Option<PumpModel>,
    pub pressure_scale_bar: f32,
    pub selected_profile_id: String,
    pub profile_order: Vec<String>,
    pub brew_delay_ms: f64,
    pub grind_delay_ms: f64,
    pub delay_adjust: bool,
    pub momentary_buttons: bool,
    pub standby_timeout_ms: u64,
    pub steam_pump_pct: f32,
    pub steam_pump_cutoff_bar: f32,
    pub flush_duration_s: f32,
    pub volumetric_target: bool,
    pub target_grind_duration_ms: u64,
    pub target_grind_volume_g: f64,

    dirty: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            startup_mode: Mode::Standby,
            target_steam_temp_c: 145.0,
            target_water_temp_c: 80.0,
            temperature_offset_c: 0.0,
            pid: PidSettings {
                kp: 0.05,
                ki: 0.002,
                kd: 0.1,
            },
            pump_model: None,
            pressure_scale_bar: DEFAULT_PRESSURE_SCALE_BAR,
            selected_profile_id: "default".into(),
            profile_order: Vec::new(),
            brew_delay_ms: 1_000.0,
            grind_delay_ms: 1_000.0,
            delay_adjust: true,
            momentary_buttons: true,
            standby_timeout_ms: STANDBY_TIMEOUT_MS,
            steam_pump_pct: 4.0,
            steam_pump_cutoff_bar: 3.0,
            flush_duration_s: 5.0,
            volumetric_target: false,
            target_grind_duration_ms: 12_000,
            target_grind_volume_g: 18.0,
            dirty: false,
        }
    }
}

impl Settings {
    /// Load from the store, falling back field-by-field to defaults.
    pub fn load(store: &impl SettingsStore) -> Self {
        let d = Self::default();
        Self {
            startup_mode: match store.get("startup_mode").as_deref() {
                Some("brew") => Mode::Brew,
                Some("standby") | None => Mode::Standby,
                Some(other) => {
                    warn!("settings: unknown startup mode '{other}'");
                    Mode::Standby
                }
            },
            target_steam_temp_c: get_f32(store, "steam_temp", d.target_steam_temp_c),
            target_water_temp_c: get_f32(store, "water_temp", d.target_water_temp_c),
            temperature_offset_c: get_f32(store, "temp_offset", d.temperature_offset_c),
            pid: parse_pid(store.get("pid").as_deref()).unwrap_or(d.pid),
            pump_model: store.get("pump_model").as_deref().and_then(parse_pump_model),
            pressure_scale_bar: get_f32(store, "pressure_scale", d.pressure_scale_bar),
            selected_profile_id: store
                .get("profile")
                .unwrap_or_else(|| d.selected_profile_id.clone()),
            profile_order: store
                .get("profile_order")
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            brew_delay_ms: get_f64(store, "brew_delay", d.brew_delay_ms),
            grind_delay_ms: get_f64(store, "grind_delay", d.grind_delay_ms),
            delay_adjust: get_bool(store, "delay_adjust", d.delay_adjust),
            momentary_buttons: get_bool(store, "momentary", d.momentary_buttons),
            standby_timeout_ms: get_u64(store, "standby_timeout", d.standby_timeout_ms),
            steam_pump_pct: get_f32(store, "steam_pump_pct", d.steam_pump_pct),
            steam_pump_cutoff_bar: get_f32(store, "steam_pump_cutoff", d.steam_pump_cutoff_bar),
            flush_duration_s: get_f32(store, "flush_duration", d.flush_duration_s),
            volumetric_target: get_bool(store, "volumetric_target", d.volumetric_target),
            target_grind_duration_ms: get_u64(store, "grind_duration", d.target_grind_duration_ms),
            target_grind_volume_g: get_f64(store, "grind_volume", d.target_grind_volume_g),
            dirty: false,
        }
    }

    /// Write every key back and clear the dirty flag.
    pub fn persist(&mut self, store: &mut impl SettingsStore) {
        store.set(
            "startup_mode",
            if self.startup_mode == Mode::Brew {
                "brew"
            } else {
                "standby"
            },
        );
        store.set("steam_temp", &self.target_steam_temp_c.to_string());
        store.set("water_temp", &self.target_water_temp_c.to_string());
        store.set("temp_offset", &self.temperature_offset_c.to_string());
        store.set(
            "pid",
            &format!("{},{},{}", self.pid.kp, self.pid.ki, self.pid.kd),
        );
        if let Some(model) = &self.pump_model {
            store.set("pump_model", &format_pump_model(model));
        }
        store.set("pressure_scale", &self.pressure_scale_bar.to_string());
        store.set("profile", &self.selected_profile_id);
        store.set("profile_order", &self.profile_order.join(","));
        store.set("brew_delay", &self.brew_delay_ms.to_string());
        store.set("grind_delay", &self.grind_delay_ms.to_string());
        store.set("delay_adjust", bool_str(self.delay_adjust));
        store.set("momentary", bool_str(self.momentary_buttons));
        store.set("standby_timeout", &self.standby_timeout_ms.to_string());
        store.set("steam_pump_pct", &self.steam_pump_pct.to_string());
        store.set("steam_pump_cutoff", &self.steam_pump_cutoff_bar.to_string());
        store.set("flush_duration", &self.flush_duration_s.to_string());
        store.set("volumetric_target", bool_str(self.volumetric_target));
        store.set(
            "grind_duration",
            &self.target_grind_duration_ms.to_string(),
        );
        store.set("grind_volume", &self.target_grind_volume_g.to_string());
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // Setters for values the core writes back at runtime.

    pub fn set_pid(&mut self, pid: PidSettings) {
        self.pid = pid;
        self.dirty = true;
    }

    pub fn set_brew_delay_ms(&mut self, delay: f64) {
        self.brew_delay_ms = delay;
        self.dirty = true;
    }

    pub fn set_grind_delay_ms(&mut self, delay: f64) {
        self.grind_delay_ms = delay;
        self.dirty = true;
    }

    pub fn set_selected_profile(&mut self, id: &str) {
        self.selected_profile_id = id.to_string();
        self.dirty = true;
    }

    pub fn set_volumetric_target(&mut self, volumetric: bool) {
        self.volumetric_target = volumetric;
        self.dirty = true;
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn get_f32(store: &impl SettingsStore, key: &str, default: f32) -> f32 {
    store
        .get(key)
        .and_then(|s| s.parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn get_f64(store: &impl SettingsStore, key: &str, default: f64) -> f64 {
    store
        .get(key)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn get_u64(store: &impl SettingsStore, key: &str, default: u64) -> u64 {
    store
        .get(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn get_bool(store: &impl SettingsStore, key: &str, default: bool) -> bool {
    match store.get(key).as_deref() {
        Some("1") => true,
        Some("0") => false,
        _ => default,
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "1"
    } else {
        "0"
    }
}

/// `"kp,ki,kd"`, all finite and non-negative.
fn parse_pid(raw: Option<&str>) -> Option<PidSettings> {
    let raw = raw?;
    let mut parts = raw.split(',').map(|p| p.trim().parse::<f32>());
    let kp = parts.next()?.ok()?;
    let ki = parts.next()?.ok()?;
    let kd = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    let valid = [kp, ki, kd].iter().all(|v| v.is_finite() && *v >= 0.0);
    if valid {
        Some(PidSettings { kp, ki, kd })
    } else {
        warn!("settings: rejecting pid '{raw}'");
        None
    }
}

/// `"a,b,c,d"`; NaN `c` and `d` select the legacy two-point form.
fn parse_pump_model(raw: &str) -> Option<PumpModel> {
    let parts: Vec<f32> = raw
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect::<Option<Vec<_>>>()?;
    let [a, b, c, d] = parts.as_slice() else {
        return None;
    };
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    if c.is_nan() && d.is_nan() {
        Some(PumpModel::TwoPoint {
            one_bar_flow: *a,
            nine_bar_flow: *b,
        })
    } else if c.is_finite() && d.is_finite() {
        Some(PumpModel::Polynomial {
            a: *a,
            b: *b,
            c: *c,
            d: *d,
        })
    } else {
        None
    }
}

fn format_pump_model(model: &PumpModel) -> String {
    match model {
        PumpModel::TwoPoint {
            one_bar_flow,
            nine_bar_flow,
        } => format!("{one_bar_flow},{nine_bar_flow},NaN,NaN"),
        PumpModel::Polynomial { a, b, c, d } => format!("{a},{b},{c},{d}"),
    }
}

// ── Tests ────────────────────────────────────────────────────
