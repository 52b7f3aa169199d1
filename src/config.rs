//! System configuration parameters and timing constants.
//!
//! All tunable parameters and periods for both nodes. The machine node's
//! board description (`MachineConfig`) is fixed at boot; the display
//! node's runtime preferences live in [`crate::display::settings`].

use serde::{Deserialize, Serialize};

// --- Link timing ---

/// Watchdog: no ping for this long forces SafeShutdown on the machine.
pub const PING_TIMEOUT_MS: u64 = 10_000;
/// Display sends a ping this often while connected.
pub const PING_INTERVAL_MS: u64 = 1_000;
/// Display control emission period.
pub const PROGRESS_INTERVAL_MS: u64 = 250;
/// Display process/mode tick period.
pub const DISPLAY_TICK_MS: u64 = 100;
/// Machine supervisor tick period (watchdog + telemetry).
pub const SUPERVISOR_TICK_MS: u64 = 250;
/// Client tears down and re-scans after this much link silence.
pub const LINK_IDLE_TIMEOUT_MS: u64 = 30_000;
/// The machine must send `SystemInfo` within this of a new connection.
pub const SYSTEM_INFO_DEADLINE_MS: u64 = 500;
/// More than this many protocol errors per second forces a reconnect.
pub const PROTO_ERR_RECONNECT_PER_S: u32 = 5;

// --- Control timing ---

/// Pressure/flow control loop period.
pub const CONTROL_LOOP_DT: f32 = 0.030;
/// Boiler temperature sampling period.
pub const TEMP_SAMPLE_MS: u64 = 250;
/// Heater time-proportioning window.
pub const HEATER_WINDOW_MS: u64 = 1_000;

// --- Process safety bounds ---

/// No brew phase may outlive this, regardless of targets.
pub const BREW_SAFETY_DURATION_MS: u64 = 60_000;
pub const STEAM_SAFETY_DURATION_MS: u64 = 60_000;
pub const HOT_WATER_SAFETY_DURATION_MS: u64 = 30_000;

// --- Display behaviour ---

/// Default idle time before the display forces Standby.
pub const STANDBY_TIMEOUT_MS: u64 = 900_000;
/// A Bluetooth scale is considered healthy within this of its last sample.
pub const BLUETOOTH_GRACE_PERIOD_MS: u64 = 10_000;
/// Slope window for volumetric prediction and ceiling for the learned
/// predictive delay.
pub const PREDICTIVE_TIME_MS: f64 = 3_000.0;

// --- Thermal safety ---

/// Hard boiler limit; crossing it is an immediate runaway.
pub const MAX_SAFE_TEMP_C: f32 = 170.0;

// ---------------------------------------------------------------------------
// Machine board description
// ---------------------------------------------------------------------------

/// Capability flags advertised to the display in `SystemInfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Phase-angle dimmed pump with tach and DAC reference.
    pub dimming: bool,
    /// Pressure transducer fitted.
    pub pressure: bool,
    /// LED controller on the peripheral port.
    pub led_control: bool,
    /// Time-of-flight distance sensor on the peripheral port.
    pub tof: bool,
}

/// Fixed board description for the machine node. Board autodetection is an
/// external concern; the detected board hands this struct to
/// [`crate::machine::MachineSupervisor`] at boot.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Human-readable board name, also used for link advertising.
    pub name: &'static str,
    /// Firmware version string reported in `SystemInfo`.
    pub version: &'static str,
    pub capabilities: Capabilities,
    /// SSR-type pump: shortens the pulse-skip window from 5 s to 1 s.
    pub ssr_pump: bool,
    /// Valve relay polarity.
    pub valve_on_high: bool,
    /// Alt relay polarity.
    pub alt_on_high: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "Crema Standard",
            version: env!("CARGO_PKG_VERSION"),
            capabilities: Capabilities::default(),
            ssr_pump: false,
            valve_on_high: true,
            alt_on_high: true,
        }
    }
}

impl MachineConfig {
    /// A pressure-sensing, dimmed-pump board.
    pub fn pro() -> Self {
        Self {
            name: "Crema Pro",
            capabilities: Capabilities {
                dimming: true,
                pressure: true,
                led_control: false,
                tof: false,
            },
            ..Self::default()
        }
    }
}
