//! Display node: user intent, profile execution, telemetry.
//!
//! ```text
//!  buttons/UI ──▶ DisplaySupervisor (mode FSM) ──▶ OutputControl frames
//!  BLE scale  ──▶ volumetric arbitration ──▶ Brew/Grind processes
//!  LinkClient ◀──▶ machine node
//! ```
//!
//! Task periods: tick 100 ms, control emission 250 ms, ping 1 s, link
//! receive event-driven.

pub mod process;
pub mod profile;
pub mod settings;
pub mod supervisor;

pub use supervisor::DisplaySupervisor;

/// Top-level machine mode as the user sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standby,
    Brew,
    Steam,
    Water,
    Grind,
}

/// Where volumetric measurements for the running process come from.
///
/// A process commits to one source when it starts and never switches
/// mid-shot; if the source goes quiet the volumetric targets simply stop
/// firing and the time bounds take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumetricSource {
    Inactive,
    Bluetooth,
    FlowEstimation,
}
