//! Crema host simulation.
//!
//! Wires a machine node and a display node over an in-memory duplex link
//! and runs a scripted session against the simulated plant: heat-up, a
//! volumetric shot, then idle.
//!
//! ```text
//!  SimMachine ◀── MachineSupervisor ◀──link──▶ DisplaySupervisor
//!  (plant)        30/250 ms tasks              100/250/1000 ms tasks
//! ```
//!
//! Useful with `RUST_LOG=info` (or `debug` for per-loop detail).

use anyhow::Result;
use log::info;

use crema::config::MachineConfig;
use crema::display::profile::{Profile, ProfileKind, Target, TargetKind, TargetOp};
use crema::display::settings::{MemorySettingsStore, Settings, SettingsStore};
use crema::display::DisplaySupervisor;
use crema::link::transport::MemoryLink;
use crema::machine::MachineSupervisor;
use crema::sim::SimMachine;

/// Virtual-clock step.
const STEP_MS: u64 = 10;
/// Total scripted session length.
const SESSION_MS: u64 = 120_000;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (machine_link, display_link) = MemoryLink::pair();
    let mut plant = SimMachine::new();

    let mut store = MemorySettingsStore::new();
    store.set("startup_mode", "brew");
    store.set("volumetric_target", "1");
    store.set("brew_delay", "500");
    store.set("pid", "0.1,0.005,0.0");
    // Pump curve matching the simulated head curve.
    store.set("pump_model", "560,240,NaN,NaN");
    let settings = Settings::load(&store);

    let mut machine = MachineSupervisor::new(MachineConfig::pro(), machine_link, settings.pid);
    let mut display = DisplaySupervisor::new(
        display_link,
        settings,
        vec![volumetric_profile()],
        0,
    );

    let mut shot_started = false;
    let mut shot_reported = false;

    for now in (0..SESSION_MS).step_by(STEP_MS as usize) {
        plant.step(STEP_MS as f32 / 1_000.0);

        // Machine node task set.
        if now % 30 == 0 {
            machine.tick_control(&mut plant, now);
        }
        if now % 10 == 0 {
            machine.on_zero_cross(&mut plant);
        }
        if now % 250 == 0 {
            machine.tick_thermal(&mut plant, now);
            machine.tick_supervisor(&mut plant, now);
        }

        // Display node task set (ping and control emission are paced
        // inside tick).
        if now % 100 == 0 {
            display.tick(now);
        }

        // Script: pull the shot once the boiler is ready.
        if !shot_started && now > 2_000 && machine.boiler_temp_c() > 88.0 {
            info!("-- script: starting volumetric shot at t={}s", now / 1_000);
            display.brew_button(true, now);
            shot_started = true;
        }
        if shot_started && !shot_reported && !display.is_active(now) && now > 10_000 {
            info!(
                "-- script: shot done, scale at {:.1} g, learned delay {:.0} ms",
                plant.scale_g,
                display.settings().brew_delay_ms
            );
            shot_reported = true;
        }

        if now % 5_000 == 0 {
            info!(
                "t={:>3}s mode={:?} boiler={:5.1}C p={:4.2}bar pump={:5.1}% scale={:5.1}g",
                now / 1_000,
                display.mode(),
                machine.boiler_temp_c(),
                plant.pressure_bar,
                plant.pump_duty(),
                plant.scale_g,
            );
        }
    }

    display.persist_settings(&mut store);
    info!(
        "session complete: mode={:?} shutdown={} scale={:.1}g",
        display.mode(),
        machine.shutdown_active(),
        plant.scale_g
    );
    Ok(())
}

/// A 36 g volumetric shot at 93 °C.
fn volumetric_profile() -> Profile {
    let mut profile = Profile::default_brew();
    profile.id = "volumetric".into();
    profile.label = "Volumetric 36g".into();
    profile.kind = ProfileKind::Pro;
    profile.phases[0].duration_s = 45.0;
    profile.phases[0].targets.push(Target {
        kind: TargetKind::Volumetric,
        op: TargetOp::Ge,
        value: 36.0,
    });
    profile
}
