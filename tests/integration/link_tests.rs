//! Link-focused integration: malformed frames, disconnect/reconnect.

use crema::config::MachineConfig;
use crema::display::settings::{MemorySettingsStore, Settings, SettingsStore};
use crema::display::DisplaySupervisor;
use crema::link::transport::{LinkTransport, MemoryLink};
use crema::machine::MachineSupervisor;
use crema::sim::SimMachine;

fn settings() -> Settings {
    let mut store = MemorySettingsStore::new();
    store.set("startup_mode", "brew");
    store.set("pid", "0.1,0.005,0.0");
    Settings::load(&store)
}

// ── S3: malformed frame does not disturb the session ─────────

#[test]
fn malformed_frame_mid_session_is_survivable() {
    let (machine_link, display_link) = MemoryLink::pair();
    // A second handle on the display's endpoint injects raw garbage into
    // the same byte stream the display writes.
    let mut injector = display_link.clone();

    let mut plant = SimMachine::new();
    let mut machine = MachineSupervisor::new(MachineConfig::pro(), machine_link, settings().pid);
    let mut display = DisplaySupervisor::new(display_link, settings(), Vec::new(), 0);

    let mut now = 0u64;
    let mut step = |machine: &mut MachineSupervisor<MemoryLink>,
                    display: &mut DisplaySupervisor<MemoryLink>,
                    plant: &mut SimMachine,
                    now: &mut u64| {
        *now += 10;
        plant.step(0.01);
        if *now % 30 == 0 {
            machine.tick_control(plant, *now);
        }
        if *now % 250 == 0 {
            machine.tick_thermal(plant, *now);
            machine.tick_supervisor(plant, *now);
        }
        if *now % 100 == 0 {
            display.tick(*now);
        }
    };

    while !display.connected() || machine.heater_setpoint_c() != 93.0 {
        step(&mut machine, &mut display, &mut plant, &mut now);
        assert!(now < 5_000, "session never settled");
    }

    // An oversized frame (claimed 200-byte payload, 10 bytes following,
    // the tail shaped as an unknown-type frame so the stream re-aligns).
    let mut garbage = vec![0u8; 15];
    garbage[0..2].copy_from_slice(&200u16.to_le_bytes());
    garbage[2] = 0x02;
    garbage[5..7].copy_from_slice(&3u16.to_le_bytes());
    garbage[7] = 0xEE;
    injector.send(&garbage).unwrap();

    // The machine keeps its state and later control still applies.
    for _ in 0..200 {
        step(&mut machine, &mut display, &mut plant, &mut now);
    }
    assert_eq!(machine.heater_setpoint_c(), 93.0);
    assert!(!machine.shutdown_active());
    assert!(!display.is_error_state());
}

// ── Disconnect tears the session down; reconnect rebuilds it ─

#[test]
fn reconnect_repeats_system_info_handshake() {
    let (machine_link, display_link) = MemoryLink::pair();
    let severer = display_link.clone();

    let mut plant = SimMachine::new();
    let mut machine = MachineSupervisor::new(MachineConfig::pro(), machine_link, settings().pid);
    let mut display = DisplaySupervisor::new(display_link, settings(), Vec::new(), 0);

    let mut now = 0u64;
    let mut run = |machine: &mut MachineSupervisor<MemoryLink>,
                   display: &mut DisplaySupervisor<MemoryLink>,
                   plant: &mut SimMachine,
                   now: &mut u64,
                   ms: u64| {
        let end = *now + ms;
        while *now < end {
            *now += 10;
            plant.step(0.01);
            if *now % 250 == 0 {
                machine.tick_thermal(plant, *now);
                machine.tick_supervisor(plant, *now);
            }
            if *now % 100 == 0 {
                display.tick(*now);
            }
        }
    };

    run(&mut machine, &mut display, &mut plant, &mut now, 1_000);
    assert!(display.connected(), "handshake must complete");

    severer.sever();
    run(&mut machine, &mut display, &mut plant, &mut now, 1_000);
    assert!(!display.connected());

    severer.restore();
    run(&mut machine, &mut display, &mut plant, &mut now, 1_000);
    assert!(
        display.connected(),
        "system info must be re-sent on the new connection"
    );
}
