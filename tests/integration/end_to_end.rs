//! Full-stack scenarios: display node ↔ machine node ↔ simulated plant.

use crema::config::{MachineConfig, PING_TIMEOUT_MS};
use crema::display::profile::{Profile, ProfileKind, Target, TargetKind, TargetOp};
use crema::display::settings::{MemorySettingsStore, Settings, SettingsStore};
use crema::display::{DisplaySupervisor, Mode};
use crema::link::transport::MemoryLink;
use crema::machine::MachineSupervisor;
use crema::sim::SimMachine;

/// Virtual-clock step.
const STEP_MS: u64 = 10;

/// Both nodes, the plant, and a virtual clock.
struct Rig {
    machine: MachineSupervisor<MemoryLink>,
    display: DisplaySupervisor<MemoryLink>,
    plant: SimMachine,
    now: u64,
    /// When false the display node is frozen (simulates a dead display).
    display_alive: bool,
}

impl Rig {
    fn new(settings: Settings, profiles: Vec<Profile>) -> Self {
        let (machine_link, display_link) = MemoryLink::pair();
        let machine = MachineSupervisor::new(MachineConfig::pro(), machine_link, settings.pid);
        let display = DisplaySupervisor::new(display_link, settings, profiles, 0);
        Self {
            machine,
            display,
            plant: SimMachine::new(),
            now: 0,
            display_alive: true,
        }
    }

    fn step(&mut self) {
        self.now += STEP_MS;
        self.plant.step(STEP_MS as f32 / 1_000.0);

        if self.now % 30 == 0 {
            self.machine.tick_control(&mut self.plant, self.now);
        }
        if self.now % 10 == 0 {
            self.machine.on_zero_cross(&mut self.plant);
        }
        if self.now % 250 == 0 {
            self.machine.tick_thermal(&mut self.plant, self.now);
            self.machine.tick_supervisor(&mut self.plant, self.now);
        }
        if self.display_alive && self.now % 100 == 0 {
            self.display.tick(self.now);
        }
    }

    fn run_for(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.step();
        }
    }

    /// Run until `pred` holds; panics after `max_ms`.
    fn run_until(&mut self, max_ms: u64, mut pred: impl FnMut(&Rig) -> bool) {
        let deadline = self.now + max_ms;
        while self.now < deadline {
            self.step();
            if pred(self) {
                return;
            }
        }
        panic!("condition not reached within {max_ms} ms (t={} ms)", self.now);
    }
}

fn brew_settings() -> Settings {
    let mut store = MemorySettingsStore::new();
    store.set("startup_mode", "brew");
    store.set("pid", "0.1,0.005,0.0");
    // Pump curve matching the simulated head curve (ml/min at 1/9 bar).
    store.set("pump_model", "560,240,NaN,NaN");
    Settings::load(&store)
}

fn volumetric_profile(volume: f32) -> Profile {
    let mut profile = Profile::default_brew();
    profile.id = "vol".into();
    profile.kind = ProfileKind::Pro;
    profile.phases[0].duration_s = 45.0;
    profile.phases[0].targets.push(Target {
        kind: TargetKind::Volumetric,
        op: TargetOp::Ge,
        value: volume,
    });
    profile
}

// ── S1: cold start → brew → watchdog ─────────────────────────

#[test]
fn cold_start_brew_and_watchdog() {
    let mut rig = Rig::new(brew_settings(), vec![Profile::default_brew()]);

    // Handshake completes and telemetry starts flowing.
    rig.run_until(2_000, |r| r.display.connected());
    rig.run_until(2_000, |r| r.display.telemetry().temperature_c > 0.0);

    // The brew-mode display drives the boiler to the profile setpoint.
    rig.run_until(2_000, |r| r.machine.heater_setpoint_c() == 93.0);
    rig.run_until(60_000, |r| r.machine.boiler_temp_c() > 88.0);

    // Start a shot: pump runs, valve opens, weight accumulates.
    let t = rig.now;
    rig.display.brew_button(true, t);
    rig.run_until(5_000, |r| r.plant.pump_duty() > 50.0);
    assert!(rig.plant.valve_open());
    rig.run_until(10_000, |r| r.plant.scale_g > 5.0);

    // The display dies mid-shot: pings stop, and within the watchdog
    // timeout the machine forces everything off.
    rig.display_alive = false;
    rig.run_for(PING_TIMEOUT_MS + 1_000);
    assert!(rig.machine.shutdown_active());
    assert_eq!(rig.machine.heater_setpoint_c(), 0.0);
    assert_eq!(rig.machine.pump_power(), 0.0);
    assert!(!rig.machine.valve_open());
    assert!(!rig.machine.alt_on());

    // The display comes back; pings resume and control recovers.
    rig.display_alive = true;
    rig.run_for(3_000);
    assert!(!rig.machine.shutdown_active());
    assert_eq!(rig.machine.heater_setpoint_c(), 93.0);
}

// ── S2: volumetric shot via flow estimation ──────────────────

#[test]
fn volumetric_shot_terminates_near_target() {
    let mut store = MemorySettingsStore::new();
    store.set("startup_mode", "brew");
    store.set("pid", "0.1,0.005,0.0");
    store.set("pump_model", "560,240,NaN,NaN");
    store.set("volumetric_target", "1");
    store.set("delay_adjust", "1");
    store.set("brew_delay", "300");
    let settings = Settings::load(&store);

    let mut rig = Rig::new(settings, vec![volumetric_profile(36.0)]);
    rig.run_until(60_000, |r| {
        r.display.connected() && r.machine.boiler_temp_c() > 88.0
    });

    let start = rig.now;
    rig.display.brew_button(true, rig.now);
    rig.run_until(1_000, |r| r.display.is_active(r.now));

    // The shot must end on the volumetric estimate, well before the
    // 45 s phase duration.
    rig.run_until(44_000, |r| !r.display.is_active(r.now));
    let shot_ms = rig.now - start;
    assert!(
        (4_000..40_000).contains(&shot_ms),
        "shot took {shot_ms} ms"
    );

    // Real water delivered should be in the neighbourhood of the
    // 36 ml target (the estimator, not the scale, stops the shot).
    assert!(
        rig.plant.scale_g > 15.0 && rig.plant.scale_g < 60.0,
        "scale at {}",
        rig.plant.scale_g
    );

    // Delay learning wrote back a bounded value.
    rig.run_for(5_000);
    let delay = rig.display.settings().brew_delay_ms;
    assert!(
        (0.0..=crema::config::PREDICTIVE_TIME_MS).contains(&delay),
        "delay {delay}"
    );
}

// ── Steam mode emits advanced control on pressure machines ───

#[test]
fn steam_mode_heats_to_steam_setpoint() {
    let mut rig = Rig::new(brew_settings(), vec![Profile::default_brew()]);
    rig.run_until(2_000, |r| r.display.connected());

    let t = rig.now;
    rig.display.steam_button(true, t);
    assert_eq!(rig.display.mode(), Mode::Steam);

    // Steam setpoint (145 C default) reaches the machine.
    rig.run_until(2_000, |r| r.machine.heater_setpoint_c() == 145.0);

    // Once the boiler is near the setpoint the steam process starts
    // its pump assist.
    rig.run_until(120_000, |r| r.machine.boiler_temp_c() > 140.1);
    rig.run_until(5_000, |r| r.machine.pump_power() > 0.0);
}

// ── Standby drops everything to zero ─────────────────────────

#[test]
fn standby_zeroes_setpoint() {
    let mut rig = Rig::new(brew_settings(), vec![Profile::default_brew()]);
    rig.run_until(2_000, |r| r.display.connected());
    rig.run_until(2_000, |r| r.machine.heater_setpoint_c() == 93.0);

    let t = rig.now;
    rig.display.activate_standby(t);
    rig.run_until(2_000, |r| r.machine.heater_setpoint_c() == 0.0);
    assert_eq!(rig.machine.pump_power(), 0.0);
}

// ── Machine-side buttons round-trip to the display FSM ───────

#[test]
fn machine_brew_button_starts_shot_on_display() {
    let mut rig = Rig::new(brew_settings(), vec![Profile::default_brew()]);
    rig.run_until(60_000, |r| {
        r.display.connected() && r.machine.boiler_temp_c() > 88.0
    });

    rig.plant.brew_button = true;
    rig.run_until(2_000, |r| r.display.is_active(r.now));
    assert_eq!(rig.display.mode(), Mode::Brew);
}
