//! Display supervisor: mode FSM, process lifecycle, control emission.
//!
//! Owns the one active [`Process`] and the link client. Every 100 ms it
//! advances the process and the mode machine; every 250 ms it composes an
//! `OutputControl` from the process state and pushes it through the
//! coalescing queue; every second it pings. A completed brew or grind is
//! parked in `last_process` until its predictive window closes so delay
//! learning can see the settled weight.
//!
//! Mode transitions (momentary buttons):
//!
//! ```text
//! Standby ──brew──▶ Brew          Standby ──steam──▶ Steam
//! Brew ──brew,idle──▶ Brew (shot started)
//! Brew ──brew,active──▶ Brew (shot aborted)
//! Brew ◀──steam──▶ Steam
//! any ──idle > standby timeout──▶ Standby
//! ```

use log::{error, info, warn};

use crate::config::{
    BLUETOOTH_GRACE_PERIOD_MS, DISPLAY_TICK_MS, PING_INTERVAL_MS, PROGRESS_INTERVAL_MS,
};
use crate::display::process::{
    BrewProcess, GrindProcess, Process, ProcessTarget, PumpCommand, SteamProcess, WaterProcess,
};
use crate::display::profile::Profile;
use crate::display::settings::{Settings, SettingsStore};
use crate::display::{Mode, VolumetricSource};
use crate::error::ErrorCode;
use crate::link::client::{ClientEvent, LinkClient};
use crate::link::messages::{
    AdvancedPump, Autotune, Message, OutputControl, OutputMode, PidSettings, PumpTarget,
    SystemInfo,
};
use crate::link::transport::LinkTransport;

/// Margin below the steam setpoint at which steaming is ready.
const STEAM_READY_BAND_C: f32 = 5.0;

/// Latest machine telemetry, mirrored for the UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Telemetry {
    pub temperature_c: f32,
    pub pressure_bar: f32,
    pub pump_flow_mlps: f32,
    pub puck_flow_mlps: f32,
    pub puck_resistance: f32,
    pub tof_distance_mm: u32,
}

pub struct DisplaySupervisor<T: LinkTransport> {
    client: LinkClient<T>,
    settings: Settings,
    profiles: Vec<Profile>,

    mode: Mode,
    system_info: Option<SystemInfo>,
    current_process: Option<Process>,
    last_process: Option<Process>,
    process_completed: bool,
    steam_ready: bool,
    autotuning: bool,
    error: Option<ErrorCode>,

    volumetric_source: VolumetricSource,
    last_bluetooth_ms: Option<u64>,

    telemetry: Telemetry,
    last_action_ms: u64,
    last_ping_ms: u64,
    last_progress_ms: u64,
    last_control_ms: u64,
}

impl<T: LinkTransport> DisplaySupervisor<T> {
    pub fn new(
        transport: T,
        settings: Settings,
        mut profiles: Vec<Profile>,
        now_ms: u64,
    ) -> Self {
        if profiles.is_empty() {
            profiles.push(Profile::default_brew());
        }
        let mode = settings.startup_mode;
        Self {
            client: LinkClient::new(transport),
            settings,
            profiles,
            mode,
            system_info: None,
            current_process: None,
            last_process: None,
            process_completed: true,
            steam_ready: false,
            autotuning: false,
            error: None,
            volumetric_source: VolumetricSource::Inactive,
            last_bluetooth_ms: None,
            telemetry: Telemetry::default(),
            last_action_ms: now_ms,
            last_ping_ms: 0,
            last_progress_ms: 0,
            last_control_ms: 0,
        }
    }

    // ── Main periodic task (call every 100 ms) ────────────────

    pub fn tick(&mut self, now_ms: u64) {
        for event in self.client.poll(now_ms) {
            self.handle_link_event(event, now_ms);
        }

        if self.client.connected() && now_ms.saturating_sub(self.last_ping_ms) >= PING_INTERVAL_MS
        {
            self.last_ping_ms = now_ms;
            if let Err(e) = self.client.ping() {
                warn!("display: ping failed: {e}");
            }
        }

        if self.is_error_state() {
            return;
        }

        if now_ms.saturating_sub(self.last_progress_ms) >= DISPLAY_TICK_MS {
            self.last_progress_ms = now_ms;
            self.run_progress(now_ms);
        }

        if now_ms.saturating_sub(self.last_control_ms) >= PROGRESS_INTERVAL_MS {
            self.last_control_ms = now_ms;
            self.emit_control(now_ms);
        }
    }

    // ── External inputs ───────────────────────────────────────

    /// Weight sample from a connected Bluetooth scale, grams.
    pub fn on_bluetooth_weight(&mut self, grams: f64, now_ms: u64) {
        self.last_bluetooth_ms = Some(now_ms);
        self.route_volumetric(grams, VolumetricSource::Bluetooth, now_ms);
    }

    /// Panel/touch brew button (machine-side buttons arrive over the
    /// link and land here too).
    pub fn brew_button(&mut self, pressed: bool, now_ms: u64) {
        self.update_last_action(now_ms);
        if pressed {
            match self.mode {
                Mode::Standby => self.set_mode(Mode::Brew, now_ms),
                Mode::Brew => {
                    if !self.is_active(now_ms) {
                        self.clear();
                        self.activate(now_ms);
                    } else if self.settings.momentary_buttons {
                        self.deactivate(now_ms);
                        self.clear();
                    }
                }
                Mode::Water => self.activate(now_ms),
                Mode::Steam => {
                    self.deactivate(now_ms);
                    self.set_mode(Mode::Brew, now_ms);
                }
                Mode::Grind => {}
            }
        } else if !self.settings.momentary_buttons {
            match self.mode {
                Mode::Brew | Mode::Water => {
                    if self.is_active(now_ms) {
                        self.deactivate(now_ms);
                    }
                    self.clear();
                }
                _ => {}
            }
        }
    }

    pub fn steam_button(&mut self, pressed: bool, now_ms: u64) {
        self.update_last_action(now_ms);
        if pressed {
            match self.mode {
                Mode::Standby | Mode::Brew => self.set_mode(Mode::Steam, now_ms),
                Mode::Steam => {
                    self.deactivate(now_ms);
                    self.set_mode(Mode::Brew, now_ms);
                }
                _ => {}
            }
        } else if !self.settings.momentary_buttons && self.mode == Mode::Steam {
            self.deactivate(now_ms);
            self.set_mode(Mode::Brew, now_ms);
        }
    }

    /// Start the selected process for the current mode.
    pub fn activate(&mut self, now_ms: u64) {
        if self.is_active(now_ms) || !self.is_ready() {
            return;
        }
        self.clear();
        if self.client.ready() {
            let _ = self.client.send_now(&Message::Tare);
        }

        self.volumetric_source = self.arbitrate_volumetric_source(now_ms);
        let target = if self.settings.volumetric_target
            && self.volumetric_source != VolumetricSource::Inactive
        {
            ProcessTarget::Volumetric
        } else {
            ProcessTarget::Time
        };

        let process = match self.mode {
            Mode::Brew => Process::Brew(BrewProcess::new(
                self.selected_profile().clone(),
                target,
                self.settings.brew_delay_ms,
                now_ms,
            )),
            Mode::Steam => Process::Steam(SteamProcess::new(self.settings.steam_pump_pct, now_ms)),
            Mode::Water => Process::Water(WaterProcess::new(now_ms)),
            Mode::Grind | Mode::Standby => return,
        };
        info!(
            "display: process start ({:?}, source {:?})",
            self.mode, self.volumetric_source
        );
        self.process_completed = false;
        self.current_process = Some(process);
        self.update_last_action(now_ms);
    }

    /// Start grinding through the alt relay.
    pub fn activate_grind(&mut self, now_ms: u64) {
        if self.is_active(now_ms) || !self.is_ready() {
            return;
        }
        self.clear();
        self.volumetric_source = self.arbitrate_volumetric_source(now_ms);
        let process = if self.settings.volumetric_target
            && self.volumetric_source != VolumetricSource::Inactive
        {
            GrindProcess::new(
                ProcessTarget::Volumetric,
                0,
                self.settings.target_grind_volume_g,
                self.settings.grind_delay_ms,
                now_ms,
            )
        } else {
            GrindProcess::new(
                ProcessTarget::Time,
                self.settings.target_grind_duration_ms,
                self.settings.target_grind_volume_g,
                0.0,
                now_ms,
            )
        };
        self.mode = Mode::Grind;
        self.process_completed = false;
        self.current_process = Some(Process::Grind(process));
        self.update_last_action(now_ms);
    }

    /// Run the built-in flush profile (always time-bounded, never
    /// learns a delay).
    pub fn flush(&mut self, now_ms: u64) {
        if self.is_active(now_ms) || self.mode != Mode::Brew {
            return;
        }
        self.clear();
        self.process_completed = false;
        self.current_process = Some(Process::Brew(BrewProcess::new(
            Profile::flush(self.settings.flush_duration_s),
            ProcessTarget::Time,
            self.settings.brew_delay_ms,
            now_ms,
        )));
        self.update_last_action(now_ms);
    }

    /// Request a machine-side PID autotune. Only from an idle machine;
    /// drops to standby for the duration.
    pub fn request_autotune(&mut self, test_time_s: u32, samples: u32, now_ms: u64) {
        if self.is_active(now_ms) || !self.is_ready() {
            return;
        }
        if self.mode != Mode::Standby {
            self.activate_standby(now_ms);
        }
        self.autotuning = true;
        let _ = self.client.send_now(&Message::Autotune(Autotune {
            test_time_s,
            samples,
        }));
    }

    pub fn set_mode(&mut self, mode: Mode, now_ms: u64) {
        if self.mode != mode {
            info!("display: mode {:?} -> {:?}", self.mode, mode);
        }
        self.steam_ready = false;
        self.mode = mode;
        self.update_last_action(now_ms);
    }

    pub fn activate_standby(&mut self, now_ms: u64) {
        self.set_mode(Mode::Standby, now_ms);
        self.deactivate(now_ms);
    }

    /// Flush dirty settings to the store.
    pub fn persist_settings(&mut self, store: &mut impl SettingsStore) {
        if self.settings.is_dirty() {
            self.settings.persist(store);
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.current_process
            .as_ref()
            .is_some_and(|p| p.is_active(now_ms))
    }

    pub fn is_error_state(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    pub fn is_ready(&self) -> bool {
        !self.is_error_state() && !self.autotuning
    }

    pub fn autotuning(&self) -> bool {
        self.autotuning
    }

    pub fn connected(&self) -> bool {
        self.client.ready()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry
    }

    pub fn volumetric_source(&self) -> VolumetricSource {
        self.volumetric_source
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bluetooth_scale_healthy(&self, now_ms: u64) -> bool {
        self.last_bluetooth_ms
            .is_some_and(|t| now_ms.saturating_sub(t) < BLUETOOTH_GRACE_PERIOD_MS)
    }

    /// Volumetric targeting is available when a healthy scale or a
    /// dimming-capable machine is present.
    pub fn volumetric_available(&self, now_ms: u64) -> bool {
        self.bluetooth_scale_healthy(now_ms) || self.machine_dims()
    }

    pub fn target_temp_c(&self) -> f32 {
        match self.mode {
            Mode::Brew | Mode::Grind => match &self.current_process {
                Some(Process::Brew(brew)) if brew.is_active() => brew.temperature_c(),
                _ => self.selected_profile().temperature_c,
            },
            Mode::Steam => self.settings.target_steam_temp_c,
            Mode::Water => self.settings.target_water_temp_c,
            Mode::Standby => 0.0,
        }
    }

    // ── Internal: link events ─────────────────────────────────

    fn handle_link_event(&mut self, event: ClientEvent, now_ms: u64) {
        match event {
            ClientEvent::Connected => {}
            ClientEvent::Ready(info) => self.on_system_info(info),
            ClientEvent::Message(msg) => self.handle_message(msg, now_ms),
            ClientEvent::Protocol(e) => warn!("display: dropped frame: {e}"),
            ClientEvent::LinkDead => {
                warn!("display: link dead, awaiting transport re-scan");
            }
            ClientEvent::Disconnected => {
                self.system_info = None;
            }
        }
    }

    /// Post-handshake configuration, in the required order: pressure
    /// scale, pump model, PID tunings.
    fn on_system_info(&mut self, info: SystemInfo) {
        if info.capabilities.pressure {
            let _ = self
                .client
                .send_now(&Message::PressureScale(self.settings.pressure_scale_bar));
        }
        if info.capabilities.dimming {
            if let Some(model) = self.settings.pump_model {
                let _ = self.client.send_now(&Message::PumpModel(model));
            }
        }
        let _ = self.client.send_now(&Message::PidSettings(self.settings.pid));
        self.system_info = Some(info);
    }

    fn handle_message(&mut self, msg: Message, now_ms: u64) {
        match msg {
            Message::SensorData(data) => {
                self.telemetry.temperature_c =
                    data.temperature_c - self.settings.temperature_offset_c;
                self.telemetry.pressure_bar = data.pressure_bar;
                self.telemetry.pump_flow_mlps = data.pump_flow_mlps;
                self.telemetry.puck_flow_mlps = data.puck_flow_mlps;
                self.telemetry.puck_resistance = data.puck_resistance;
            }
            Message::Volumetric(volume) => {
                self.route_volumetric(f64::from(volume), VolumetricSource::FlowEstimation, now_ms);
            }
            Message::BrewButton(pressed) => self.brew_button(pressed, now_ms),
            Message::SteamButton(pressed) => self.steam_button(pressed, now_ms),
            Message::Error(code) => self.on_machine_error(code, now_ms),
            Message::AutotuneResult(result) => {
                info!(
                    "display: autotune result kp={:.3} ki={:.3} kd={:.3}",
                    result.kp, result.ki, result.kd
                );
                self.settings.set_pid(PidSettings {
                    kp: result.kp,
                    ki: result.ki,
                    kd: result.kd,
                });
                self.autotuning = false;
            }
            Message::Tof(distance) => {
                self.telemetry.tof_distance_mm = distance;
            }
            other => warn!("display: unexpected message {:?}", other.message_type()),
        }
    }

    fn on_machine_error(&mut self, code: ErrorCode, now_ms: u64) {
        match code {
            // Modal until the user restarts the machine.
            ErrorCode::Runaway => {
                if self.error != Some(code) {
                    error!("display: machine reported {code}");
                    self.error = Some(code);
                    self.deactivate(now_ms);
                    self.set_mode(Mode::Standby, now_ms);
                }
            }
            // Shows as a disconnect; clears when pings resume.
            ErrorCode::Timeout => {}
            // Link-level noise, recovered by the next tick.
            ErrorCode::CommSend | ErrorCode::CommRecv | ErrorCode::ProtoErr => {
                warn!("display: machine reported {code}");
            }
        }
    }

    // ── Internal: process lifecycle ───────────────────────────

    fn run_progress(&mut self, now_ms: u64) {
        // Steam readiness: auto-start once the boiler is close enough.
        if self.mode == Mode::Steam
            && !self.steam_ready
            && self.telemetry.temperature_c + STEAM_READY_BAND_C > self.target_temp_c()
        {
            self.activate(now_ms);
            self.steam_ready = true;
        }

        let mut process_finished = false;
        if let Some(process) = &mut self.current_process {
            if let Process::Brew(brew) = process {
                brew.update_pressure(self.telemetry.pressure_bar);
                brew.update_flow(self.telemetry.pump_flow_mlps);
            }
            process.progress(now_ms);
            process_finished = !process.is_active(now_ms);
        }
        if process_finished {
            self.deactivate(now_ms);
        }

        // Let a parked brew/grind keep integrating until its predictive
        // window closes, then learn the new delay once.
        if let Some(last) = &mut self.last_process {
            if !last.is_complete(now_ms) {
                last.progress(now_ms);
            }
        }
        if let Some(last) = &self.last_process {
            if last.is_complete(now_ms) && !self.process_completed {
                self.process_completed = true;
                if self.settings.delay_adjust {
                    self.learn_delay(now_ms);
                }
            }
        }

        if self.mode != Mode::Standby
            && now_ms.saturating_sub(self.last_action_ms) > self.settings.standby_timeout_ms
        {
            info!("display: standby timeout");
            self.activate_standby(now_ms);
        }
    }

    fn learn_delay(&mut self, _now_ms: u64) {
        match &self.last_process {
            Some(Process::Brew(brew))
                if brew.target == ProcessTarget::Volumetric && !brew.utility() =>
            {
                let delay = brew.new_delay_ms();
                info!("display: learned brew delay {delay:.0} ms");
                self.settings.set_brew_delay_ms(delay);
            }
            Some(Process::Grind(grind)) if grind.target == ProcessTarget::Volumetric => {
                let delay = grind.new_delay_ms();
                info!("display: learned grind delay {delay:.0} ms");
                self.settings.set_grind_delay_ms(delay);
            }
            _ => {}
        }
    }

    fn deactivate(&mut self, now_ms: u64) {
        if self.current_process.is_none() {
            return;
        }
        self.last_process = self.current_process.take();
        self.update_last_action(now_ms);
    }

    fn clear(&mut self) {
        self.process_completed = true;
        self.last_process = None;
        self.volumetric_source = VolumetricSource::Inactive;
    }

    fn route_volumetric(&mut self, volume: f64, source: VolumetricSource, now_ms: u64) {
        if self.volumetric_source != source {
            // Committed to another source (or none): record health only.
            return;
        }
        if let Some(p) = &mut self.current_process {
            p.update_volume(now_ms, volume);
        }
        if let Some(p) = &mut self.last_process {
            p.update_volume(now_ms, volume);
        }
    }

    fn arbitrate_volumetric_source(&self, now_ms: u64) -> VolumetricSource {
        if self.bluetooth_scale_healthy(now_ms) {
            VolumetricSource::Bluetooth
        } else if self.machine_dims() {
            VolumetricSource::FlowEstimation
        } else {
            VolumetricSource::Inactive
        }
    }

    fn machine_dims(&self) -> bool {
        self.system_info
            .as_ref()
            .is_some_and(|i| i.capabilities.dimming)
    }

    fn machine_has_pressure(&self) -> bool {
        self.system_info
            .as_ref()
            .is_some_and(|i| i.capabilities.pressure)
    }

    fn selected_profile(&self) -> &Profile {
        // `new` guarantees at least one profile.
        self.profiles
            .iter()
            .find(|p| p.id == self.settings.selected_profile_id)
            .unwrap_or(&self.profiles[0])
    }

    fn update_last_action(&mut self, now_ms: u64) {
        self.last_action_ms = now_ms;
    }

    // ── Internal: control emission ────────────────────────────

    fn emit_control(&mut self, now_ms: u64) {
        if !self.client.ready() {
            return;
        }

        let mut target_temp = self.target_temp_c();
        if target_temp > 0.0 {
            target_temp += self.settings.temperature_offset_c;
        }

        let active = self.is_active(now_ms);
        let (valve, pump, alt) = match (&self.current_process, active) {
            (Some(p), true) => (p.valve_open(), p.pump_command(now_ms), p.alt_on()),
            _ => (false, PumpCommand::Off, false),
        };

        let control = match pump {
            // Steam assist on pressure machines runs as a capped flow
            // target so the pump cannot dead-head against a closed path.
            PumpCommand::Simple(pct)
                if active && self.machine_has_pressure() && self.mode == Mode::Steam =>
            {
                OutputControl {
                    mode: OutputMode::Advanced,
                    valve_open: valve,
                    boiler_setpoint_c: target_temp,
                    pump_setpoint_pct: pct,
                    advanced: Some(AdvancedPump {
                        target: PumpTarget::Flow,
                        pressure_bar: self.settings.steam_pump_cutoff_bar,
                        flow_mlps: pct * 0.1,
                    }),
                }
            }
            PumpCommand::Advanced(adv) if active && self.machine_has_pressure() => OutputControl {
                mode: OutputMode::Advanced,
                valve_open: valve,
                boiler_setpoint_c: target_temp,
                pump_setpoint_pct: 100.0,
                advanced: Some(adv),
            },
            PumpCommand::Simple(pct) => OutputControl {
                mode: OutputMode::Basic,
                valve_open: valve,
                boiler_setpoint_c: target_temp,
                pump_setpoint_pct: pct,
                advanced: None,
            },
            // Advanced demand against a machine without pressure
            // sensing degrades to full basic power.
            PumpCommand::Advanced(_) => OutputControl {
                mode: OutputMode::Basic,
                valve_open: valve,
                boiler_setpoint_c: target_temp,
                pump_setpoint_pct: 100.0,
                advanced: None,
            },
            PumpCommand::Off => OutputControl {
                mode: OutputMode::Basic,
                valve_open: valve,
                boiler_setpoint_c: target_temp,
                pump_setpoint_pct: 0.0,
                advanced: None,
            },
        };

        if let Err(e) = self.client.enqueue(Message::OutputControl(control)) {
            warn!("display: control frame dropped: {e}");
        }
        if let Err(e) = self.client.enqueue(Message::AltControl(alt)) {
            warn!("display: alt frame dropped: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
