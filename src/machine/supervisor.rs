//! Machine supervisor: exclusive owner of every actuator.
//!
//! All heater, pump, valve and alt mutations flow through this type.
//! Inbound link messages are applied here, telemetry is emitted here, and
//! the two safety latches live here:
//!
//! - **ping timeout** — no ping for 10 s forces SafeShutdown, held until
//!   the next ping arrives;
//! - **thermal runaway** — SafeShutdown latched until device reset; no
//!   later `OutputControl` can re-enable the heater.
//!
//! SafeShutdown means heater setpoint 0, pump power 0, valve closed, alt
//! off.

use log::{debug, error, info, warn};

use crate::config::{MachineConfig, CONTROL_LOOP_DT, PING_TIMEOUT_MS, TEMP_SAMPLE_MS};
use crate::error::{SafetyError, SensorError};
use crate::link::messages::{
    Message, OutputControl, OutputMode, PidSettings, PumpTarget, SensorData, SystemInfo,
};
use crate::link::server::{LinkServer, ServerEvent};
use crate::link::transport::LinkTransport;
use crate::machine::heater::{Heater, HeaterEvent};
use crate::machine::ports::MachineIo;
use crate::machine::pump::{DimmedPump, Pump, SimplePump};
use crate::machine::sensors::DebouncedInput;
use crate::machine::thermal::BoilerSensor;

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Polarity-aware relay state.
pub struct Relay {
    on_high: bool,
    on: bool,
}

impl Relay {
    pub fn new(on_high: bool) -> Self {
        Self { on_high, on: false }
    }

    pub fn set(&mut self, on: bool) {
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Pin level realising the current state.
    pub fn level(&self) -> bool {
        self.on == self.on_high
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct MachineSupervisor<T: LinkTransport> {
    config: MachineConfig,
    link: LinkServer<T>,

    heater: Heater,
    boiler: BoilerSensor,
    pump: Pump,
    valve: Relay,
    alt: Relay,

    brew_btn: DebouncedInput,
    steam_btn: DebouncedInput,

    runaway_latched: bool,
    timeout_active: bool,

    last_temp_c: f32,
}

impl<T: LinkTransport> MachineSupervisor<T> {
    pub fn new(config: MachineConfig, transport: T, tunings: PidSettings) -> Self {
        let info = SystemInfo {
            hardware: heapless::String::try_from(config.name).unwrap_or_default(),
            version: heapless::String::try_from(config.version).unwrap_or_default(),
            capabilities: config.capabilities,
        };
        let pump = if config.capabilities.dimming {
            Pump::Dimmed(Box::new(DimmedPump::new(CONTROL_LOOP_DT)))
        } else {
            Pump::Simple(SimplePump::new(config.ssr_pump, true))
        };

        Self {
            valve: Relay::new(config.valve_on_high),
            alt: Relay::new(config.alt_on_high),
            link: LinkServer::new(transport, info),
            heater: Heater::new(tunings),
            boiler: BoilerSensor::new(),
            pump,
            brew_btn: DebouncedInput::new(),
            steam_btn: DebouncedInput::new(),
            runaway_latched: false,
            timeout_active: false,
            last_temp_c: 0.0,
            config,
        }
    }

    // ── Periodic tasks ────────────────────────────────────────

    /// 250 ms: boiler acquisition and heater control.
    pub fn tick_thermal(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        let dt = TEMP_SAMPLE_MS as f32 / 1_000.0;

        match self.boiler.record(io.read_boiler_c()) {
            Ok(temp) => {
                self.last_temp_c = temp;
                match self.heater.tick(temp, now_ms, dt) {
                    Some(HeaterEvent::RunawayFired) => self.trip_runaway(io),
                    Some(HeaterEvent::AutotuneDone(result)) => {
                        if let Err(e) = self.link.send_now(&Message::AutotuneResult(result)) {
                            warn!("supervisor: autotune result not delivered: {e}");
                        }
                    }
                    Some(HeaterEvent::AutotuneFailed) | None => {}
                }
            }
            Err(SensorError::Unhealthy) => {
                // A dead thermocouple is indistinguishable from a stuck
                // boiler; treat it as a runaway.
                self.heater.disable();
                if !self.runaway_latched {
                    error!("supervisor: boiler sensor unhealthy, shutting down");
                    self.trip_runaway(io);
                }
            }
            Err(e) => warn!("supervisor: boiler sample dropped: {e}"),
        }

        io.heater_pin(self.heater.pin_state(now_ms));
    }

    /// 30 ms: pump control loop and heater window output.
    pub fn tick_control(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        self.pump.control_tick(io, now_ms);
        io.heater_pin(self.heater.pin_state(now_ms));
    }

    /// Mains zero crossing (dimmed boards only).
    pub fn on_zero_cross(&mut self, io: &mut impl MachineIo) {
        if let Some(dimmed) = self.pump.as_dimmed_mut() {
            dimmed.on_zero_cross(io);
        }
    }

    /// 250 ms: link, watchdog, buttons, telemetry.
    pub fn tick_supervisor(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        if let Some(edge) = self.brew_btn.update(io.brew_button_level(), now_ms) {
            let _ = self.link.send_now(&Message::BrewButton(edge));
        }
        if let Some(edge) = self.steam_btn.update(io.steam_button_level(), now_ms) {
            let _ = self.link.send_now(&Message::SteamButton(edge));
        }

        for event in self.link.poll(now_ms) {
            match event {
                ServerEvent::Message(msg) => self.apply_message(msg, io, now_ms),
                // One bad frame: discarded, no state change, no peer
                // notification. The link layer already rate-tracks it.
                ServerEvent::Protocol(e) => debug!("supervisor: frame dropped: {e}"),
                ServerEvent::ResetRequested => {
                    warn!("supervisor: repeated protocol errors; link reset requested");
                }
                ServerEvent::Connected | ServerEvent::Disconnected => {}
            }
        }

        self.run_watchdog(io, now_ms);

        if self.link.connected() {
            self.emit_telemetry();
        }
    }

    // ── Queries (tests and the simulator observe through these) ──

    pub fn shutdown_active(&self) -> bool {
        self.runaway_latched || self.timeout_active
    }

    pub fn runaway_latched(&self) -> bool {
        self.runaway_latched
    }

    pub fn heater_setpoint_c(&self) -> f32 {
        self.heater.setpoint_c()
    }

    pub fn heater_duty(&self) -> f32 {
        self.heater.duty()
    }

    pub fn pump_power(&self) -> f32 {
        self.pump.power()
    }

    pub fn valve_open(&self) -> bool {
        self.valve.is_on()
    }

    pub fn alt_on(&self) -> bool {
        self.alt.is_on()
    }

    pub fn boiler_temp_c(&self) -> f32 {
        self.last_temp_c
    }

    pub fn link_connected(&self) -> bool {
        self.link.connected()
    }

    // ── Internal ──────────────────────────────────────────────

    fn apply_message(&mut self, msg: Message, io: &mut impl MachineIo, now_ms: u64) {
        match msg {
            Message::OutputControl(c) => self.apply_output_control(&c, io),
            Message::AltControl(on) => {
                if !self.shutdown_active() {
                    self.alt.set(on);
                    io.alt_pin(self.alt.level());
                }
            }
            Message::PidSettings(s) => self.heater.set_tunings(s),
            Message::PumpModel(model) => {
                if let Some(dimmed) = self.pump.as_dimmed_mut() {
                    dimmed.set_pump_model(model);
                }
            }
            Message::Autotune(a) => {
                self.heater.start_autotune(a.test_time_s, a.samples, now_ms);
            }
            Message::Tare => {
                if let Some(dimmed) = self.pump.as_dimmed_mut() {
                    dimmed.tare();
                }
            }
            Message::PressureScale(scale) => {
                if self.config.capabilities.pressure {
                    if let Some(dimmed) = self.pump.as_dimmed_mut() {
                        dimmed.set_pressure_scale(scale);
                    }
                }
            }
            Message::LedControl(led) => {
                // Peripheral-port device; handled outside the core.
                debug!("supervisor: led channel {} -> {}", led.channel, led.brightness);
            }
            other => warn!("supervisor: unexpected message {:?}", other.message_type()),
        }
    }

    fn apply_output_control(&mut self, c: &OutputControl, io: &mut impl MachineIo) {
        if self.shutdown_active() {
            // Latched SafeShutdown: control frames are inert. Runaway
            // holds until reset; timeout holds until the next ping.
            debug!("supervisor: control ignored during shutdown");
            return;
        }

        self.heater.set_setpoint(c.boiler_setpoint_c);
        self.valve.set(c.valve_open);
        io.valve_pin(self.valve.level());

        let advanced = if c.mode == OutputMode::Advanced {
            c.advanced
        } else {
            None
        };
        if let Some(dimmed) = self.pump.as_dimmed_mut() {
            dimmed.set_valve_state(c.valve_open);
            match advanced {
                Some(adv) => match adv.target {
                    PumpTarget::Pressure => {
                        dimmed.set_pressure_target(adv.pressure_bar, adv.flow_mlps);
                    }
                    PumpTarget::Flow => {
                        dimmed.set_flow_target(adv.flow_mlps, adv.pressure_bar);
                    }
                },
                None => dimmed.set_power(c.pump_setpoint_pct),
            }
        } else {
            // Advanced requests degrade to the basic setpoint on
            // non-dimming boards.
            self.pump.set_power(c.pump_setpoint_pct);
        }
    }

    fn run_watchdog(&mut self, io: &mut impl MachineIo, now_ms: u64) {
        let Some(age) = self.link.ping_age_ms(now_ms) else {
            return; // no client has connected yet
        };

        if age > PING_TIMEOUT_MS {
            if !self.timeout_active {
                error!("supervisor: ping timeout ({age} ms), safe shutdown");
                self.timeout_active = true;
                self.safe_shutdown(io);
                let _ = self
                    .link
                    .send_now(&Message::Error(SafetyError::PingTimeout.code()));
            }
        } else if self.timeout_active {
            info!("supervisor: ping resumed, timeout cleared");
            self.timeout_active = false;
        }
    }

    fn trip_runaway(&mut self, io: &mut impl MachineIo) {
        self.runaway_latched = true;
        self.safe_shutdown(io);
        let _ = self
            .link
            .send_now(&Message::Error(SafetyError::ThermalRunaway.code()));
    }

    /// Heater 0, pump 0, valve closed, alt off.
    fn safe_shutdown(&mut self, io: &mut impl MachineIo) {
        self.heater.set_setpoint(0.0);
        self.pump.set_power(0.0);
        self.valve.set(false);
        self.alt.set(false);
        if let Some(dimmed) = self.pump.as_dimmed_mut() {
            dimmed.set_valve_state(false);
        }
        io.heater_pin(false);
        io.pump_pin(false);
        io.pump_dac_volts(0.0);
        io.valve_pin(self.valve.level());
        io.alt_pin(self.alt.level());
    }

    fn emit_telemetry(&mut self) {
        let frame = match self.pump.as_dimmed() {
            Some(dimmed) if self.config.capabilities.pressure => SensorData {
                temperature_c: self.last_temp_c,
                pressure_bar: dimmed.pressure_bar(),
                pump_flow_mlps: dimmed.pump_flow_mlps(),
                puck_flow_mlps: dimmed.puck_flow_mlps(),
                puck_resistance: dimmed.puck_resistance(),
            },
            _ => SensorData {
                temperature_c: self.last_temp_c,
                ..SensorData::default()
            },
        };
        let _ = self.link.enqueue(Message::SensorData(frame));

        if let Some(dimmed) = self.pump.as_dimmed() {
            let _ = self
                .link
                .enqueue(Message::Volumetric(dimmed.coffee_volume_ml()));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
