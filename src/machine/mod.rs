//! Machine node: real-time thermal and hydraulic control.
//!
//! ```text
//!  boiler ──▶ BoilerSensor ──▶ Heater (PID/autotune/runaway) ──▶ heater pin
//!  ADC    ──▶ PressureSensor ─┐
//!  tach   ──▶ RpmSensor ──────┼─▶ PressureController ──▶ Pump ──▶ PSM/DAC
//!  mains  ──▶ zero-cross ─────┘
//!
//!  LinkServer ◀──▶ MachineSupervisor (owns every actuator)
//! ```
//!
//! Task periods: thermal 250 ms, control loop 30 ms, supervisor 250 ms,
//! zero-cross event-driven.

pub mod estimator;
pub mod flow_map;
pub mod heater;
pub mod ports;
pub mod pressure;
pub mod pump;
pub mod sensors;
pub mod supervisor;
pub mod thermal;

pub use ports::MachineIo;
pub use supervisor::MachineSupervisor;
