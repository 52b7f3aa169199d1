//! Crema controller library.
//!
//! Two cooperating nodes built from the same crate:
//!
//! - [`machine`] — the real-time node driving the boiler heater, pump,
//!   valve and alt relay from sensor feedback;
//! - [`display`] — the supervising node owning user intent, brew
//!   profiles, process state machines and telemetry;
//! - [`link`] — the framed message protocol that joins them over any
//!   ordered byte transport.
//!
//! Everything is driven by explicit `now_ms` ticks, so the whole system
//! runs identically under a virtual clock ([`sim`]) and on hardware.

#![deny(unused_must_use)]

pub mod config;
pub mod display;
pub mod error;
pub mod link;
pub mod machine;
pub mod sim;
