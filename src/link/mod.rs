//! Framed message link between the two nodes.
//!
//! ```text
//!  Display node                          Machine node
//!  ┌───────────┐   frames over an       ┌───────────┐
//!  │ LinkClient │◀──ordered byte pipe──▶│ LinkServer │
//!  └───────────┘   (LinkTransport)      └───────────┘
//! ```
//!
//! `codec` owns the frame layout, `messages` the payload schema, `queue`
//! the outbound coalescing policy, and `server`/`client` the per-node
//! protocol obligations (handshake, watchdog clock, liveness).

pub mod client;
pub mod codec;
pub mod messages;
pub mod queue;
pub mod server;
pub mod transport;
