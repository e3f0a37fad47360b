//! Chat relay that bridges browser WebSockets and one Kafka topic per pod.
//!
//! See `README.md` for running it against Kafka or on its own. Every
//! message a client sends is published to the pod's topic, and every record
//! on that topic is sent to every client connected to this pod. Each module
//! focuses on one part of that loop:
//!
//! - [`gateway`] adapts the log: a Kafka implementation and an in-memory one.
//! - [`registry`] keeps the connected clients behind one lock and fans
//!   records out to them.
//! - [`inbound`] reads one client's frames and publishes them.
//! - [`outbound`] consumes the topic and broadcasts every record, reconnecting
//!   when the subscription drops.
//! - [`lifecycle`] takes an upgraded socket from registration to teardown.
//! - [`server`] wires the HTTP routes, the outbound relay and shutdown.
//! - [`cli`], [`identity`], [`message`] and [`page`] hold configuration, the
//!   pod name, message normalization and the chat page.
//!
//! [`testing`] provides recording sinks used by the unit and integration
//! tests to stand in for sockets.

pub mod cli;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod inbound;
pub mod lifecycle;
pub mod message;
pub mod outbound;
pub mod page;
pub mod registry;
pub mod server;
pub mod testing;
