//! Session broker for live radar feeds.
//!
//! One publisher streams game state into a session; any number of viewers
//! attach to the session by id and receive every state the publisher sends.
//! Modules, leaves first:
//!
//! - [`radar`] defines the `RadarState` payload forwarded verbatim.
//! - [`message`] is the `{ type, payload }` JSON codec for the three message
//!   families.
//! - [`handshake`] negotiates the protocol version and models the viewer's
//!   connection lifecycle.
//! - [`transport`] turns TCP sockets and WebSockets into streams of text
//!   frames.
//! - [`registry`] tracks sessions, their publisher and subscribers, and fans
//!   states out without blocking.
//! - [`connection`] drives one broker-side connection through its roles.
//! - [`broker`] and [`http`] accept connections; [`config`] holds their
//!   settings.
//! - [`client`] and [`publisher`] are the two ends of a session;
//!   [`generator`] produces synthetic states for demos.
//! - [`cli`] parses the command line of the `radar_relay` binary.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod generator;
pub mod handshake;
pub mod http;
pub mod message;
pub mod publisher;
pub mod radar;
pub mod registry;
pub mod transport;
