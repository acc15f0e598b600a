//! Minimal TCP chat relay.
//!
//! A server accepts any number of clients and relays every chunk of bytes it
//! reads from one client to all the others, prefixed with the sender's
//! address. A client prints whatever arrives and sends what the operator
//! types. There is no framing: bytes travel exactly as written.
//!
//! - [`registry`] owns the live connection set and the broadcast fan-out.
//! - [`server`] runs the accept loop and one handler task per connection.
//! - [`client`] connects, runs the background listener in `KEEPALIVE` or
//!   `TIMEOUT` mode, and drives the operator input loop.
//! - [`message`] holds the wire conventions shared by both sides.
//! - [`config`] and [`cli`] resolve settings from flags and an optional TOML file.
//! - [`error`] defines the typed errors returned by the library.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
