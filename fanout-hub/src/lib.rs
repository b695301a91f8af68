//! WebSocket fan-out hub: every message a client sends is delivered to every
//! connected client.
//!
//! The moving parts, leaf to root:
//!
//! - [`connection`] abstracts a framed, bidirectional transport, split into a
//!   reader half and a writer half that share an idempotent close.
//! - [`message`] normalizes inbound payloads and coalesces outbound ones.
//! - [`hub`] owns the client registry inside a single dispatch task and fans
//!   broadcasts out with non-blocking sends, evicting clients that fall behind.
//! - [`client`] wraps an accepted connection, registers it, and runs its read
//!   and write pumps.
//! - [`ws`] adapts axum WebSockets to [`connection::Connection`] and hosts the
//!   upgrade handler; [`server`] wires the router, the hub, and shutdown.
//! - [`cli`] and [`terminal`] provide the `serve` and `client` commands.
//!
//! Integration tests drive the hub and pumps over in-memory connections as
//! well as real WebSocket clients.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod server;
pub mod terminal;
pub mod ws;
