//! Live collaborative backend for sparse spreadsheet tables.
//!
//! Many clients view and edit the same table at once. Every mutation goes
//! through a single coordinator task per table, so all viewers observe the
//! same order of writes. Each module has one concrete responsibility:
//!
//! - [`cli`] parses the command-line interface.
//! - [`protocol`] splits inbound `verb payload` frames and encodes JSON replies.
//! - [`store`] holds cells and table metadata, in memory or in SQLite.
//! - [`coordinator`] owns each table's viewers and applies commands in order;
//!   [`coordinator::Hub`] starts one coordinator per table on demand.
//! - [`connection`] pumps frames between a WebSocket and its coordinator.
//! - [`server`] exposes the axum routes and graceful shutdown.
//!
//! Integration tests drive the coordinator and router directly through this
//! crate.

pub mod cli;
pub mod connection;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod store;
