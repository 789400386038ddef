//! # piped
//!
//! HTTP service that streams query results and byte resources as delimited
//! text.
//!
//! ```text
//! GET /download?url=jdbc:postgresql://db:5432/app&table=orders&printHeader=true
//!
//!  client ◀── body channel ◀── ChannelWriter ◀── RowEncoder ◀── CursorReader ◀── pool
//! ```
//!
//! See [`server`] for the routes and [`config`] for the YAML layout.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod body;
#[allow(missing_docs)]
pub mod cli;
pub mod config;
pub mod server;

pub use cli::{Cli, Command};
pub use config::PipedConfig;
pub use server::{create_router, serve, AppState};
