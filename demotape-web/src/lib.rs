//! Demotape Web - streaming endpoint and JSON admin API

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! Serves protected track streams to shop visitors and exposes the batch
//! format worker, owner notices and demo cache to the shop backend.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, build_router, run_server};
