//! # Cadence Gateway
//!
//! Axum HTTP surface over the scheduler: the tick entry point, the manual
//! trigger, lead-enrichment webhooks, run launch/status/control, reply
//! approval and the send log.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
