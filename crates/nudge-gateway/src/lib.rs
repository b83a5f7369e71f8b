//! # Nudge Gateway
//! HTTP admin API for the campaign: trigger passes, record completions,
//! rebase reminder clocks, manage content and inspect status.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
