//! The telemon collector server: an axum router over the metric service,
//! plus the background snapshot task.

pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod persist;
pub mod service;
pub mod state;
