//! Client-side engine for the experiments panel of the router dashboard.
//!
//! Starts long-running backend evaluation jobs, tracks their lifecycle by
//! polling, consumes the live log stream under a fixed memory bound, and
//! guarantees clean cancellation of all background work.

pub mod api;
pub mod config;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod poller;
pub mod runner;
pub mod stream;
