//! KProxy: a transparent, content-inspecting filter for home networks.
//!
//! The crate is organized around the interception pipeline: [`dns`] rewrites
//! name resolution so clients connect to the proxy, [`ca`] mints the
//! certificates that make TLS termination possible, [`proxy`] enforces
//! [`policy`] per request, and [`usage`] accounts for time spent per device
//! and category. [`app`] owns startup, shutdown, and the wiring in between.

pub mod app;
pub mod ca;
pub mod config;
pub mod dns;
pub mod policy;
pub mod proxy;
pub mod serdes;
pub mod store;
pub mod telemetry;
pub mod usage;

pub use serdes::{serde_dur, serde_dur_option};
