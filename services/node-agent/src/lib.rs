//! Fleet node agent library.
//!
//! The node agent runs on each CI worker host. It samples local CPU, memory
//! and disk usage, classifies them with a [`fleet_health::HealthMonitor`]
//! and reports the result to the control plane as signed heartbeats.
//!
//! ## Modules
//!
//! - `config`: environment-driven configuration
//! - `sampler`: `sysinfo`-backed metrics source
//! - `client`: registration and heartbeat calls to the control plane
//! - `heartbeat`: the periodic heartbeat loop

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod sampler;

pub use client::{ControlPlaneClient, HeartbeatAck, HeartbeatOutcome, NodeRegistration};
pub use config::Config;
pub use heartbeat::{run_heartbeat_loop, ActiveJobs, Heartbeat};
pub use sampler::SysinfoSource;
