//! Fleet control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but the components
//! are exposed as a library for integration testing and embedding.

pub mod api;
pub mod autoscaler;
pub mod balancer;
pub mod circuit;
pub mod config;
pub mod drain;
pub mod events;
pub mod forwarder;
pub mod policy;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod tokens;
pub mod workers;
