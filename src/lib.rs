//! Hierarchical virtual power plant control plane
//!
//! One binary, three roles: node controller (one BESS), campus aggregator
//! (a site of nodes), and grid tier (frequency monitor + droop controller).
//! Control flows PMU -> monitor -> droop -> campus -> node -> inverter;
//! telemetry flows the reverse.

pub mod api;
pub mod campus;
pub mod config;
pub mod domain;
pub mod grid;
pub mod hardware;
pub mod node;
pub mod safety;
pub mod telemetry;
