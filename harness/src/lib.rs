// Copyright 2024 Oxide Computer Company

//! Fault injection runs against a replicated block storage cluster.
//!
//! A run provisions pools, replicas and a mirrored nexus across the storage
//! nodes, drives fio at the published nexus and hard kills one replica node
//! while the load is running.  The nexus must then report itself degraded
//! with the killed node's child faulted.  Whatever the outcome, everything
//! that was created is destroyed again.

pub mod config;
mod error;
pub mod fault;
pub mod lifecycle;
pub mod load;
pub mod node;
pub mod nvme;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod substrate;
pub mod topology;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
