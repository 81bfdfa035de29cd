//! Dormant - scheduled shutdown and wake-up of Cluster API node groups
//!
//! Dormant zeroes a cluster's worker capacity outside working hours and
//! brings it back in dependency order, without fighting the cluster
//! autoscaler over desired node counts. It is invoked once per phase (`stop`
//! or `start`), possibly on different hosts, and hands state between phases
//! through a persisted state directory.
//!
//! # Architecture
//!
//! - The autoscaler is disabled before any node group is touched, and its
//!   replica count is captured first (state-before-mutate)
//! - Node groups are drained (cordon, then budget-respecting eviction) and
//!   scaled to `{min: 0, desired: 0, max: max(1, max)}`
//! - On start, critical capacity is checked, captured bounds are restored,
//!   admission webhooks and declared services are awaited in order, and the
//!   autoscaler is re-enabled
//!
//! # Modules
//!
//! - [`orchestrator`] - Stop/start state machine and its report
//! - [`autoscaler`] - Autoscaler discovery, disable and restore
//! - [`eviction`] - Cordon and drain
//! - [`nodegroup`] - Node-group capture, scaling and convergence
//! - [`bootstrap`] - Critical capacity check before scale-up
//! - [`webhook`] - Admission webhook readiness gate
//! - [`graph`] - Service dependency ordering
//! - [`state`] - Durable capture records
//! - [`cluster`] - Control-plane access contract and its Kubernetes binding
//! - [`retry`] - Timeout and backoff shared by every remote call
//! - [`config`] - YAML configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod autoscaler;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod eviction;
pub mod graph;
pub mod nodegroup;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default directory for captured state, relative to the working directory
pub const DEFAULT_STATE_DIR: &str = ".dormant-state";
