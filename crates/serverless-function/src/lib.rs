//! Function reconciliation engine
//!
//! Turns a `Function` into a source ConfigMap or resolved commit, an image
//! build Job, a Deployment, a Service and an optional autoscaler. Each
//! reconcile pass loads a [`snapshot::SystemState`] and runs the stages in
//! [`fsm`] until one of them issues a write or the chain completes.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod diff;
pub mod docker;
pub mod fsm;
pub mod gate;
pub mod health;
pub mod phases;
pub mod resources;
pub mod runtime;
pub mod snapshot;
pub mod source;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{KubeClient, KubeClientImpl};
pub use config::{BuildConfig, FunctionConfig, RequeueConfig};
pub use controller::{
    error_policy, forget_missing, reconcile, run_health_worker, Context, ContextBuilder,
};
pub use health::{health_channels, HealthChecker, HealthError, HealthResponder};

pub use serverless_common::{Error, Result};
