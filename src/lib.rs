//! isecl-k8s-controller: host trust attestation controller for Kubernetes
//!
//! This crate mirrors the HostAttributes trust reports published by the
//! attestation service onto node labels, annotations and taints, and taints
//! nodes that register or reboot until they are attested again.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
