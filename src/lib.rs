//! Cluster bootstrap - bring up a self-hosted Kubernetes control plane
//!
//! A bootstrap run starts a temporary control plane from static pod
//! manifests, creates the cluster's assets through it, waits until the
//! self-hosted control plane pods are running and ready, and then removes the
//! temporary control plane again.
//!
//! # Modules
//!
//! - [`stager`] - Stages and tears down the temporary control plane on disk
//! - [`readiness`] - Tracks whether the required control plane pods are ready
//! - [`applier`] - Creates asset manifests in the background
//! - [`orchestrator`] - The bootstrap state machine
//! - [`config`] - Bootstrap configuration, timeouts and required pods
//! - [`start`] - Production wiring of the above
//! - [`assets`] - Layout of the asset directory

#![deny(missing_docs)]

pub mod applier;
pub mod assets;
pub mod config;
pub mod orchestrator;
pub mod readiness;
pub mod stager;
pub mod start;

pub use bootstrap_common::{Error, Result};
