//! Shared plumbing for cluster bootstrap: errors, cancellation, retries,
//! manifests, kube clients and cluster event markers.

#![deny(missing_docs)]

pub mod cancel;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod manifests;
pub mod retry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
