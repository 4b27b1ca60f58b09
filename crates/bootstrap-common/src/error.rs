//! Error types for cluster bootstrap
//!
//! Errors carry the path, operation or context that failed so that the single
//! line printed on a failed bootstrap is enough to act on. Variants follow the
//! failure categories of the bootstrap flow: staging conflicts and I/O,
//! transient readiness reads, manifest application, deadlines and teardown.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A staged manifest would overwrite a file that already exists
    #[error("manifest conflict: {} already exists", path.display())]
    ManifestConflict {
        /// Destination path that was already present
        path: PathBuf,
    },

    /// Copying or removing staged files failed
    #[error("staging I/O error on {}: {source}", path.display())]
    StageIo {
        /// Path being copied, created or removed
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// Staging failed and cleaning up the partial stage failed as well
    #[error("{source}; tearing down the partial stage also failed: {teardown}")]
    StageAborted {
        /// The staging failure
        source: Box<Error>,
        /// The teardown failure that followed it
        teardown: Box<Error>,
    },

    /// Reading observed workload state failed (never fatal to polling)
    #[error("readiness check error: {message}")]
    Readiness {
        /// Description of what failed
        message: String,
    },

    /// Background manifest application failed
    #[error("manifest apply error: {message}")]
    Apply {
        /// Description of what failed
        message: String,
        /// Manifest file involved, if known
        file: Option<PathBuf>,
    },

    /// A manifest file could not be parsed
    #[error("invalid manifest {}: {message}", file.display())]
    Manifest {
        /// The offending file
        file: PathBuf,
        /// Parser message
        message: String,
    },

    /// A bounded wait elapsed
    #[error("timed out after {timeout:?} waiting for {operation}")]
    DeadlineExceeded {
        /// What was being waited for
        operation: String,
        /// The window that elapsed
        timeout: Duration,
    },

    /// A wait was cancelled before it completed
    #[error("{operation} cancelled")]
    Cancelled {
        /// What was being waited for
        operation: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "pod-watch")
        context: String,
    },
}

impl Error {
    /// Create a manifest conflict error for the given destination
    pub fn manifest_conflict(path: impl Into<PathBuf>) -> Self {
        Self::ManifestConflict { path: path.into() }
    }

    /// Create a staging I/O error for the given path
    pub fn stage_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StageIo {
            path: path.into(),
            source,
        }
    }

    /// Combine a staging failure with the teardown failure that followed it
    pub fn stage_aborted(source: Error, teardown: Error) -> Self {
        Self::StageAborted {
            source: Box::new(source),
            teardown: Box::new(teardown),
        }
    }

    /// Create a transient readiness error
    pub fn readiness(msg: impl Into<String>) -> Self {
        Self::Readiness {
            message: msg.into(),
        }
    }

    /// Create a manifest apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply {
            message: msg.into(),
            file: None,
        }
    }

    /// Create a manifest apply error attributed to a file
    pub fn apply_for_file(file: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Apply {
            message: msg.into(),
            file: Some(file.into()),
        }
    }

    /// Create a manifest parse error
    pub fn manifest(file: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            file: file.into(),
            message: msg.into(),
        }
    }

    /// Create a deadline error for the given operation
    pub fn deadline_exceeded(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether a failed attempt that produced this error is worth repeating
    ///
    /// Every API error counts as transient: a freshly started API server
    /// answers 403, 404 or 422 until namespaces, CRDs and RBAC settle. Bad
    /// configuration, unparseable files, staging failures and ended scopes
    /// will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. }
            | Error::Readiness { .. }
            | Error::Apply { .. }
            | Error::Internal { .. } => true,
            Error::ManifestConflict { .. }
            | Error::StageIo { .. }
            | Error::StageAborted { .. }
            | Error::Manifest { .. }
            | Error::DeadlineExceeded { .. }
            | Error::Cancelled { .. }
            | Error::Config { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: How failures surface during a bootstrap
    // ==========================================================================

    /// Story: a pre-existing static pod manifest blocks staging
    ///
    /// The operator sees which file is in the way so they can remove it.
    #[test]
    fn story_manifest_conflict_names_the_blocking_file() {
        let err = Error::manifest_conflict("/etc/kubernetes/manifests/kube-apiserver.yaml");
        assert!(err.to_string().contains("manifest conflict"));
        assert!(err.to_string().contains("kube-apiserver.yaml"));
        assert!(!err.is_retryable());
    }

    /// Story: staging I/O failures keep the path and the OS error
    #[test]
    fn story_stage_io_errors_keep_path_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::stage_io("/etc/kubernetes/bootstrap-secrets", io);
        let msg = err.to_string();
        assert!(msg.contains("/etc/kubernetes/bootstrap-secrets"));
        assert!(msg.contains("denied"));
    }

    /// Story: when staging fails and cleanup fails too, both are reported
    #[test]
    fn story_stage_aborted_reports_both_failures() {
        let staging = Error::manifest_conflict("/m/pod.yaml");
        let teardown = Error::stage_io(
            "/s",
            std::io::Error::new(std::io::ErrorKind::Other, "device busy"),
        );
        let err = Error::stage_aborted(staging, teardown);
        let msg = err.to_string();
        assert!(msg.contains("manifest conflict"));
        assert!(msg.contains("device busy"));
    }

    /// Story: deadlines name the operation and the window
    #[test]
    fn story_deadline_errors_name_operation_and_window() {
        let err = Error::deadline_exceeded("control plane pods", Duration::from_secs(1200));
        let msg = err.to_string();
        assert!(msg.contains("control plane pods"));
        assert!(msg.contains("1200s"));
        assert!(!err.is_retryable());
    }

    /// Story: transient failures are retryable, configuration problems are not
    #[test]
    fn story_error_categorization_for_retry() {
        assert!(Error::readiness("cache not synced").is_retryable());
        assert!(Error::apply("webhook unavailable").is_retryable());
        assert!(!Error::config("bad tear down event").is_retryable());
        assert!(!Error::manifest("/m/a.yaml", "bad yaml").is_retryable());
        assert!(!Error::cancelled("apply").is_retryable());
    }

    /// Story: a converging API server rejects objects it will accept later
    #[test]
    fn story_api_rejections_are_retried_while_the_server_converges() {
        for (code, reason) in [(403, "Forbidden"), (404, "NotFound"), (422, "Invalid"), (500, "InternalError")] {
            let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "namespace openshift-config is terminating".to_string(),
                reason: reason.to_string(),
                code,
            }));
            assert!(err.is_retryable(), "{code} should be retried");
        }
    }

    /// Story: apply errors may carry the manifest file
    #[test]
    fn story_apply_errors_carry_file_when_known() {
        match Error::apply_for_file("/assets/manifests/ns.yaml", "forbidden") {
            Error::Apply { file, message } => {
                assert_eq!(file, Some(PathBuf::from("/assets/manifests/ns.yaml")));
                assert_eq!(message, "forbidden");
            }
            _ => panic!("Expected Apply variant"),
        }
    }
}
