//! Error types for fsbackup
//!
//! Errors are structured with fields so operators can act on them directly.
//! `ResetRequired` and `Actionable` carry text meant to be shown verbatim;
//! infrastructure failures keep their underlying cause.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fsbackup operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The mount holds state from another gateway instance and may only be
    /// reused after an explicit reset
    #[error("{reason}")]
    ResetRequired {
        /// Directory (host path or NFS export) that needs a reset
        path: String,
        /// Human readable explanation of why the reset is needed
        reason: String,
    },

    /// The configured host path does not exist on the node
    #[error("{path} does not exist or is not a directory on the host")]
    HostPathNotFound {
        /// Missing host path
        path: String,
    },

    /// Diagnostic text extracted from a failed probe, shown as-is
    #[error("{message}")]
    Actionable {
        /// Text to show to the operator
        message: String,
    },

    /// A polled condition did not become true in time
    #[error("timed out after {}s: {operation}", .timeout.as_secs())]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long we waited
        timeout: Duration,
    },

    /// Invalid configuration or input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nfs.server")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// No Velero BackupStorageLocation is registered
    #[error("no backup storage location found in namespace {namespace}")]
    LocationNotFound {
        /// Namespace that was searched
        namespace: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a reset-required error for a directory
    pub fn reset_required(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResetRequired {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a host-path-not-found error
    pub fn host_path_not_found(path: impl Into<String>) -> Self {
        Self::HostPathNotFound { path: path.into() }
    }

    /// Create an actionable error from probe diagnostics
    pub fn actionable(msg: impl Into<String>) -> Self {
        Self::Actionable {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a location-not-found error
    pub fn location_not_found(namespace: impl Into<String>) -> Self {
        Self::LocationNotFound {
            namespace: namespace.into(),
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

    /// True when re-invoking with `force_reset` would let the operation proceed
    pub fn is_reset_required(&self) -> bool {
        matches!(self, Error::ResetRequired { .. })
    }

    /// Check if re-running the whole operation may succeed without changes
    ///
    /// Reset and validation errors need operator input. Missing host paths
    /// and probe diagnostics need the environment fixed first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::ResetRequired { .. } => false,
            Error::HostPathNotFound { .. } => false,
            Error::Actionable { .. } => false,
            Error::Timeout { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::LocationNotFound { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    /// Story: a reset prompt shows exactly the explanation it carries
    #[test]
    fn story_reset_required_displays_reason_verbatim() {
        let err = Error::reset_required(
            "/data/backups",
            "/data/backups was previously used by another gateway instance",
        );
        assert_eq!(
            err.to_string(),
            "/data/backups was previously used by another gateway instance"
        );
        assert!(err.is_reset_required());
        assert!(!err.is_retryable());
    }

    #[test]
    fn actionable_errors_are_shown_as_is() {
        let err = Error::actionable("directory /data is not writable by uid 1001");
        assert_eq!(err.to_string(), "directory /data is not writable by uid 1001");
        assert!(!err.is_reset_required());
    }

    #[test]
    fn timeout_renders_seconds_and_operation() {
        let err = Error::timeout("pod fsbackup-fs-check-1 to complete", Duration::from_secs(120));
        assert_eq!(
            err.to_string(),
            "timed out after 120s: pod fsbackup-fs-check-1 to complete"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn host_path_not_found_names_path() {
        let err = Error::host_path_not_found("/mnt/missing");
        assert!(err.to_string().contains("/mnt/missing"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn kube_conflicts_are_retryable_but_other_4xx_are_not() {
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(Error::from(api_error(500)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
    }

    #[test]
    fn validation_errors_keep_field() {
        let err = Error::validation_for_field("nfs.server", "must not be empty");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("nfs.server")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn internal_error_context() {
        assert_eq!(
            Error::internal_with_context("probe", "x").context(),
            Some("probe")
        );
        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
        assert_eq!(Error::validation("x").context(), None);
    }
}
