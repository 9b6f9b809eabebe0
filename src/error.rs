//! Error types for the vpcforge reconciliation engine.
//!
//! The hierarchy mirrors the run lifecycle: configuration errors are caught
//! before anything touches the cloud, provider errors are classified as
//! transient or permanent, and planning/reconciliation errors abort a run
//! before execution starts. Per-node failures during execution are not
//! errors at all; they are recorded as outcomes in the run report.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for vpcforge.
#[derive(Debug, Error)]
pub enum VpcForgeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors. Always detected before any cloud mutation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName {
        /// Kind of resource.
        kind: String,
        /// The duplicated name.
        name: String,
    },

    /// A reference names a resource that is not declared.
    #[error("Dangling reference from {from}: no {kind} named '{name}'")]
    DanglingReference {
        /// The referencing node (`kind.name`).
        from: String,
        /// Kind of the missing target.
        kind: String,
        /// Logical name of the missing target.
        name: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    DependencyCycle {
        /// The nodes forming the cycle, joined by arrows.
        cycle: String,
    },

    /// A live resource differs from the schema on an attribute that
    /// cannot be changed in place.
    #[error("Immutable attribute '{field}' of {resource} differs (live: {live}, desired: {desired})")]
    ImmutableAttribute {
        /// The resource (`kind.name`).
        resource: String,
        /// Attribute name.
        field: String,
        /// Value reported by the provider.
        live: String,
        /// Value declared in the schema.
        desired: String,
    },

    /// A CIDR block could not be parsed.
    #[error("Invalid CIDR block: {cidr}")]
    InvalidCidr {
        /// The offending value.
        cidr: String,
    },

    /// Subnet blocks could not be carved from the network.
    #[error("Subnet allocation failed: {message}")]
    SubnetAllocation {
        /// Description of the allocation failure.
        message: String,
    },
}

/// Classification of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help.
    Permanent,
}

/// Errors returned by a resource provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The control plane throttled the request.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Provider message.
        message: String,
    },

    /// Another operation is mutating the same resource.
    #[error("Concurrent modification: {message}")]
    ConcurrentModification {
        /// Provider message.
        message: String,
    },

    /// A referenced resource exists but is not yet visible to this call.
    #[error("Dependency not yet visible: {message}")]
    NotYetVisible {
        /// Provider message.
        message: String,
    },

    /// The resource still has dependents attached.
    #[error("Dependency violation: {message}")]
    DependencyViolation {
        /// Provider message.
        message: String,
    },

    /// The control plane is temporarily unavailable.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Provider message.
        message: String,
    },

    /// The resource does not exist.
    #[error("Resource not found: {message}")]
    NotFound {
        /// Provider message.
        message: String,
    },

    /// The request is malformed or semantically invalid.
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Provider message.
        message: String,
    },

    /// An account or service quota would be exceeded.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        /// Provider message.
        message: String,
    },

    /// The caller is not authorized.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Provider message.
        message: String,
    },

    /// A resource with the same unique name already exists.
    #[error("Already exists: {message}")]
    AlreadyExists {
        /// Provider message.
        message: String,
    },

    /// Any other provider failure.
    #[error("{code}: {message}")]
    Other {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Live discovery could not list a resource kind.
    #[error("Discovery failed for {kind}: {source}")]
    DiscoveryFailed {
        /// Kind whose listing failed.
        kind: String,
        /// The last provider error.
        source: ProviderError,
    },

    /// No provider is registered for a kind the graph needs.
    #[error("No provider registered for {kind}")]
    MissingProvider {
        /// The unsupported kind.
        kind: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted before execution.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for vpcforge operations.
pub type Result<T> = std::result::Result<T, VpcForgeError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl VpcForgeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ProviderError {
    /// Returns the transient/permanent classification.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. }
            | Self::ConcurrentModification { .. }
            | Self::NotYetVisible { .. }
            | Self::DependencyViolation { .. }
            | Self::Unavailable { .. } => ErrorClass::Transient,
            Self::NotFound { .. }
            | Self::InvalidParameter { .. }
            | Self::QuotaExceeded { .. }
            | Self::PermissionDenied { .. }
            | Self::AlreadyExists { .. }
            | Self::Other { .. } => ErrorClass::Permanent,
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Returns true if the resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Creates an invalid parameter error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = [
            ProviderError::rate_limited("slow down"),
            ProviderError::ConcurrentModification { message: String::new() },
            ProviderError::NotYetVisible { message: String::new() },
            ProviderError::DependencyViolation { message: String::new() },
            ProviderError::Unavailable { message: String::new() },
        ];
        for err in transient {
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn test_permanent_classification() {
        let permanent = [
            ProviderError::invalid("bad cidr"),
            ProviderError::QuotaExceeded { message: String::new() },
            ProviderError::PermissionDenied { message: String::new() },
            ProviderError::not_found("gone"),
        ];
        for err in permanent {
            assert_eq!(err.class(), ErrorClass::Permanent);
        }
    }

    #[test]
    fn test_config_errors_convert() {
        let err = VpcForgeError::from(ConfigError::validation("too many", "guardrails.max_instances"));
        assert!(err.is_config());
        assert!(!VpcForgeError::from(ProviderError::rate_limited("x")).is_config());
    }
}
