//! AWS error classification.
//!
//! SDK errors are classified by their error code (via
//! `ProvideErrorMetadata`) into the transient and permanent provider
//! classes. Nothing here matches on `Debug` output.

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};

use crate::error::ProviderError;

/// Codes meaning the caller is being throttled.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "Throttled",
];

/// Codes meaning another call is mutating the same resource.
const CONCURRENCY_CODES: &[&str] = &[
    "IncorrectState",
    "IncorrectInstanceState",
    "ConcurrentTagAccess",
    "OperationNotPermitted",
];

/// Codes meaning the resource still has dependents attached.
const DEPENDENCY_CODES: &[&str] = &["DependencyViolation", "ResourceInUse", "InvalidDependencyViolation"];

/// Codes meaning the service failed on its side.
const UNAVAILABLE_CODES: &[&str] = &[
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
    "RequestExpired",
];

/// Codes meaning the caller is not allowed to do this.
const PERMISSION_CODES: &[&str] = &[
    "UnauthorizedOperation",
    "AuthFailure",
    "AccessDenied",
    "AccessDeniedException",
    "OptInRequired",
    "Blocked",
];

/// Codes meaning a resource with the same unique name exists.
const ALREADY_EXISTS_CODES: &[&str] = &[
    "DuplicateLoadBalancerName",
    "DuplicateAccessPointName",
    "DuplicateListener",
    "RouteAlreadyExists",
];

/// Codes meaning the addressed resource does not exist.
const NOT_FOUND_CODES: &[&str] = &["LoadBalancerNotFound", "AccessPointNotFound", "InvalidRoute.NotFound"];

/// Codes meaning an account or service quota would be exceeded.
const QUOTA_CODES: &[&str] = &[
    "TooManyLoadBalancers",
    "TooManyTags",
    "TooManyAccessPoints",
    "InsufficientInstanceCapacity",
];

/// Classifies an AWS error code and message.
#[must_use]
pub fn classify(code: Option<&str>, message: Option<&str>) -> ProviderError {
    let message = message.unwrap_or("no message").to_string();
    let Some(code) = code else {
        return ProviderError::Other {
            code: String::from("Unknown"),
            message,
        };
    };

    if THROTTLING_CODES.contains(&code) {
        ProviderError::RateLimited { message }
    } else if CONCURRENCY_CODES.contains(&code) {
        ProviderError::ConcurrentModification { message }
    } else if DEPENDENCY_CODES.contains(&code) {
        ProviderError::DependencyViolation { message }
    } else if UNAVAILABLE_CODES.contains(&code) {
        ProviderError::Unavailable { message }
    } else if PERMISSION_CODES.contains(&code) {
        ProviderError::PermissionDenied { message }
    } else if ALREADY_EXISTS_CODES.contains(&code) || code.ends_with(".Duplicate") {
        ProviderError::AlreadyExists { message }
    } else if NOT_FOUND_CODES.contains(&code) || code.ends_with(".NotFound") {
        ProviderError::NotFound { message }
    } else if QUOTA_CODES.contains(&code) || code.ends_with("LimitExceeded") {
        ProviderError::QuotaExceeded { message }
    } else if code.starts_with("Invalid") || code.starts_with("Missing") || code == "ValidationError" {
        ProviderError::InvalidParameter { message }
    } else {
        ProviderError::Other {
            code: code.to_string(),
            message,
        }
    }
}

/// Converts an SDK error of any EC2 or ELB operation.
///
/// Transport failures (timeouts, dispatch and response errors) are
/// transient; service errors are classified by code.
pub fn from_sdk<E, R>(operation: &str, error: &SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ProviderError::Unavailable {
                message: format!("{operation}: {error}"),
            }
        }
        SdkError::ConstructionFailure(_) => ProviderError::Other {
            code: String::from("ConstructionFailure"),
            message: format!("{operation}: {error}"),
        },
        _ => {
            let message = error.message().map(|m| format!("{operation}: {m}"));
            classify(error.code(), message.as_deref())
        }
    }
}

/// A reference named in a create request is not visible yet.
///
/// Right after a dependency is created, EC2 may still answer
/// `*.NotFound` for it.
#[must_use]
pub fn reference_not_visible(error: ProviderError) -> ProviderError {
    match error {
        ProviderError::NotFound { message } => ProviderError::NotYetVisible { message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn class(code: &str) -> ErrorClass {
        classify(Some(code), Some("boom")).class()
    }

    #[test]
    fn test_transient_codes() {
        for code in ["RequestLimitExceeded", "DependencyViolation", "IncorrectInstanceState", "InternalError"] {
            assert_eq!(class(code), ErrorClass::Transient, "{code}");
        }
    }

    #[test]
    fn test_permanent_codes() {
        assert!(matches!(
            classify(Some("InvalidSubnet.Conflict"), None),
            ProviderError::InvalidParameter { .. }
        ));
        assert!(matches!(
            classify(Some("VpcLimitExceeded"), None),
            ProviderError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify(Some("UnauthorizedOperation"), None),
            ProviderError::PermissionDenied { .. }
        ));
        assert!(matches!(
            classify(Some("InvalidKeyPair.Duplicate"), None),
            ProviderError::AlreadyExists { .. }
        ));
        assert!(matches!(classify(Some("SomethingNew"), None), ProviderError::Other { ref code, .. } if code == "SomethingNew"));
    }

    #[test]
    fn test_not_found_before_invalid_prefix() {
        let error = classify(Some("InvalidVpcID.NotFound"), Some("vpc-1 does not exist"));
        assert!(error.is_not_found());
        assert!(matches!(reference_not_visible(error), ProviderError::NotYetVisible { .. }));
    }

    #[test]
    fn test_request_limit_is_not_quota() {
        assert!(matches!(
            classify(Some("RequestLimitExceeded"), None),
            ProviderError::RateLimited { .. }
        ));
    }
}
