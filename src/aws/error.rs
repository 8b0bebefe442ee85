//! AWS error classification.
//!
//! Provides typed errors for AWS SDK operations using the `.code()` method
//! from the error metadata instead of string matching on Debug format, with
//! a Debug-string fallback for errors that arrive wrapped in `anyhow`.

use thiserror::Error;

/// AWS error categories the lifecycle logic branches on.
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource was not found (safe to treat as removed in teardown)
    #[error("Resource not found: {message}")]
    NotFound { message: String },

    /// Resource already exists (safe to ignore in create operations)
    #[error("Resource already exists")]
    AlreadyExists,

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    Throttled,

    /// Resource has dependent objects (e.g. a security group with an
    /// attached network interface)
    #[error("Resource has dependent objects")]
    DependencyViolation,

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Check if this is an "already exists" error
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AwsError::AlreadyExists)
    }
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidNetworkInterfaceID.NotFound",
    "InvalidSnapshot.NotFound",
    "InvalidVolume.NotFound",
    "InvalidPermission.NotFound",
    "ResourceNotFoundException",
];

/// Known AWS error codes for "already exists" conditions
const ALREADY_EXISTS_CODES: &[&str] = &[
    "InvalidGroup.Duplicate",
    "InvalidKeyPair.Duplicate",
    "InvalidPermission.Duplicate",
    "ResourceInUseException",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Known AWS error codes for dependency violations (resource still in use)
const DEPENDENCY_CODES: &[&str] = &["DependencyViolation", "VolumeInUse"];

/// Classify an AWS SDK error using the error code.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound { message },
        Some(c) if ALREADY_EXISTS_CODES.contains(&c) => AwsError::AlreadyExists,
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        Some(c) if DEPENDENCY_CODES.contains(&c) => AwsError::DependencyViolation,
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify any SDK operation error through its error metadata.
pub fn classify_sdk_error<E>(error: &E) -> AwsError
where
    E: aws_sdk_ec2::error::ProvideErrorMetadata,
{
    let meta = error.meta();
    classify_aws_error(meta.code(), meta.message())
}

/// Classify an error wrapped in `anyhow::Error`.
///
/// Falls back to extracting the error code from the Debug representation,
/// which is where SDK errors end up once `.context(...)` has been applied.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    let debug_str = format!("{:?}", error);
    if let Some(code) = extract_error_code(&debug_str) {
        return classify_aws_error(Some(&code), Some(&debug_str));
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// All known AWS error codes for extraction from debug strings (flat list)
const ALL_KNOWN_CODES: &[&str] = &[
    // Not found
    "InvalidInstanceID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidNetworkInterfaceID.NotFound",
    "InvalidSnapshot.NotFound",
    "InvalidVolume.NotFound",
    "InvalidPermission.NotFound",
    "ResourceNotFoundException",
    // Already exists
    "InvalidGroup.Duplicate",
    "InvalidKeyPair.Duplicate",
    "InvalidPermission.Duplicate",
    "ResourceInUseException",
    // Throttling
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    // Dependency
    "DependencyViolation",
    "VolumeInUse",
    // Capacity
    "InsufficientInstanceCapacity",
    "InstanceLimitExceeded",
];

/// Extract an AWS error code from a debug string representation
fn extract_error_code(debug_str: &str) -> Option<String> {
    for code in ALL_KNOWN_CODES {
        if debug_str.contains(code) {
            return Some((*code).to_string());
        }
    }

    // Try to extract any code from `code: Some("...")` pattern
    if let Some(start) = debug_str.find("code: Some(\"") {
        let rest = &debug_str[start + 12..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }

    None
}
