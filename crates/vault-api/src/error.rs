//! Error types for Vault API calls.

use thiserror::Error;

/// Errors produced by the Vault transport and response decoders
#[derive(Debug, Error)]
pub enum VaultError {
    /// Vault answered with a non-success status code
    #[error("vault api error (status {code}): {}", errors.join("; "))]
    Api {
        /// HTTP status code
        code: u16,
        /// The `errors` array from the Vault response body
        errors: Vec<String>,
    },

    /// The request could not be sent or the response body not read
    #[error("vault request failed")]
    Request(#[from] reqwest::Error),

    /// Vault returned an empty body where a secret was expected
    #[error("vault returned an empty response")]
    EmptyResponse,

    /// The response body was not the expected JSON shape
    #[error("failed to decode vault response")]
    Decode(#[from] serde_json::Error),

    /// The configured Vault address could not be parsed
    #[error("invalid vault address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// TLS configuration could not be applied to the HTTP client
    #[error("invalid tls configuration: {0}")]
    InvalidTls(String),

    /// A field required by the selected response view is missing
    #[error("missing field {field:?} in vault response")]
    MissingField {
        /// Dotted path of the missing field
        field: &'static str,
    },

    /// The source data carries a key reserved by the K8s data projection
    #[error("source data contains reserved key {key:?}")]
    ReservedKeyViolation {
        /// The reserved key
        key: &'static str,
    },
}

impl VaultError {
    /// True when Vault reported 404 for the requested path
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code: 404, .. })
    }

    /// True for failures worth retrying (connect errors, timeouts, 5xx)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { code, .. } => *code >= 500 || *code == 429,
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_joins_messages() {
        let err = VaultError::Api {
            code: 403,
            errors: vec!["permission denied".into(), "invalid token".into()],
        };
        assert_eq!(
            err.to_string(),
            "vault api error (status 403): permission denied; invalid token"
        );
    }

    #[test]
    fn not_found_detection() {
        let err = VaultError::Api {
            code: 404,
            errors: vec![],
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = VaultError::Api {
            code: 503,
            errors: vec!["sealed".into()],
        };
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }
}
