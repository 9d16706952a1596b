//! Error types for control-plane calls and the extension lifecycle.

use thiserror::Error;

const MAX_BODY_SNIPPET: usize = 512;

/// Errors raised while talking to the control plane or driving a VM.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotatorError {
    /// No response was obtained (network, DNS, TLS, timeout).
    #[error("[{operation}] transport error: {message}")]
    Transport { operation: String, message: String },

    /// A response was obtained but its status was not 2xx.
    #[error("[{operation}] API returned {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("[{operation}] failed to decode response: {message}")]
    Decode { operation: String, message: String },

    #[error("[{operation}] extension did not reach Succeeded after {attempts} attempts")]
    PollTimeout { operation: String, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl RotatorError {
    pub fn transport(operation: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn api(operation: &str, status: u16, body: &str) -> Self {
        Self::Api {
            operation: operation.to_string(),
            status,
            body: truncate_body(body),
        }
    }

    pub fn decode(operation: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Map a reqwest failure. Body decoding problems are `Decode`,
    /// everything else means no usable response arrived.
    pub fn from_reqwest(operation: &str, err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode(operation, err.to_string())
        } else {
            Self::transport(operation, err.to_string())
        }
    }

    /// Returns true if retrying the same call could plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_BODY_SNIPPET {
        return trimmed.to_string();
    }
    let mut end = MAX_BODY_SNIPPET;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_api() {
        let err = RotatorError::api("put_extension", 409, "{\"error\":\"Conflict\"}");
        assert_eq!(
            err.to_string(),
            "[put_extension] API returned 409: {\"error\":\"Conflict\"}"
        );
    }

    #[test]
    fn test_error_display_poll_timeout() {
        let err = RotatorError::PollTimeout {
            operation: "get_extension_status".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "[get_extension_status] extension did not reach Succeeded after 5 attempts"
        );
    }

    #[test]
    fn test_error_display_cancelled() {
        assert_eq!(RotatorError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_is_transient() {
        assert!(RotatorError::transport("list_vms", "connection reset").is_transient());
        assert!(RotatorError::api("list_vms", 503, "").is_transient());
        assert!(RotatorError::api("list_vms", 429, "").is_transient());
        assert!(!RotatorError::api("list_vms", 403, "").is_transient());
        assert!(!RotatorError::decode("list_vms", "eof").is_transient());
        assert!(!RotatorError::Cancelled.is_transient());
    }

    #[test]
    fn test_is_not_found() {
        assert!(RotatorError::api("delete_extension", 404, "").is_not_found());
        assert!(!RotatorError::api("delete_extension", 400, "").is_not_found());
        assert!(!RotatorError::transport("delete_extension", "x").is_not_found());
    }

    #[test]
    fn test_api_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = RotatorError::api("get_extension_status", 500, &body);
        match err {
            RotatorError::Api { body, .. } => {
                assert_eq!(body.len(), MAX_BODY_SNIPPET + 3);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
