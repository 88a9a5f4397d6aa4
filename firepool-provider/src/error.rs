//! Error types for the CI provider client.

/// Errors returned by [`crate::GitLabClient`].
///
/// HTTP failures carry the response body verbatim.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The client cannot be built from the given settings.
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    /// The request never produced a response (connect, TLS, timeout).
    #[error("{operation}: request failed: {source}")]
    Request {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with an unexpected status.
    #[error("{operation}: HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The API answered with a structured error document.
    #[error("{operation}: {message} (HTTP {status})")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("{operation}: invalid response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Registration succeeded but no token came back; it cannot be fetched later.
    #[error("create runner: empty token in response")]
    EmptyToken,
}

impl ProviderError {
    /// HTTP status of the failed call, if the API answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_includes_body() {
        let err = ProviderError::Status {
            operation: "delete runner",
            status: 403,
            body: "{\"message\":\"403 Forbidden\"}".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 403"));
        assert!(msg.contains("403 Forbidden"));
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn empty_token_has_no_status() {
        assert_eq!(ProviderError::EmptyToken.status(), None);
    }
}
