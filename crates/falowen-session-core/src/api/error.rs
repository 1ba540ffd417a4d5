use thiserror::Error;

/// Outcome classes of a call to the auth server.
///
/// Only `Unauthorized` is authoritative. Everything that could plausibly
/// succeed on a later attempt is `Transient`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unauthorized - credentials rejected by the server")]
    Unauthorized,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid request: {0}")]
    Validation(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a non-success status from `/auth/refresh` or `/auth/logout`.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => AuthError::Unauthorized,
            _ => AuthError::Transient(format!("Status {}: {}", status, Self::truncate_body(body))),
        }
    }

    /// Classify a non-success status from `/auth/login`, where 400 means a missing field.
    pub fn from_login_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 => AuthError::Validation(Self::truncate_body(body)),
            _ => Self::from_status(status, body),
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Transient(format!("request timed out: {}", err))
        } else if err.is_decode() {
            AuthError::Transient(format!("malformed response: {}", err))
        } else {
            AuthError::Transient(format!("network error: {}", err))
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_only_401_is_unauthorized() {
        assert_eq!(AuthError::from_status(StatusCode::UNAUTHORIZED, ""), AuthError::Unauthorized);

        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = AuthError::from_status(status, "nope");
            assert!(err.is_retryable(), "{} should be transient", status);
        }
    }

    #[test]
    fn test_login_400_is_validation() {
        let err = AuthError::from_login_status(StatusCode::BAD_REQUEST, "missing password");
        assert_eq!(err, AuthError::Validation("missing password".to_string()));
        assert!(!err.is_retryable());

        assert_eq!(
            AuthError::from_login_status(StatusCode::UNAUTHORIZED, ""),
            AuthError::Unauthorized
        );
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        match AuthError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            AuthError::Transient(msg) => {
                assert!(msg.contains("truncated, 2000 total bytes"));
                assert!(msg.len() < 700);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let body = "ü".repeat(400);
        let truncated = AuthError::truncate_body(&body);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }
}
