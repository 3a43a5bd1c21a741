//! Standardized mapping from registry HTTP responses to crate errors

use crate::error::RelocatorError;
use reqwest::StatusCode;

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a failed registry response to an error carrying the operation context
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> RelocatorError {
        let error_text = Self::trim_body(error_text);
        match status.as_u16() {
            401 => RelocatorError::Authentication(format!(
                "Unauthorized to perform {}: {}",
                operation, error_text
            )),
            403 => RelocatorError::Authentication(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => RelocatorError::Registry(format!(
                "Resource not found for {}: {}",
                operation, error_text
            )),
            400 if error_text.contains("DIGEST_INVALID") => RelocatorError::Registry(format!(
                "Digest validation failed during {}: registry reports uploaded content does not match its digest",
                operation
            )),
            400 if error_text.contains("MANIFEST_BLOB_UNKNOWN") => RelocatorError::Registry(format!(
                "Manifest references a blob the registry does not have during {}: {}",
                operation, error_text
            )),
            413 => RelocatorError::Registry(format!("Payload too large for {}", operation)),
            429 => RelocatorError::Registry(format!(
                "Rate limited during {}: {}",
                operation, error_text
            )),
            500 => RelocatorError::Registry(format!(
                "Registry server error during {}: {}",
                operation, error_text
            )),
            502 | 503 => RelocatorError::Registry(format!(
                "Registry unavailable for {}: {}",
                operation, error_text
            )),
            _ => RelocatorError::Registry(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }

    /// Map a failed token endpoint response
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> RelocatorError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!(
                "Authentication failed (status {}): {}",
                status,
                Self::trim_body(error_text)
            ),
        };

        RelocatorError::Authentication(error_msg)
    }

    // Registries sometimes answer with whole HTML pages.
    fn trim_body(error_text: &str) -> &str {
        let trimmed = error_text.trim();
        match trimmed.char_indices().nth(512) {
            Some((idx, _)) => &trimmed[..idx],
            None => trimmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_maps_to_authentication() {
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::UNAUTHORIZED,
            "{\"errors\":[{\"code\":\"UNAUTHORIZED\"}]}",
            "manifest upload",
        );
        assert!(matches!(err, RelocatorError::Authentication(_)));
        assert!(err.to_string().contains("manifest upload"));
    }

    #[test]
    fn test_digest_invalid_is_called_out() {
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::BAD_REQUEST,
            "{\"errors\":[{\"code\":\"DIGEST_INVALID\"}]}",
            "blob upload",
        );
        assert!(err.to_string().contains("Digest validation failed during blob upload"));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(4096);
        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &body,
            "blob download",
        );
        assert!(err.to_string().len() < 700);
    }
}
