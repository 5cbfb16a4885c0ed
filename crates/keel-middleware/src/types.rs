//! HTTP message types used by the pipeline.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use keel_core::json_response;

pub use keel_core::{Request, Response};

/// Extension trait for building and decorating responses.
pub trait ResponseExt {
    /// Creates a JSON error response with the given status code and code.
    fn json_error(status: StatusCode, code: &str, message: &str) -> Response;

    /// Sets a header by name, skipping names or values that are not valid
    /// HTTP tokens.
    fn set_header(&mut self, name: &str, value: impl ToString);
}

impl ResponseExt for Response {
    fn json_error(status: StatusCode, code: &str, message: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message
            }
        });
        json_response(status, Bytes::from(body.to_string()))
    }

    fn set_header(&mut self, name: &str, value: impl ToString) {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return;
        };
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers_mut().insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_response() {
        let response =
            Response::json_error(StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", "Authentication required");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_set_header_ignores_invalid_names() {
        let mut response = Response::json_error(StatusCode::OK, "OK", "ok");
        response.set_header("x-ratelimit-limit", 60);
        response.set_header("bad header", 1);
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");
        assert_eq!(response.headers().len(), 2);
    }
}
