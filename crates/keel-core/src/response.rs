//! HTTP message types and error rendering.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::StatusCode;
use http_body_util::Full;

use crate::KeelError;

/// The request type flowing through Keel pipelines.
pub type Request = http::Request<Full<Bytes>>;

/// The response type flowing through Keel pipelines.
pub type Response = http::Response<Full<Bytes>>;

const FALLBACK_BODY: &[u8] =
    br#"{"error":{"code":"INTERNAL_ERROR","message":"Internal error","category":"internal"}}"#;

/// Builds a response with a JSON body.
#[must_use]
pub fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = http::Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

impl KeelError {
    /// Renders this error as a JSON envelope response.
    ///
    /// Errors carrying retry guidance also set `Retry-After`.
    ///
    /// ```
    /// use keel_core::KeelError;
    ///
    /// let response = KeelError::rate_limited("slow down", 7).into_response(None);
    /// assert_eq!(response.status(), 429);
    /// assert_eq!(response.headers()["retry-after"], "7");
    /// ```
    #[must_use]
    pub fn into_response(&self, request_id: Option<&str>) -> Response {
        let body = serde_json::to_vec(&self.to_envelope(request_id))
            .map_or_else(|_| Bytes::from_static(FALLBACK_BODY), Bytes::from);

        let mut response = json_response(self.status_code(), body);
        if let Some(secs) = self.retry_after_seconds() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_json_response_sets_content_type() {
        let response = json_response(StatusCode::OK, Bytes::from_static(b"{}"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_unavailable_response_has_retry_after() {
        let response = KeelError::unavailable("open", None, 30).into_response(Some("r1"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "30");
    }

    #[test]
    fn test_authentication_response_body() {
        let response = KeelError::authentication("token required").into_response(None);
        assert!(response.headers().get(RETRY_AFTER).is_none());

        let body = tokio_test::block_on(response.into_body().collect())
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "AUTHENTICATION_REQUIRED");
        assert_eq!(value["error"]["message"], "token required");
    }
}
