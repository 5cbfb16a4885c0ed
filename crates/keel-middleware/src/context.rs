//! Request-scoped pipeline state.
//!
//! A compiled pipeline is shared by every concurrent request, so all
//! per-request state lives in the [`MiddlewareContext`] threaded through
//! `execute`.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use keel_core::{CallerIdentity, PerformanceProfile, RequestId};

use crate::types::Response;

/// Status and headers supplied by the HTTP layer before the pipeline runs.
///
/// Seed headers are merged into the final response without overriding
/// headers a stage or handler set.
#[derive(Debug, Clone)]
pub struct ResponseSeed {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseSeed {
    /// Creates a seed with the given default status.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the default status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the default status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the seed headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the seed headers for modification.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Copies seed headers absent from `response` into it.
    pub(crate) fn merge_into(&self, response: &mut Response) {
        let target = response.headers_mut();
        for (name, value) in &self.headers {
            if !target.contains_key(name) {
                target.insert(name.clone(), value.clone());
            }
        }
    }
}

impl Default for ResponseSeed {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Context that flows through the pipeline.
///
/// # Example
///
/// ```
/// use keel_middleware::MiddlewareContext;
/// use keel_core::CallerIdentity;
///
/// let mut ctx = MiddlewareContext::new();
/// ctx.set_identity(CallerIdentity::user("user-123"));
/// assert_eq!(ctx.identity().log_id(), "user:user-123");
/// ```
#[derive(Debug)]
pub struct MiddlewareContext {
    request_id: RequestId,
    identity: CallerIdentity,
    /// Profile in force when the request started.
    profile: PerformanceProfile,
    /// Stages entered so far, in order.
    stage_path: Vec<&'static str>,
    seed: ResponseSeed,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MiddlewareContext {
    /// Creates a new context with a fresh request ID.
    #[must_use]
    pub fn new() -> Self {
        Self::with_request_id(RequestId::new())
    }

    /// Creates a context with a specific request ID.
    ///
    /// Useful when the request ID was provided by a client or upstream service.
    #[must_use]
    pub fn with_request_id(request_id: RequestId) -> Self {
        Self {
            request_id,
            identity: CallerIdentity::Anonymous,
            profile: PerformanceProfile::default(),
            stage_path: Vec::new(),
            seed: ResponseSeed::default(),
            extensions: HashMap::new(),
        }
    }

    /// Replaces the response seed.
    #[must_use]
    pub fn with_seed(mut self, seed: ResponseSeed) -> Self {
        self.seed = seed;
        self
    }

    /// Returns the request ID.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the caller identity.
    #[must_use]
    pub const fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    /// Sets the caller identity.
    pub fn set_identity(&mut self, identity: CallerIdentity) {
        self.identity = identity;
    }

    /// Returns the performance profile snapshotted when the request started.
    ///
    /// A profile switch mid-request does not change this value.
    #[must_use]
    pub const fn profile(&self) -> PerformanceProfile {
        self.profile
    }

    pub(crate) fn set_profile(&mut self, profile: PerformanceProfile) {
        self.profile = profile;
    }

    /// Returns the stages entered so far, in order.
    #[must_use]
    pub fn stage_path(&self) -> &[&'static str] {
        &self.stage_path
    }

    /// Returns the most recently entered stage.
    ///
    /// After a failure this is the stage it originated in: stages after it
    /// were never entered.
    #[must_use]
    pub fn current_stage(&self) -> Option<&'static str> {
        self.stage_path.last().copied()
    }

    pub(crate) fn enter_stage(&mut self, stage: &'static str) {
        self.stage_path.push(stage);
    }

    /// Returns the response seed.
    #[must_use]
    pub const fn seed(&self) -> &ResponseSeed {
        &self.seed
    }

    /// Returns the response seed for modification.
    pub fn seed_mut(&mut self) -> &mut ResponseSeed {
        &mut self.seed
    }

    /// Builds a response from the seed status and headers.
    #[must_use]
    pub fn respond(&self, body: impl Into<Bytes>) -> Response {
        let mut response = http::Response::new(Full::new(body.into()));
        *response.status_mut() = self.seed.status;
        *response.headers_mut() = self.seed.headers.clone();
        response
    }

    /// Stores a typed extension value.
    ///
    /// ```
    /// use keel_middleware::MiddlewareContext;
    ///
    /// struct Tenant(&'static str);
    ///
    /// let mut ctx = MiddlewareContext::new();
    /// ctx.set_extension(Tenant("acme"));
    /// assert_eq!(ctx.get_extension::<Tenant>().map(|t| t.0), Some("acme"));
    /// ```
    pub fn set_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a typed extension value.
    #[must_use]
    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Retrieves a typed extension value for modification.
    pub fn get_extension_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut())
    }

    /// Removes and returns a typed extension value.
    pub fn remove_extension<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    /// Checks if an extension of the given type exists.
    #[must_use]
    pub fn has_extension<T: Send + Sync + 'static>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }
}

impl Default for MiddlewareContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};

    #[test]
    fn test_new_context_is_anonymous() {
        let ctx = MiddlewareContext::new();
        assert!(ctx.identity().is_anonymous());
        assert!(ctx.stage_path().is_empty());
        assert_eq!(ctx.current_stage(), None);
        assert_eq!(ctx.profile(), PerformanceProfile::Balanced);
    }

    #[test]
    fn test_stage_path_tracks_origin() {
        let mut ctx = MiddlewareContext::new();
        ctx.enter_stage("log");
        ctx.enter_stage("auth");
        assert_eq!(ctx.stage_path(), &["log", "auth"]);
        assert_eq!(ctx.current_stage(), Some("auth"));
    }

    #[test]
    fn test_extensions() {
        #[derive(Debug, PartialEq)]
        struct Attempts(u32);

        let mut ctx = MiddlewareContext::new();
        assert!(!ctx.has_extension::<Attempts>());

        ctx.set_extension(Attempts(1));
        if let Some(a) = ctx.get_extension_mut::<Attempts>() {
            a.0 += 1;
        }
        assert_eq!(ctx.get_extension::<Attempts>(), Some(&Attempts(2)));
        assert_eq!(ctx.remove_extension::<Attempts>(), Some(Attempts(2)));
        assert!(!ctx.has_extension::<Attempts>());
    }

    #[test]
    fn test_seed_merge_does_not_override() {
        let mut seed = ResponseSeed::new(StatusCode::ACCEPTED);
        seed.headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        seed.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let ctx = MiddlewareContext::new().with_seed(seed);
        let mut response = keel_core::json_response(StatusCode::OK, Bytes::new());
        ctx.seed().merge_into(&mut response);

        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_respond_uses_seed() {
        let ctx = MiddlewareContext::new().with_seed(ResponseSeed::new(StatusCode::CREATED));
        let response = ctx.respond("done");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
