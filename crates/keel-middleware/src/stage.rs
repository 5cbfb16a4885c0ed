//! The normalized stage representation and the registration surface.

use std::sync::Arc;

use keel_core::{LocatorResult, ServiceLocator};

use crate::middleware::{LegacyAdapter, LegacyMiddleware, Middleware};

/// Calling convention a stage was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Registered as a [`Middleware`].
    Handler,
    /// Registered as a [`LegacyMiddleware`] and adapted once at
    /// registration.
    Legacy,
}

impl StageKind {
    /// Returns the lowercase name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Legacy => "legacy",
        }
    }
}

/// One middleware unit, normalized to the handler-style contract.
///
/// # Example
///
/// ```ignore
/// use keel_middleware::{Stage, StageKind};
///
/// let stage = Stage::legacy(MyLegacyAuth::new());
/// assert_eq!(stage.kind(), StageKind::Legacy);
/// ```
#[derive(Clone)]
pub struct Stage {
    kind: StageKind,
    type_name: &'static str,
    middleware: Arc<dyn Middleware>,
}

impl Stage {
    /// Wraps a handler-style middleware.
    pub fn handler<M: Middleware>(middleware: M) -> Self {
        Self {
            kind: StageKind::Handler,
            type_name: std::any::type_name::<M>(),
            middleware: Arc::new(middleware),
        }
    }

    /// Wraps a legacy middleware behind the handler-style contract.
    pub fn legacy<L: LegacyMiddleware>(middleware: L) -> Self {
        Self {
            kind: StageKind::Legacy,
            type_name: std::any::type_name::<L>(),
            middleware: Arc::new(LegacyAdapter::new(middleware)),
        }
    }

    /// Stage name used in logs, metrics and error attribution.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.middleware.name()
    }

    /// The calling convention this stage was registered with.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        self.kind
    }

    /// The concrete middleware type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The middleware's configuration fingerprint, if it publishes one.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.middleware.fingerprint()
    }

    pub(crate) fn middleware(&self) -> &dyn Middleware {
        &*self.middleware
    }

    /// Whether `other` is a configuration-identical copy of this stage.
    ///
    /// Only stages that publish a fingerprint can match; anything else
    /// compares unequal.
    pub(crate) fn duplicates(&self, other: &Self) -> bool {
        if self.type_name != other.type_name || self.kind != other.kind {
            return false;
        }
        match (self.fingerprint(), other.fingerprint()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Builds a stage from the locator at compile time.
pub type StageFactory = Arc<dyn Fn(&ServiceLocator) -> LocatorResult<Stage> + Send + Sync>;

/// A stage as registered, before compilation.
#[derive(Clone)]
pub enum StageSpec {
    /// An already-built stage.
    Instance(Arc<Stage>),
    /// A [`Stage`] bound in the service locator under this key.
    Service(String),
    /// A factory run against the locator when the pipeline is compiled.
    Deferred {
        /// Label used in logs.
        name: String,
        /// The factory.
        factory: StageFactory,
    },
}

impl StageSpec {
    /// Registers a built stage.
    pub fn instance(stage: Stage) -> Self {
        Self::Instance(Arc::new(stage))
    }

    /// Registers a locator binding.
    pub fn service(key: impl Into<String>) -> Self {
        Self::Service(key.into())
    }

    /// Registers a deferred factory.
    pub fn deferred<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceLocator) -> LocatorResult<Stage> + Send + Sync + 'static,
    {
        Self::Deferred {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    /// Produces the stage, consulting the locator if needed.
    pub(crate) fn resolve(&self, locator: &ServiceLocator) -> LocatorResult<Arc<Stage>> {
        match self {
            Self::Instance(stage) => Ok(stage.clone()),
            Self::Service(key) => locator.resolve::<Stage>(key),
            Self::Deferred { factory, .. } => factory(locator).map(Arc::new),
        }
    }
}

impl From<Stage> for StageSpec {
    fn from(stage: Stage) -> Self {
        Self::instance(stage)
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance(stage) => f.debug_tuple("Instance").field(stage).finish(),
            Self::Service(key) => f.debug_tuple("Service").field(key).finish(),
            Self::Deferred { name, .. } => f.debug_struct("Deferred").field("name", name).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MiddlewareContext;
    use crate::error::PipelineResult;
    use crate::middleware::{Advance, BoxFuture, Next};
    use crate::types::{Request, Response};

    struct Tagged(&'static str, Option<&'static str>);

    impl Middleware for Tagged {
        fn name(&self) -> &'static str {
            self.0
        }

        fn fingerprint(&self) -> Option<String> {
            self.1.map(str::to_string)
        }

        fn process<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, PipelineResult<Response>> {
            next.run(ctx, request)
        }
    }

    struct PassThrough;

    impl LegacyMiddleware for PassThrough {
        fn name(&self) -> &'static str {
            "pass"
        }

        fn invoke<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            advance: Advance<'a>,
        ) -> BoxFuture<'a, Option<Response>> {
            Box::pin(async move { advance.call(ctx, request).await })
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Stage::handler(Tagged("a", None)).kind(), StageKind::Handler);
        let legacy = Stage::legacy(PassThrough);
        assert_eq!(legacy.kind(), StageKind::Legacy);
        assert_eq!(legacy.name(), "pass");
        assert!(legacy.type_name().ends_with("PassThrough"));
    }

    #[test]
    fn test_duplicates_requires_fingerprints() {
        let a = Stage::handler(Tagged("a", Some("cfg-1")));
        let b = Stage::handler(Tagged("a", Some("cfg-1")));
        let c = Stage::handler(Tagged("a", Some("cfg-2")));
        let d = Stage::handler(Tagged("a", None));

        assert!(a.duplicates(&b));
        assert!(!a.duplicates(&c));
        assert!(!d.duplicates(&d.clone()));
    }

    #[test]
    fn test_spec_resolution() {
        let locator = ServiceLocator::new();
        locator.instance("stages.a", Stage::handler(Tagged("a", None)));

        let stage = StageSpec::service("stages.a").resolve(&locator).unwrap();
        assert_eq!(stage.name(), "a");

        let deferred = StageSpec::deferred("b", |_| Ok(Stage::handler(Tagged("b", None))));
        assert_eq!(deferred.resolve(&locator).unwrap().name(), "b");

        assert!(StageSpec::service("missing").resolve(&locator).is_err());
    }
}
