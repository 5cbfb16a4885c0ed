//! Service locator.
//!
//! The [`ServiceLocator`] resolves the named services middleware needs while
//! a pipeline is being compiled. Services are registered under string keys
//! as factories (optionally cached as singletons), pre-built instances, or
//! explicit null bindings.
//!
//! Resolution walks a [`Resolver`], which keeps the stack of keys currently
//! being built. A key that shows up twice on that stack is a cycle and fails
//! with [`LocatorError::CircularDependency`] instead of recursing forever.
//!
//! Types that know how to build themselves from the locator implement
//! [`Autowire`]; [`ServiceLocator::resolve_type`] builds them (and their
//! dependencies) without an explicit binding.
//!
//! # Example
//!
//! ```rust
//! use keel_core::locator::{ServiceLocator, Resolver, LocatorResult};
//! use std::sync::Arc;
//!
//! struct Database { url: String }
//! struct Repo { db: Arc<Database> }
//!
//! let locator = ServiceLocator::new();
//! locator.singleton("db", |_| Ok(Database { url: "postgres://localhost".into() }));
//! locator.transient("repo", |r: &mut Resolver<'_>| {
//!     Ok(Repo { db: r.resolve::<Database>("db")? })
//! });
//!
//! let repo = locator.resolve::<Repo>("repo").unwrap();
//! assert_eq!(repo.db.url, "postgres://localhost");
//! ```

use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// Result type for locator operations.
pub type LocatorResult<T> = Result<T, LocatorError>;

type AnyService = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&mut Resolver<'_>) -> LocatorResult<AnyService> + Send + Sync>;

/// Errors raised while binding or resolving services.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocatorError {
    /// Nothing is bound under the key.
    #[error("no binding registered for '{key}'")]
    NotBound {
        /// The requested key.
        key: String,
    },

    /// The key is bound, but explicitly to null.
    #[error("binding '{key}' is explicitly null")]
    NullBinding {
        /// The requested key.
        key: String,
    },

    /// A key appeared twice on the resolution stack.
    #[error("circular dependency detected: {}", .chain.join(" -> "))]
    CircularDependency {
        /// The resolution stack, ending with the repeated key.
        chain: Vec<String>,
    },

    /// The bound value is not of the requested type.
    #[error("binding '{key}' does not hold a {expected}")]
    TypeMismatch {
        /// The requested key.
        key: String,
        /// The type the caller asked for.
        expected: &'static str,
    },

    /// Following aliases never reached a concrete key.
    #[error("alias loop: {}", .chain.join(" -> "))]
    AliasLoop {
        /// The aliases visited, ending with the repeated name.
        chain: Vec<String>,
    },

    /// A factory refused to build its service.
    #[error("factory for '{key}' failed: {message}")]
    Factory {
        /// The key whose factory failed.
        key: String,
        /// What went wrong.
        message: String,
    },
}

impl LocatorError {
    /// Creates a factory failure for `key`.
    pub fn factory(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Factory {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone)]
enum Binding {
    Factory {
        factory: Factory,
        singleton: bool,
        generation: u64,
    },
    Instance(AnyService),
    Null,
}

/// Types that can build themselves from the locator.
///
/// This is the locator's substitute for constructor introspection: the
/// implementation names its dependencies, and [`ServiceLocator::resolve_type`]
/// resolves them recursively.
///
/// ```rust
/// use keel_core::locator::{Autowire, Resolver, LocatorResult, ServiceLocator};
/// use std::sync::Arc;
///
/// #[derive(Default)]
/// struct Clock;
/// impl Autowire for Clock {
///     fn autowire(_: &mut Resolver<'_>) -> LocatorResult<Self> { Ok(Clock) }
/// }
///
/// struct Scheduler { clock: Arc<Clock> }
/// impl Autowire for Scheduler {
///     fn autowire(r: &mut Resolver<'_>) -> LocatorResult<Self> {
///         Ok(Scheduler { clock: r.resolve_type::<Clock>()? })
///     }
/// }
///
/// let locator = ServiceLocator::new();
/// assert!(locator.resolve_type::<Scheduler>().is_ok());
/// ```
pub trait Autowire: Sized + Send + Sync + 'static {
    /// Builds `Self`, resolving dependencies through `resolver`.
    fn autowire(resolver: &mut Resolver<'_>) -> LocatorResult<Self>;
}

/// Named arguments passed to [`ServiceLocator::call`].
///
/// Extra arguments take precedence over container bindings with the same
/// name.
#[derive(Clone, Default)]
pub struct CallArgs {
    values: HashMap<String, AnyService>,
}

impl CallArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named argument.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, name: impl Into<String>, value: T) -> Self {
        self.values.insert(name.into(), Arc::new(value));
        self
    }

    /// Returns the number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Registry of named services.
///
/// The locator is `Send + Sync`; bindings can be added through a shared
/// reference, so an `Arc<ServiceLocator>` can be handed to the pipeline
/// compiler while bootstrap code is still registering services.
#[derive(Default)]
pub struct ServiceLocator {
    bindings: RwLock<HashMap<String, Binding>>,
    singletons: RwLock<HashMap<String, AnyService>>,
    aliases: RwLock<HashMap<String, String>>,
    tags: RwLock<HashMap<String, Vec<String>>>,
    generations: AtomicU64,
}

impl ServiceLocator {
    /// Creates an empty locator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to a factory.
    ///
    /// With `singleton == true` the first successful resolution is cached for
    /// the locator's lifetime; otherwise every resolution calls the factory.
    /// Rebinding a key replaces the binding and drops any cached singleton.
    pub fn bind<T, F>(&self, key: impl Into<String>, singleton: bool, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> LocatorResult<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |resolver| {
            factory(resolver).map(|value| Arc::new(value) as AnyService)
        });
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        self.insert(
            key.into(),
            Binding::Factory {
                factory,
                singleton,
                generation,
            },
        );
    }

    /// Binds `key` to a lazily-built singleton.
    pub fn singleton<T, F>(&self, key: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> LocatorResult<T> + Send + Sync + 'static,
    {
        self.bind(key, true, factory);
    }

    /// Binds `key` to a factory called on every resolution.
    pub fn transient<T, F>(&self, key: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> LocatorResult<T> + Send + Sync + 'static,
    {
        self.bind(key, false, factory);
    }

    /// Binds `key` to an already-built value.
    pub fn instance<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.insert(key.into(), Binding::Instance(Arc::new(value)));
    }

    /// Binds `key` to an explicit null.
    ///
    /// A null binding is present: [`has`](Self::has) reports `true`,
    /// [`resolve_optional`](Self::resolve_optional) yields `Ok(None)`.
    pub fn bind_null(&self, key: impl Into<String>) {
        self.insert(key.into(), Binding::Null);
    }

    /// Binds the autowired type `T` under its type name.
    pub fn bind_type<T: Autowire>(&self, singleton: bool) {
        self.bind(type_name::<T>(), singleton, T::autowire);
    }

    fn insert(&self, key: String, binding: Binding) {
        let mut bindings = self.bindings.write();
        self.singletons.write().remove(&key);
        bindings.insert(key, binding);
    }

    /// Adds `key` to the tag group `group`.
    pub fn tag(&self, key: impl Into<String>, group: impl Into<String>) {
        let key = key.into();
        let mut tags = self.tags.write();
        let members = tags.entry(group.into()).or_default();
        if !members.contains(&key) {
            members.push(key);
        }
    }

    /// Makes `name` resolve to whatever `key` resolves to.
    ///
    /// Aliases may chain. A chain that loops back on itself is rejected here
    /// and never stored.
    pub fn alias(&self, name: impl Into<String>, key: impl Into<String>) -> LocatorResult<()> {
        let name = name.into();
        let key = key.into();
        let mut aliases = self.aliases.write();

        let mut chain = vec![name.clone()];
        let mut cursor = key.clone();
        loop {
            if chain.contains(&cursor) {
                chain.push(cursor);
                return Err(LocatorError::AliasLoop { chain });
            }
            chain.push(cursor.clone());
            match aliases.get(&cursor) {
                Some(next) => cursor = next.clone(),
                None => break,
            }
        }

        aliases.insert(name, key);
        Ok(())
    }

    /// Follows aliases from `key` to the concrete binding key.
    pub fn canonical(&self, key: &str) -> LocatorResult<String> {
        let aliases = self.aliases.read();
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut cursor = key.to_string();
        while let Some(next) = aliases.get(&cursor) {
            if !seen.insert(cursor.clone()) {
                chain.push(cursor);
                return Err(LocatorError::AliasLoop { chain });
            }
            chain.push(cursor);
            cursor = next.clone();
        }
        Ok(cursor)
    }

    /// Returns `true` if `key` is bound, including to null.
    pub fn has(&self, key: &str) -> bool {
        self.canonical(key)
            .map(|key| self.bindings.read().contains_key(&key))
            .unwrap_or(false)
    }

    /// Returns `true` if `key` is bound to an explicit null.
    pub fn is_null(&self, key: &str) -> bool {
        self.canonical(key)
            .map(|key| matches!(self.bindings.read().get(&key), Some(Binding::Null)))
            .unwrap_or(false)
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Resolves `key` as a `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self, key: &str) -> LocatorResult<Arc<T>> {
        Resolver::new(self).resolve(key)
    }

    /// Resolves `key`, mapping an explicit null binding to `None`.
    ///
    /// A missing key is still an error.
    pub fn resolve_optional<T: Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> LocatorResult<Option<Arc<T>>> {
        match self.resolve(key) {
            Ok(value) => Ok(Some(value)),
            Err(LocatorError::NullBinding { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves `T`, preferring a binding under its type name and otherwise
    /// autowiring it.
    pub fn resolve_type<T: Autowire>(&self) -> LocatorResult<Arc<T>> {
        Resolver::new(self).resolve_type()
    }

    /// Resolves every member of a tag group, in tagging order.
    pub fn tagged<T: Send + Sync + 'static>(&self, group: &str) -> LocatorResult<Vec<Arc<T>>> {
        let members = self.tags.read().get(group).cloned().unwrap_or_default();
        let mut resolver = Resolver::new(self);
        members.iter().map(|key| resolver.resolve(key)).collect()
    }

    /// Invokes `f` with a resolver that sees `extra` before the container.
    ///
    /// ```rust
    /// use keel_core::locator::{CallArgs, ServiceLocator};
    ///
    /// let locator = ServiceLocator::new();
    /// locator.instance("greeting", String::from("hello"));
    ///
    /// let out = locator.call(CallArgs::new().with("name", String::from("keel")), |r| {
    ///     Ok(format!("{} {}", r.arg::<String>("greeting")?, r.arg::<String>("name")?))
    /// });
    /// assert_eq!(out.unwrap(), "hello keel");
    /// ```
    pub fn call<R, F>(&self, extra: CallArgs, f: F) -> LocatorResult<R>
    where
        F: FnOnce(&mut Resolver<'_>) -> LocatorResult<R>,
    {
        let mut resolver = Resolver {
            locator: self,
            stack: Vec::new(),
            extra,
        };
        f(&mut resolver)
    }

    fn binding(&self, key: &str) -> Option<Binding> {
        self.bindings.read().get(key).cloned()
    }

    fn cached(&self, key: &str) -> Option<AnyService> {
        self.singletons.read().get(key).cloned()
    }

    fn cache(&self, key: &str, generation: u64, value: AnyService) -> AnyService {
        // Lock order matches `insert`: bindings, then singletons.
        let bindings = self.bindings.read();
        let current = matches!(
            bindings.get(key),
            Some(Binding::Factory { generation: g, .. }) if *g == generation
        );
        if !current {
            // Rebound while this value was being built.
            return value;
        }
        // Two threads may race to build the same singleton; the first one
        // stored wins and the loser's value is dropped.
        self.singletons
            .write()
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }
}

impl std::fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("bindings", &self.bindings.read().len())
            .field("singletons", &self.singletons.read().len())
            .field("aliases", &self.aliases.read().len())
            .finish()
    }
}

/// One resolution in progress.
///
/// Factories receive the resolver so they can resolve their own
/// dependencies; the stack of keys being built travels with it.
pub struct Resolver<'a> {
    locator: &'a ServiceLocator,
    stack: Vec<String>,
    extra: CallArgs,
}

impl<'a> Resolver<'a> {
    fn new(locator: &'a ServiceLocator) -> Self {
        Self {
            locator,
            stack: Vec::new(),
            extra: CallArgs::default(),
        }
    }

    /// Returns the locator this resolver reads from.
    pub const fn locator(&self) -> &'a ServiceLocator {
        self.locator
    }

    /// Returns the keys currently being built, outermost first.
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    /// Resolves `key` as a `T`.
    pub fn resolve<T: Send + Sync + 'static>(&mut self, key: &str) -> LocatorResult<Arc<T>> {
        let key = self.locator.canonical(key)?;
        let value = self.resolve_any(&key)?;
        downcast(&key, value)
    }

    /// Resolves `T` by type, autowiring it when no binding exists.
    pub fn resolve_type<T: Autowire>(&mut self) -> LocatorResult<Arc<T>> {
        let key = type_name::<T>();
        if self.locator.has(key) {
            return self.resolve(key);
        }
        self.enter(key)?;
        let built = T::autowire(self);
        self.stack.pop();
        built.map(Arc::new)
    }

    /// Returns the named call argument, falling back to the container.
    pub fn arg<T: Send + Sync + 'static>(&mut self, name: &str) -> LocatorResult<Arc<T>> {
        match self.extra.values.get(name) {
            Some(value) => downcast(name, value.clone()),
            None => self.resolve(name),
        }
    }

    fn resolve_any(&mut self, key: &str) -> LocatorResult<AnyService> {
        if let Some(value) = self.locator.cached(key) {
            return Ok(value);
        }

        let binding = self
            .locator
            .binding(key)
            .ok_or_else(|| LocatorError::NotBound {
                key: key.to_string(),
            })?;

        match binding {
            Binding::Null => Err(LocatorError::NullBinding {
                key: key.to_string(),
            }),
            Binding::Instance(value) => Ok(value),
            Binding::Factory {
                factory,
                singleton,
                generation,
            } => {
                self.enter(key)?;
                let built = factory(self);
                self.stack.pop();
                let value = built?;
                if singleton {
                    Ok(self.locator.cache(key, generation, value))
                } else {
                    Ok(value)
                }
            }
        }
    }

    fn enter(&mut self, key: &str) -> LocatorResult<()> {
        if self.stack.iter().any(|k| k == key) {
            let mut chain = self.stack.clone();
            chain.push(key.to_string());
            return Err(LocatorError::CircularDependency { chain });
        }
        self.stack.push(key.to_string());
        Ok(())
    }
}

fn downcast<T: Send + Sync + 'static>(key: &str, value: AnyService) -> LocatorResult<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| LocatorError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        })
}
