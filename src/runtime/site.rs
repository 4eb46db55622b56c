//! Site invocation boundary
//!
//! A site receives its resolved arguments and a [`SiteCall`] handle owning
//! the suspended token. The handle is the only way back into the engine: it
//! resolves the call exactly once (publish, halt, throw or fail) from any
//! thread, and the token is re-queued through the injection queue. Dropping
//! the handle unresolved halts the token.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use super::Shared;
use super::error::SiteError;
use super::library;
use super::token::{Resume, Token, TokenId};
use super::trace::EventKind;
use super::value::Value;

/// An external callable.
pub trait Site: Send + Sync {
    /// Name used in programs and diagnostics.
    fn name(&self) -> &str;

    /// Invoke the site. `call` must eventually be resolved or dropped.
    fn call(&self, args: Vec<Value>, call: SiteCall);
}

/// Shared handle on a site.
pub type SiteRef = Arc<dyn Site>;

/// Continuation handle for one in-flight site call.
pub struct SiteCall {
    token: Option<Box<Token>>,
    site: Arc<str>,
    shared: Arc<Shared>,
}

impl SiteCall {
    pub(crate) fn new(token: Box<Token>, site: Arc<str>, shared: Arc<Shared>) -> Self {
        shared.pending_sites.fetch_add(1, Ordering::AcqRel);
        token.trace(|| EventKind::SiteCall {
            site: site.to_string(),
        });
        Self {
            token: Some(token),
            site,
            shared,
        }
    }

    /// Name of the site being called.
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Token suspended on this call.
    pub fn token_id(&self) -> Option<TokenId> {
        self.token.as_ref().map(|token| token.id())
    }

    /// Runtime for asynchronous work.
    pub fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Write program output through the engine handler.
    pub fn print(&self, text: &str) {
        self.shared.handler.on_print(text);
    }

    /// Return a value; the call site publishes it.
    pub fn publish(mut self, value: Value) {
        self.resolve(Some(Resume::Publish(value)));
    }

    /// Return without a value; the calling token halts.
    pub fn halt(mut self) {
        self.resolve(None);
    }

    /// Raise a domain exception at the call site.
    pub fn throw(mut self, exception: Value) {
        self.resolve(Some(Resume::Throw(exception)));
    }

    /// Raise a host error, catchable as an error record.
    pub fn fail(self, error: SiteError) {
        self.throw(error.into_value());
    }

    /// Resolve from a site result.
    pub fn complete(self, result: Result<Option<Value>, SiteError>) {
        match result {
            Ok(Some(value)) => self.publish(value),
            Ok(None) => self.halt(),
            Err(error) => self.fail(error),
        }
    }

    fn resolve(&mut self, resume: Option<Resume>) {
        let Some(mut token) = self.token.take() else {
            return;
        };
        token.trace(|| EventKind::SiteReturn {
            site: self.site.to_string(),
            value: match &resume {
                Some(Resume::Publish(value)) => Some(value.to_string()),
                _ => None,
            },
        });
        self.shared.pending_sites.fetch_sub(1, Ordering::AcqRel);
        match resume {
            Some(resume) => {
                token.resume = Some(resume);
                self.shared.scheduler.inject(token);
            }
            None => drop(token),
        }
    }
}

impl Drop for SiteCall {
    fn drop(&mut self) {
        self.resolve(None);
    }
}

impl fmt::Debug for SiteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteCall")
            .field("site", &self.site)
            .field("token", &self.token_id())
            .finish()
    }
}

type SyncFn = dyn Fn(&[Value]) -> Result<Option<Value>, SiteError> + Send + Sync;

/// Site backed by a synchronous function. `Ok(None)` halts the caller.
pub struct FnSite {
    name: String,
    f: Box<SyncFn>,
}

impl FnSite {
    /// Wrap a function.
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Option<Value>, SiteError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Site for FnSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>, call: SiteCall) {
        call.complete((self.f)(&args));
    }
}

type AsyncFn =
    dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, SiteError>> + Send + Sync;

/// Site backed by a future, run on the engine's tokio runtime.
pub struct AsyncSite {
    name: String,
    f: Box<AsyncFn>,
}

impl AsyncSite {
    /// Wrap a future-returning function.
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, SiteError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Site for AsyncSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>, call: SiteCall) {
        let future = (self.f)(args);
        let runtime = call.runtime().clone();
        runtime.spawn(async move {
            call.complete(future.await);
        });
    }
}

/// Name to site mapping consulted for `Site` operands.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    sites: HashMap<String, SiteRef>,
}

impl SiteRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the core library.
    pub fn with_core() -> Self {
        let mut registry = Self::new();
        library::install(&mut registry);
        registry
    }

    /// Add or replace a site under its own name.
    pub fn register(&mut self, site: impl Site + 'static) -> &mut Self {
        self.register_ref(Arc::new(site))
    }

    /// Add or replace a shared site.
    pub fn register_ref(&mut self, site: SiteRef) -> &mut Self {
        self.sites.insert(site.name().to_string(), site);
        self
    }

    /// Add a synchronous function site.
    pub fn register_fn(
        &mut self,
        name: &str,
        f: impl Fn(&[Value]) -> Result<Option<Value>, SiteError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.register(FnSite::new(name, f))
    }

    /// Add an asynchronous site.
    pub fn register_async(
        &mut self,
        name: &str,
        f: impl Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, SiteError>>
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        self.register(AsyncSite::new(name, f))
    }

    /// Look a site up by name.
    pub fn get(&self, name: &str) -> Option<SiteRef> {
        self.sites.get(name).cloned()
    }

    /// Whether a site is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    /// Sorted site names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.sites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("sites", &self.names())
            .finish()
    }
}
