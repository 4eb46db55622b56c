//! Execution engine and public API
//!
//! This module provides the [`Engine`] that ties the subsystems together:
//! the node interpreter, region/group termination trees, the token pool and
//! the work-stealing scheduler. Site calls that need real asynchrony run on a
//! private tokio runtime owned by the engine.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

// Submodules
pub mod deque;
pub mod env;
pub mod error;
pub(crate) mod future;
pub mod group;
pub(crate) mod interpreter;
mod library;
pub mod node;
pub mod region;
pub(crate) mod scheduler;
pub mod site;
pub mod storage;
pub mod token;
pub mod trace;
pub mod value;

use deque::Worker;
use env::Env;
use error::{EngineError, ProgramError, Result, TokenError};
use group::GroupCell;
use node::Program;
use region::Region;
use scheduler::Scheduler;
use site::SiteRegistry;
use token::{Cont, Token, TokenPool};
use trace::{EventKind, ExecutionId, LogSink, NullSink, TraceSink, Tracer};
use value::Value;

/// Configuration for the Braid engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads (0 = one per available core)
    pub worker_threads: usize,

    /// Capacity of each worker's deque
    pub deque_capacity: usize,

    /// Bound on simultaneously live tokens (negative = unbounded)
    pub token_pool_size: i64,

    /// Terminate after this many top-level publications
    pub max_publications: Option<u64>,

    /// Threads of the runtime driving asynchronous sites
    pub site_threads: usize,

    /// Steps a token may run before it is re-queued
    pub quantum: usize,

    /// Longest an idle worker sleeps before looking for work again
    pub idle_park_ms: u64,

    /// Log every trace event at `debug` level (target `braid::trace`)
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            deque_capacity: 1024,
            token_pool_size: -1,
            max_publications: None,
            site_threads: 2,
            quantum: 256,
            idle_park_ms: 10,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.deque_capacity == 0 {
            return Err(EngineError::Config("deque_capacity must be positive".into()));
        }
        if self.quantum == 0 {
            return Err(EngineError::Config("quantum must be positive".into()));
        }
        if self.site_threads == 0 {
            return Err(EngineError::Config("site_threads must be positive".into()));
        }
        Ok(())
    }

    /// Worker count with the "one per core" default resolved.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

/// Receiver of program output.
pub trait EngineHandler: Send + Sync {
    /// A value reached the top level.
    fn on_publish(&self, value: &Value);

    /// Text written by the print sites.
    fn on_print(&self, text: &str) {
        print!("{}", text);
    }

    /// A token died with an error. Called once per failure.
    fn on_error(&self, error: &TokenError) {
        eprintln!("error: {}", error);
    }
}

/// Writes publications to stdout and errors to stderr.
#[derive(Debug, Default)]
pub struct StdoutHandler;

impl EngineHandler for StdoutHandler {
    fn on_publish(&self, value: &Value) {
        println!("{}", value);
    }
}

/// Keeps all output in memory.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    publications: Mutex<Vec<Value>>,
    output: Mutex<String>,
    errors: Mutex<Vec<TokenError>>,
}

impl CollectingHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Published values, in arrival order.
    pub fn publications(&self) -> Vec<Value> {
        self.publications.lock().clone()
    }

    /// Everything printed so far.
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    /// Reported errors.
    pub fn errors(&self) -> Vec<TokenError> {
        self.errors.lock().clone()
    }
}

impl EngineHandler for CollectingHandler {
    fn on_publish(&self, value: &Value) {
        self.publications.lock().push(value.clone());
    }

    fn on_print(&self, text: &str) {
        self.output.lock().push_str(text);
    }

    fn on_error(&self, error: &TokenError) {
        self.errors.lock().push(error.clone());
    }
}

/// Aggregate engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Not started yet
    Idle,
    /// Some token is queued or running
    Running,
    /// Live tokens exist but every one of them waits on a future or a site
    Blocked,
    /// Halted
    Dead,
}

/// Why the engine halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// Every token died
    Completed,
    /// `terminate` was called
    Terminated,
    /// `max_publications` was reached
    PublicationLimit,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Completed => write!(f, "completed"),
            HaltReason::Terminated => write!(f, "terminated"),
            HaltReason::PublicationLimit => write!(f, "publication limit"),
        }
    }
}

/// State shared by workers, site calls and the engine handle.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) program: Arc<Program>,
    pub(crate) sites: SiteRegistry,
    pub(crate) pool: Arc<TokenPool>,
    pub(crate) scheduler: Scheduler,
    pub(crate) handler: Arc<dyn EngineHandler>,
    pub(crate) tracer: Arc<Tracer>,
    pub(crate) runtime: Handle,
    pub(crate) root_group: Arc<GroupCell>,
    pub(crate) pending_sites: AtomicUsize,
    publications: AtomicU64,
    halted: Mutex<Option<HaltReason>>,
    halted_cv: Condvar,
}

impl Shared {
    /// Halt once; later calls are ignored.
    pub(crate) fn halt(&self, reason: HaltReason) {
        {
            let mut halted = self.halted.lock();
            if halted.is_some() {
                return;
            }
            *halted = Some(reason);
        }
        info!(%reason, publications = self.publications.load(Ordering::Acquire), "engine halted");
        self.tracer.emit(None, || EventKind::Halt {
            reason: reason.to_string(),
        });
        self.scheduler.halt();
        self.halted_cv.notify_all();
    }

    /// Halt, then cancel everything still alive.
    pub(crate) fn terminate(&self, reason: HaltReason) {
        self.halt(reason);
        self.root_group.kill();
    }

    pub(crate) fn halt_reason(&self) -> Option<HaltReason> {
        *self.halted.lock()
    }

    /// Deliver a top-level publication.
    pub(crate) fn publish_top(&self, token: &Token, value: Value) {
        if self.scheduler.is_halted() {
            return;
        }
        let limit = self.config.max_publications;
        let Ok(previous) =
            self.publications
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match limit {
                    Some(max) if n >= max => None,
                    _ => Some(n + 1),
                })
        else {
            return;
        };
        let count = previous + 1;
        token.trace(|| EventKind::Publish {
            value: value.to_string(),
        });
        self.handler.on_publish(&value);
        if limit == Some(count) {
            debug!(count, "publication limit reached");
            self.terminate(HaltReason::PublicationLimit);
        }
    }

    /// Surface a token failure once through the handler.
    pub(crate) fn report(&self, error: TokenError) {
        if self.scheduler.is_halted() {
            return;
        }
        warn!(token = %error.token, "{}", error);
        self.handler.on_error(&error);
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    program: Program,
    config: EngineConfig,
    sites: SiteRegistry,
    handler: Arc<dyn EngineHandler>,
    sink: Arc<dyn TraceSink>,
}

impl EngineBuilder {
    /// Start from a program with default config, core sites and stdout output.
    pub fn new(program: Program) -> Self {
        Self {
            program,
            config: EngineConfig::default(),
            sites: SiteRegistry::with_core(),
            handler: Arc::new(StdoutHandler),
            sink: Arc::new(NullSink),
        }
    }

    /// Use a configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a site registry.
    pub fn with_sites(mut self, sites: SiteRegistry) -> Self {
        self.sites = sites;
        self
    }

    /// Use an output handler.
    pub fn with_handler(mut self, handler: Arc<dyn EngineHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Record trace events into a sink.
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate everything and build the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        self.program.validate()?;
        if let Some(name) = self
            .program
            .site_names()
            .into_iter()
            .find(|name| !self.sites.contains(name))
        {
            return Err(ProgramError::UnknownSite(name.to_string()).into());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.site_threads)
            .thread_name("braid-site")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Init(format!("site runtime: {}", e)))?;

        let execution = ExecutionId::new();
        let sink: Arc<dyn TraceSink> = if self.config.debug {
            Arc::new(LogSink::new(self.sink))
        } else {
            self.sink
        };
        let workers = self.config.effective_workers();
        let (scheduler, locals) = Scheduler::new(
            workers,
            self.config.deque_capacity,
            Duration::from_millis(self.config.idle_park_ms),
        );

        let shared = Arc::new(Shared {
            pool: TokenPool::new(self.config.token_pool_size),
            program: Arc::new(self.program),
            sites: self.sites,
            scheduler,
            handler: self.handler,
            tracer: Arc::new(Tracer::new(execution, sink)),
            runtime: runtime.handle().clone(),
            root_group: GroupCell::root(),
            pending_sites: AtomicUsize::new(0),
            publications: AtomicU64::new(0),
            halted: Mutex::new(None),
            halted_cv: Condvar::new(),
            config: self.config,
        });

        debug!(%execution, workers, "engine created");
        Ok(Engine {
            shared,
            runtime: Some(runtime),
            locals: Mutex::new(locals),
            workers: Vec::new(),
            started: false,
        })
    }
}

/// A running (or runnable) program
pub struct Engine {
    shared: Arc<Shared>,
    runtime: Option<tokio::runtime::Runtime>,
    locals: Mutex<Vec<Worker<Box<Token>>>>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl Engine {
    /// Create an engine with stdout output.
    pub fn new(config: EngineConfig, program: Program, sites: SiteRegistry) -> Result<Self> {
        EngineBuilder::new(program)
            .with_config(config)
            .with_sites(sites)
            .build()
    }

    /// Spawn the workers and admit the root token.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.started = true;

        let shared = &self.shared;
        let permit = shared.pool.new_token()?;
        let fingerprint = shared.program.fingerprint();
        info!(
            execution = %shared.tracer.execution(),
            program = %shared.program.name,
            %fingerprint,
            "engine starting"
        );
        shared.tracer.emit(None, || EventKind::Start { fingerprint });

        let locals = std::mem::take(&mut *self.locals.lock());
        for (index, local) in locals.into_iter().enumerate() {
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("braid-worker-{}", index))
                .spawn(move || scheduler::run_worker(worker_shared, index, local))
                .map_err(|e| EngineError::Init(format!("worker thread: {}", e)))?;
            self.workers.push(handle);
        }

        let engine = Arc::downgrade(shared);
        let root_region = Region::root(move || {
            if let Some(shared) = engine.upgrade() {
                shared.halt(HaltReason::Completed);
            }
        });
        let root = Token::new(
            permit,
            shared.program.root(),
            Env::new(),
            Cont::new(),
            shared.root_group.clone(),
            root_region,
            shared.tracer.clone(),
        );
        shared.scheduler.inject(root);
        Ok(())
    }

    /// Start and wait for the engine to halt.
    pub fn run(&mut self) -> Result<HaltReason> {
        self.start()?;
        Ok(self.wait())
    }

    /// Block until the engine halts.
    pub fn wait(&self) -> HaltReason {
        let mut halted = self.shared.halted.lock();
        loop {
            if let Some(reason) = *halted {
                return reason;
            }
            self.shared.halted_cv.wait(&mut halted);
        }
    }

    /// Block until the engine halts or `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<HaltReason> {
        let mut halted = self.shared.halted.lock();
        if halted.is_none() {
            self.shared
                .halted_cv
                .wait_while_for(&mut halted, |halted| halted.is_none(), timeout);
        }
        *halted
    }

    /// Aggregate status.
    pub fn status(&self) -> EngineStatus {
        if !self.started {
            EngineStatus::Idle
        } else if self.shared.halt_reason().is_some() {
            EngineStatus::Dead
        } else if self.shared.scheduler.is_busy() || self.shared.pool.live() == 0 {
            // No live token and not yet halted: the root region is closing.
            EngineStatus::Running
        } else {
            EngineStatus::Blocked
        }
    }

    /// Whether no token can make progress without outside help.
    pub fn is_blocked(&self) -> bool {
        self.status() == EngineStatus::Blocked
    }

    /// Whether the engine has halted.
    pub fn is_dead(&self) -> bool {
        self.status() == EngineStatus::Dead
    }

    /// Why the engine halted, if it has.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.shared.halt_reason()
    }

    /// Cancel the whole run by killing the root group.
    pub fn terminate(&self) {
        self.shared.terminate(HaltReason::Terminated);
    }

    /// Top-level publications so far.
    pub fn publications(&self) -> u64 {
        self.shared.publications.load(Ordering::Acquire)
    }

    /// Site calls that have not resolved yet.
    pub fn pending_site_calls(&self) -> usize {
        self.shared.pending_sites.load(Ordering::Acquire)
    }

    /// Tokens currently holding a pool permit.
    pub fn live_tokens(&self) -> usize {
        self.shared.pool.live()
    }

    /// Identifier stamped on this run's trace events.
    pub fn execution(&self) -> ExecutionId {
        self.shared.tracer.execution()
    }

    /// Program being run.
    pub fn program(&self) -> &Program {
        &self.shared.program
    }

    /// Stop everything and release all tokens.
    pub fn shutdown(mut self) -> Option<HaltReason> {
        self.stop();
        self.halt_reason()
    }

    fn stop(&mut self) {
        self.shared.terminate(HaltReason::Terminated);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        drop(self.shared.scheduler.drain_injector());
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_millis(100));
        }
        self.shared.pool.teardown();
        debug!(live = self.shared.pool.live(), "engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("execution", &self.execution())
            .field("program", &self.shared.program.name)
            .field("status", &self.status())
            .finish()
    }
}
