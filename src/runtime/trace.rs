//! Lifecycle event stream
//!
//! The engine emits a fixed vocabulary of events to a [`TraceSink`]. Sinks
//! must never block the emitting worker: the file sink hands events to a
//! background writer thread over an unbounded channel.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;
use uuid::Uuid;

use super::group::GroupId;
use super::token::TokenId;

/// Identifier of one engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Create a new random ExecutionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    /// Engine started on a program
    Start {
        /// Program fingerprint
        fingerprint: String,
    },
    /// A token forked a child
    Fork {
        /// New token
        child: TokenId,
    },
    /// A token died
    Die,
    /// A token parked on a pending future
    Block {
        /// Group waited on
        group: GroupId,
    },
    /// A parked token was reactivated with a value
    Unblock {
        /// Group that resolved
        group: GroupId,
    },
    /// Top-level publication
    Publish {
        /// Rendered value
        value: String,
    },
    /// Uncaught error
    Error {
        /// Rendered error
        message: String,
    },
    /// Site invocation started
    SiteCall {
        /// Site name
        site: String,
    },
    /// Site invocation resolved (`value` is `None` when it halted)
    SiteReturn {
        /// Site name
        site: String,
        /// Rendered value
        value: Option<String>,
    },
    /// Engine halted
    Halt {
        /// Rendered halt reason
        reason: String,
    },
}

/// One trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Per-execution sequence number
    pub seq: u64,
    /// Wall-clock time of emission
    pub at: DateTime<Utc>,
    /// Engine run
    pub execution: ExecutionId,
    /// Token concerned, if any
    pub token: Option<TokenId>,
    /// Event payload
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Consumer of trace events. Implementations must not block.
pub trait TraceSink: Send + Sync {
    /// Accept one event.
    fn record(&self, event: TraceEvent);

    /// Whether events should be built at all.
    fn enabled(&self) -> bool {
        true
    }
}

/// Stamps events and forwards them to the configured sink.
pub struct Tracer {
    execution: ExecutionId,
    seq: AtomicU64,
    enabled: bool,
    sink: Arc<dyn TraceSink>,
}

impl Tracer {
    /// Wrap a sink for one execution.
    pub fn new(execution: ExecutionId, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            execution,
            seq: AtomicU64::new(0),
            enabled: sink.enabled(),
            sink,
        }
    }

    /// Whether events are built and recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Execution this tracer stamps.
    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    /// Emit an event; `kind` is only built when the sink is enabled.
    pub fn emit(&self, token: Option<TokenId>, kind: impl FnOnce() -> EventKind) {
        if !self.enabled {
            return;
        }
        self.sink.record(TraceEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            execution: self.execution,
            token,
            kind: kind(),
        });
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn record(&self, _event: TraceEvent) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Count events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| predicate(&event.kind))
            .count()
    }
}

impl TraceSink for MemorySink {
    fn record(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events over an unbounded tokio channel.
pub struct ChannelSink {
    tx: UnboundedSender<TraceEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end.
    pub fn new() -> (Self, UnboundedReceiver<TraceEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TraceSink for ChannelSink {
    fn record(&self, event: TraceEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Logs every event at `debug` level, then forwards it.
///
/// Installed by the engine when `EngineConfig::debug` is set.
pub struct LogSink {
    inner: Arc<dyn TraceSink>,
}

impl LogSink {
    /// Wrap another sink.
    pub fn new(inner: Arc<dyn TraceSink>) -> Self {
        Self { inner }
    }
}

impl TraceSink for LogSink {
    fn record(&self, event: TraceEvent) {
        debug!(
            target: "braid::trace",
            seq = event.seq,
            token = ?event.token,
            kind = ?event.kind,
            "trace event"
        );
        if self.inner.enabled() {
            self.inner.record(event);
        }
    }
}

/// Writes JSON lines from a background thread.
pub struct JsonLinesSink {
    inner: ChannelSink,
}

/// Handle on the writer thread of a [`JsonLinesSink`].
pub struct TraceWriter {
    handle: JoinHandle<std::io::Result<u64>>,
}

impl JsonLinesSink {
    /// Create the output file and start the writer thread.
    pub fn create(path: &Path) -> anyhow::Result<(Self, TraceWriter)> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create trace file: {:?}", path))?;
        let (inner, mut rx) = ChannelSink::new();

        let handle = std::thread::Builder::new()
            .name("braid-trace".into())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                let mut written = 0u64;
                while let Some(event) = rx.blocking_recv() {
                    serde_json::to_writer(&mut out, &event)?;
                    out.write_all(b"\n")?;
                    written += 1;
                }
                out.flush()?;
                Ok(written)
            })
            .context("Failed to spawn trace writer")?;

        Ok((Self { inner }, TraceWriter { handle }))
    }
}

impl TraceSink for JsonLinesSink {
    fn record(&self, event: TraceEvent) {
        self.inner.record(event);
    }
}

impl TraceWriter {
    /// Wait for the writer to drain. Returns the number of events written.
    ///
    /// The writer only finishes once every clone of the sink has been dropped,
    /// i.e. after the engine that used it is gone.
    pub fn finish(self) -> anyhow::Result<u64> {
        let written = self
            .handle
            .join()
            .map_err(|_| anyhow::anyhow!("trace writer panicked"))?
            .context("Failed to write trace")?;
        Ok(written)
    }
}
