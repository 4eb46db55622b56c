use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use braid::runtime::error::TokenFault;
use braid::runtime::trace::{EventKind, MemorySink};
use braid::{
    Arg, CollectingHandler, Def, Engine, EngineBuilder, EngineConfig, EngineStatus, HaltReason,
    Program, ProgramBuilder, SiteError, SiteRegistry, Value,
};
use futures::FutureExt;

fn config() -> EngineConfig {
    EngineConfig {
        worker_threads: 2,
        idle_park_ms: 1,
        ..EngineConfig::default()
    }
}

struct Outcome {
    reason: HaltReason,
    handler: Arc<CollectingHandler>,
}

impl Outcome {
    fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.handler.output().lines().map(str::to_string).collect();
        lines.sort();
        lines
    }
}

fn build(program: Program, config: EngineConfig, sites: SiteRegistry) -> (Engine, Arc<CollectingHandler>) {
    let handler = Arc::new(CollectingHandler::new());
    let engine = EngineBuilder::new(program)
        .with_config(config)
        .with_sites(sites)
        .with_handler(handler.clone())
        .build()
        .expect("engine should build");
    (engine, handler)
}

fn run_with(program: Program, config: EngineConfig) -> Outcome {
    let (mut engine, handler) = build(program, config, SiteRegistry::with_core());
    engine.start().expect("engine should start");
    let reason = engine
        .wait_timeout(Duration::from_secs(10))
        .expect("engine should halt");
    engine.shutdown();
    Outcome { reason, handler }
}

fn run(program: Program) -> Outcome {
    run_with(program, config())
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_prune_binds_exactly_one_publication() {
    // println(x) <x< (1 | 2)
    let mut b = ProgramBuilder::new();
    let body = b.call_site("println", vec![Arg::var(0)]);
    let one = b.publish(Arg::int(1));
    let two = b.publish(Arg::int(2));
    let both = b.fork(one, two);
    let root = b.prune(body, both, Some("x"));
    let outcome = run(b.build("prune", root).unwrap());

    assert_eq!(outcome.reason, HaltReason::Completed);
    let lines = outcome.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0] == "1" || lines[0] == "2", "unexpected output {:?}", lines);
    assert_eq!(outcome.handler.publications(), vec![Value::Signal]);
}

#[test]
fn test_sequence_runs_consumer_per_publication() {
    // (1 | 2 | 3) >x> println(x)
    let mut b = ProgramBuilder::new();
    let one = b.publish(Arg::int(1));
    let two = b.publish(Arg::int(2));
    let three = b.publish(Arg::int(3));
    let tail = b.fork(two, three);
    let values = b.fork(one, tail);
    let print = b.call_site("println", vec![Arg::var(0)]);
    let root = b.sequence(values, print);
    let outcome = run(b.build("sequence", root).unwrap());

    assert_eq!(outcome.reason, HaltReason::Completed);
    assert_eq!(outcome.lines(), vec!["1", "2", "3"]);
    assert_eq!(outcome.handler.publications().len(), 3);
}

#[test]
fn test_otherwise_runs_fallback_only_after_silent_halt() {
    // stop ; 3
    let mut b = ProgramBuilder::new();
    let stop = b.stop();
    let three = b.publish(Arg::int(3));
    let root = b.otherwise(stop, three);
    let outcome = run(b.build("fallback", root).unwrap());
    assert_eq!(outcome.handler.publications(), vec![Value::Integer(3)]);

    // (1 | 2) ; 9
    let mut b = ProgramBuilder::new();
    let one = b.publish(Arg::int(1));
    let two = b.publish(Arg::int(2));
    let both = b.fork(one, two);
    let nine = b.publish(Arg::int(9));
    let root = b.otherwise(both, nine);
    let outcome = run(b.build("preferred", root).unwrap());
    let mut published = outcome.handler.publications();
    published.sort_by_key(|value| value.as_integer());
    assert_eq!(published, vec![Value::Integer(1), Value::Integer(2)]);
}

#[test]
fn test_otherwise_waits_for_site_calls_on_the_left() {
    // if(false) ; "fallback"
    let mut b = ProgramBuilder::new();
    let test = b.call_site("if", vec![Arg::boolean(false)]);
    let fallback = b.publish(Arg::string("fallback"));
    let root = b.otherwise(test, fallback);
    let outcome = run(b.build("if-else", root).unwrap());
    assert_eq!(outcome.handler.publications(), vec![Value::from("fallback")]);
}

#[test]
fn test_catch_receives_thrown_value() {
    // try throw "bad" catch e -> e
    let mut b = ProgramBuilder::new();
    let body = b.throw(Arg::string("bad"));
    let handler = b.publish(Arg::var(0));
    let root = b.catch(body, handler);
    let outcome = run(b.build("catch", root).unwrap());

    assert_eq!(outcome.handler.publications(), vec![Value::from("bad")]);
    assert!(outcome.handler.errors().is_empty());
}

#[test]
fn test_site_errors_are_catchable_records() {
    // try div(1, 0) catch e -> e
    let mut b = ProgramBuilder::new();
    let body = b.call_site("div", vec![Arg::int(1), Arg::int(0)]);
    let handler = b.publish(Arg::var(0));
    let root = b.catch(body, handler);
    let outcome = run(b.build("div-zero", root).unwrap());

    let published = outcome.handler.publications();
    assert_eq!(published.len(), 1);
    assert!(published[0].has_label("error"), "got {}", published[0]);
}

#[test]
fn test_uncaught_exception_is_reported_once() {
    let mut b = ProgramBuilder::new();
    let one = b.publish(Arg::int(1));
    let boom = b.throw(Arg::int(7));
    let root = b.fork(one, boom);
    let outcome = run(b.build("uncaught", root).unwrap());

    assert_eq!(outcome.reason, HaltReason::Completed);
    assert_eq!(outcome.handler.publications(), vec![Value::Integer(1)]);
    let errors = outcome.handler.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].fault, TokenFault::Uncaught(Value::Integer(7))));
}

/// def down(n) =
///     (lte(n, 0) >b> if(b) >> "done")
///   | (gt(n, 0) >b> if(b) >> sub(n, 1) >m> down(m))
/// down(count)
fn countdown(count: i64) -> Program {
    let mut b = ProgramBuilder::new();

    // Scope inside `down`: n = 0, down = 1.
    let lte = b.call_site("lte", vec![Arg::var(0), Arg::int(0)]);
    let test = b.call_site("if", vec![Arg::var(0)]);
    let done = b.publish(Arg::string("done"));
    let finish = b.sequence(test, done);
    let base = b.sequence(lte, finish);

    let gt = b.call_site("gt", vec![Arg::var(0), Arg::int(0)]);
    let test = b.call_site("if", vec![Arg::var(0)]);
    let dec = b.call_site("sub", vec![Arg::var(2), Arg::int(1)]);
    let recurse = b.call(Arg::var(4), vec![Arg::var(0)]);
    let step = b.sequence(dec, recurse);
    let guarded = b.sequence(test, step);
    let inductive = b.sequence(gt, guarded);

    let def_body = b.fork(base, inductive);
    let main = b.call(Arg::var(0), vec![Arg::int(count)]);
    let root = b.declare_defs(
        vec![Def {
            name: "down".into(),
            arity: 1,
            body: def_body,
        }],
        main,
    );
    b.build("countdown", root).unwrap()
}

#[test]
fn test_recursive_definitions_run_in_constant_stack() {
    let outcome = run(countdown(2_000));
    assert_eq!(outcome.reason, HaltReason::Completed);
    assert_eq!(outcome.handler.publications(), vec![Value::from("done")]);
    assert!(outcome.handler.errors().is_empty());
}

#[test]
fn test_wrong_arity_call_raises() {
    // def f(a, b) = a ; try f(1) catch e -> e
    let mut b = ProgramBuilder::new();
    let body = b.publish(Arg::var(1));
    let call = b.call(Arg::var(0), vec![Arg::int(1)]);
    let handler = b.publish(Arg::var(0));
    let guarded = b.catch(call, handler);
    let root = b.declare_defs(
        vec![Def {
            name: "f".into(),
            arity: 2,
            body,
        }],
        guarded,
    );
    let outcome = run(b.build("arity", root).unwrap());
    let published = outcome.handler.publications();
    assert_eq!(published.len(), 1);
    assert!(published[0].has_label("error"));
}

#[test]
fn test_blocked_reader_wakes_when_future_binds() {
    // add(x, 1) <x< (Rwait(20) >> 41)
    let mut b = ProgramBuilder::new();
    let body = b.call_site("add", vec![Arg::var(0), Arg::int(1)]);
    let wait = b.call_site("Rwait", vec![Arg::int(20)]);
    let value = b.publish(Arg::int(41));
    let producer = b.sequence(wait, value);
    let root = b.prune(body, producer, Some("x"));

    let sink = Arc::new(MemorySink::new());
    let handler = Arc::new(CollectingHandler::new());
    let mut engine = EngineBuilder::new(b.build("future", root).unwrap())
        .with_config(config())
        .with_handler(handler.clone())
        .with_trace_sink(sink.clone())
        .build()
        .unwrap();
    assert_eq!(engine.run().unwrap(), HaltReason::Completed);
    engine.shutdown();

    assert_eq!(handler.publications(), vec![Value::Integer(42)]);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Block { .. })), 1);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Unblock { .. })), 1);
}

#[test]
fn test_fast_producer_wins_and_slow_one_is_cancelled() {
    // x <x< (Rwait(500) >> "slow" | Rwait(5) >> "fast")
    let mut b = ProgramBuilder::new();
    let body = b.publish(Arg::var(0));
    let slow_wait = b.call_site("Rwait", vec![Arg::int(500)]);
    let slow_value = b.publish(Arg::string("slow"));
    let slow = b.sequence(slow_wait, slow_value);
    let fast_wait = b.call_site("Rwait", vec![Arg::int(5)]);
    let fast_value = b.publish(Arg::string("fast"));
    let fast = b.sequence(fast_wait, fast_value);
    let race = b.fork(slow, fast);
    let root = b.prune(body, race, Some("x"));

    let started = Instant::now();
    let outcome = run(b.build("race", root).unwrap());
    assert_eq!(outcome.reason, HaltReason::Completed);
    assert_eq!(outcome.handler.publications(), vec![Value::from("fast")]);
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[test]
fn test_terminate_while_blocked_on_site() {
    let mut b = ProgramBuilder::new();
    let root = b.call_site("Rwait", vec![Arg::int(60_000)]);
    let (mut engine, handler) = build(b.build("sleepy", root).unwrap(), config(), SiteRegistry::with_core());

    assert_eq!(engine.status(), EngineStatus::Idle);
    engine.start().unwrap();
    wait_for("blocked status", || engine.status() == EngineStatus::Blocked);
    assert!(engine.is_blocked());
    assert_eq!(engine.pending_site_calls(), 1);
    assert_eq!(engine.live_tokens(), 1);

    engine.terminate();
    assert_eq!(engine.wait(), HaltReason::Terminated);
    assert!(engine.is_dead());
    assert_eq!(engine.shutdown(), Some(HaltReason::Terminated));
    assert!(handler.publications().is_empty());
}

#[test]
fn test_publication_limit_terminates() {
    let mut b = ProgramBuilder::new();
    let mut branches: Vec<_> = (0..8).map(|n| b.publish(Arg::int(n))).collect();
    let mut root = branches.pop().unwrap();
    while let Some(next) = branches.pop() {
        root = b.fork(next, root);
    }
    let outcome = run_with(
        b.build("many", root).unwrap(),
        EngineConfig {
            max_publications: Some(2),
            ..config()
        },
    );

    assert_eq!(outcome.reason, HaltReason::PublicationLimit);
    assert_eq!(outcome.handler.publications().len(), 2);
}

#[test]
fn test_token_limit_reports_resource_exhaustion() {
    let mut b = ProgramBuilder::new();
    let one = b.publish(Arg::int(1));
    let two = b.publish(Arg::int(2));
    let root = b.fork(one, two);
    let outcome = run_with(
        b.build("crowded", root).unwrap(),
        EngineConfig {
            token_pool_size: 1,
            ..config()
        },
    );

    assert_eq!(outcome.reason, HaltReason::Completed);
    assert!(outcome.handler.publications().is_empty());
    let errors = outcome.handler.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].fault, TokenFault::ResourceExhausted(limit) if limit.capacity == 1));
}

#[test]
fn test_live_tokens_drain_on_completion() {
    let (mut engine, _handler) = build(countdown(50), config(), SiteRegistry::with_core());
    assert_eq!(engine.run().unwrap(), HaltReason::Completed);
    assert_eq!(engine.live_tokens(), 0);
    assert_eq!(engine.pending_site_calls(), 0);
    assert!(engine.start().is_err());
}

#[test]
fn test_custom_sites() {
    let mut sites = SiteRegistry::with_core();
    sites.register_fn("double", |args| match args {
        [Value::Integer(n)] => Ok(Some(Value::Integer(n * 2))),
        _ => Err(SiteError::Failed("double expects one integer".into())),
    });
    sites.register_async("later", |args| {
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, SiteError>(args.into_iter().next())
        }
        .boxed()
    });

    // later(21) >x> double(x)
    let mut b = ProgramBuilder::new();
    let later = b.call_site("later", vec![Arg::int(21)]);
    let double = b.call_site("double", vec![Arg::var(0)]);
    let root = b.sequence(later, double);

    let (mut engine, handler) = build(b.build("custom", root).unwrap(), config(), sites);
    assert_eq!(engine.run().unwrap(), HaltReason::Completed);
    engine.shutdown();
    assert_eq!(handler.publications(), vec![Value::Integer(42)]);
}

#[test]
fn test_trace_records_lifecycle() {
    let mut b = ProgramBuilder::new();
    let hello = b.call_site("println", vec![Arg::string("hello")]);
    let world = b.call_site("println", vec![Arg::string("world")]);
    let root = b.fork(hello, world);

    let sink = Arc::new(MemorySink::new());
    let handler = Arc::new(CollectingHandler::new());
    let mut engine = EngineBuilder::new(b.build("trace", root).unwrap())
        .with_config(config())
        .with_handler(handler.clone())
        .with_trace_sink(sink.clone())
        .build()
        .unwrap();
    let execution = engine.execution();
    engine.run().unwrap();
    engine.shutdown();

    let events = sink.events();
    assert!(events.iter().all(|event| event.execution == execution));
    assert!(matches!(events.first().map(|e| &e.kind), Some(EventKind::Start { .. })));
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Fork { .. })), 1);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::SiteCall { .. })), 2);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::SiteReturn { .. })), 2);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Publish { .. })), 2);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Die)), 2);
    assert_eq!(sink.count(|kind| matches!(kind, EventKind::Halt { .. })), 1);
}

#[test]
fn test_many_workers_share_a_wide_fork() {
    // 0 | 1 | ... | 199, each printed
    let mut b = ProgramBuilder::new();
    let mut branches: Vec<_> = (0..200)
        .map(|n| b.call_site("println", vec![Arg::int(n)]))
        .collect();
    let mut root = branches.pop().unwrap();
    while let Some(next) = branches.pop() {
        root = b.fork(next, root);
    }
    let outcome = run_with(
        b.build("wide", root).unwrap(),
        EngineConfig {
            worker_threads: 4,
            deque_capacity: 8,
            quantum: 3,
            ..config()
        },
    );

    assert_eq!(outcome.reason, HaltReason::Completed);
    assert_eq!(outcome.handler.output().lines().count(), 200);
    assert_eq!(outcome.handler.publications().len(), 200);
}
