//! Node interpreter
//!
//! Advances one token until it suspends (parked on a future, handed to a
//! site, re-queued after its quantum) or dies. Blocking never holds a native
//! stack frame: a parked token is re-run from the node it blocked at once the
//! future resolves, and exceptions unwind along the continuation chain only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::Shared;
use super::env::Binding;
use super::error::{SiteError, TokenError, TokenFault, TokenLimitReached};
use super::future::{Forceable, Forced};
use super::node::{Arg, Node, NodeId};
use super::region::Region;
use super::scheduler::WorkerContext;
use super::site::SiteCall;
use super::token::{Frame, Resume, Token};
use super::trace::EventKind;
use super::value::{Closure, Value};

enum Step {
    /// Keep running this token.
    Continue(Box<Token>),
    /// The token is parked, handed off or dead.
    Suspended,
}

enum Operand<T> {
    Ready(T, Box<Token>),
    Blocked,
    Fault(Box<Token>, SiteError),
}

/// Run `token` for at most one quantum.
pub(crate) fn run(ctx: &WorkerContext, token: Box<Token>) {
    let mut token = token;
    for _ in 0..ctx.shared.config.quantum.max(1) {
        match step(ctx, token) {
            Step::Continue(next) => token = next,
            Step::Suspended => return,
        }
    }
    trace!(token = %token.id, "quantum expired");
    ctx.spawn(token);
}

fn step(ctx: &WorkerContext, mut token: Box<Token>) -> Step {
    if !token.group.is_alive() {
        return Step::Suspended;
    }
    if let Some(resume) = token.resume.take() {
        return match resume {
            Resume::Publish(value) => publish(ctx, token, value),
            Resume::Throw(exception) => raise(ctx, token, exception),
        };
    }

    let shared = &ctx.shared;
    match shared.program.node(token.node) {
        Node::Call { target, args } => {
            let (callee, token) = match operand(shared, token, target) {
                Operand::Ready(value, token) => (value, token),
                Operand::Blocked => return Step::Suspended,
                Operand::Fault(token, err) => return raise(ctx, token, err.into_value()),
            };
            let (values, token) = match operands(shared, token, args) {
                Operand::Ready(values, token) => (values, token),
                Operand::Blocked => return Step::Suspended,
                Operand::Fault(token, err) => return raise(ctx, token, err.into_value()),
            };
            call(ctx, token, callee, values)
        }
        Node::Publish { value } => match operand(shared, token, value) {
            Operand::Ready(value, token) => publish(ctx, token, value),
            Operand::Blocked => Step::Suspended,
            Operand::Fault(token, err) => raise(ctx, token, err.into_value()),
        },
        Node::Fork { left, right } => {
            let permit = match shared.pool.new_token() {
                Ok(permit) => permit,
                Err(limit) => return exhausted(shared, token, limit),
            };
            let child = token.fork(permit, *right);
            token.trace(|| EventKind::Fork { child: child.id });
            ctx.spawn(child);
            token.node = *left;
            Step::Continue(token)
        }
        Node::Sequence { left, right } => {
            token.cont = token.cont.push(Frame::Sequence {
                right: *right,
                env: token.env.clone(),
            });
            token.node = *left;
            Step::Continue(token)
        }
        Node::Prune { left, right, .. } => {
            let permit = match shared.pool.new_token() {
                Ok(permit) => permit,
                Err(limit) => return exhausted(shared, token, limit),
            };
            let (region, group) = Region::with_group(&token.region, &token.group);
            let mut producer = token.fork(permit, *right);
            producer.cont = token.cont.push(Frame::Prune {
                group: group.clone(),
            });
            producer.group = group.clone();
            producer.set_region(region);
            token.trace(|| EventKind::Fork { child: producer.id });
            ctx.spawn(producer);

            token.env = token.env.extend(Binding::Future(group));
            token.node = *left;
            Step::Continue(token)
        }
        Node::Otherwise { left, right } => {
            let published = Arc::new(AtomicBool::new(false));
            let region = fallback_region(shared, &token, *right, published.clone());
            token.cont = token.cont.push(Frame::Otherwise { published });
            token.set_region(region);
            token.node = *left;
            Step::Continue(token)
        }
        Node::Stop => Step::Suspended,
        Node::Catch { body, handler } => {
            token.cont = token.cont.push(Frame::Catch {
                handler: *handler,
                env: token.env.clone(),
                group: token.group.clone(),
                region: token.region.clone(),
            });
            token.node = *body;
            Step::Continue(token)
        }
        Node::Throw { value } => match operand(shared, token, value) {
            Operand::Ready(exception, token) => raise(ctx, token, exception),
            Operand::Blocked => Step::Suspended,
            Operand::Fault(token, err) => raise(ctx, token, err.into_value()),
        },
        Node::DeclareDefs { defs, body } => {
            let captured = token.env.clone();
            let mut env = captured.clone();
            for index in 0..defs.len() {
                env = env.extend(Value::Closure(Arc::new(Closure {
                    decl: token.node,
                    index,
                    env: captured.clone(),
                })));
            }
            token.env = env;
            token.node = *body;
            Step::Continue(token)
        }
        Node::WithLocation { body, location } => {
            token.location = Some(location.clone());
            token.node = *body;
            Step::Continue(token)
        }
    }
}

/// Resolve one operand, forcing futures.
fn operand(shared: &Shared, token: Box<Token>, arg: &Arg) -> Operand<Value> {
    match arg {
        Arg::Constant(literal) => Operand::Ready(Value::from(literal), token),
        Arg::Site(name) => match shared.sites.get(name) {
            Some(site) => Operand::Ready(Value::Site(site), token),
            None => Operand::Fault(token, SiteError::UnknownSite(name.clone())),
        },
        Arg::Var(index) => {
            let Some(binding) = token.env.lookup(*index).cloned() else {
                return Operand::Fault(
                    token,
                    SiteError::Failed(format!("unbound variable {}", index)),
                );
            };
            match binding.force(token) {
                Forced::Ready(value, token) => Operand::Ready(value, token),
                Forced::NotReady => Operand::Blocked,
            }
        }
    }
}

/// Resolve all operands left to right.
fn operands(shared: &Shared, token: Box<Token>, args: &[Arg]) -> Operand<Vec<Value>> {
    let mut token = token;
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match operand(shared, token, arg) {
            Operand::Ready(value, next) => {
                values.push(value);
                token = next;
            }
            Operand::Blocked => return Operand::Blocked,
            Operand::Fault(token, err) => return Operand::Fault(token, err),
        }
    }
    Operand::Ready(values, token)
}

fn call(ctx: &WorkerContext, mut token: Box<Token>, callee: Value, args: Vec<Value>) -> Step {
    match callee {
        Value::Site(site) => {
            let name: Arc<str> = Arc::from(site.name());
            site.call(args, SiteCall::new(token, name, ctx.shared.clone()));
            Step::Suspended
        }
        Value::Closure(closure) => {
            let Node::DeclareDefs { defs, .. } = ctx.shared.program.node(closure.decl) else {
                let err = SiteError::Failed(format!("closure {} has no definitions", closure.decl));
                return raise(ctx, token, err.into_value());
            };
            let Some(def) = defs.get(closure.index) else {
                let err = SiteError::Failed(format!("closure {} is out of range", closure.decl));
                return raise(ctx, token, err.into_value());
            };
            if def.arity != args.len() {
                let err = SiteError::Arity {
                    site: def.name.clone(),
                    expected: def.arity,
                    got: args.len(),
                };
                return raise(ctx, token, err.into_value());
            }

            // Tail call: definition body runs with the caller's continuation.
            let mut env = closure.env.clone();
            for index in 0..defs.len() {
                env = env.extend(Value::Closure(Arc::new(Closure {
                    decl: closure.decl,
                    index,
                    env: closure.env.clone(),
                })));
            }
            for arg in args {
                env = env.extend(arg);
            }
            token.env = env;
            token.node = def.body;
            Step::Continue(token)
        }
        other => raise(ctx, token, SiteError::Uncallable(other.to_string()).into_value()),
    }
}

/// Hand `value` to the innermost continuation frame.
fn publish(ctx: &WorkerContext, mut token: Box<Token>, value: Value) -> Step {
    loop {
        let Some((frame, rest)) = token.cont.split() else {
            ctx.shared.publish_top(&token, value);
            return Step::Suspended;
        };
        match frame {
            Frame::Sequence { right, env } => {
                token.env = env.extend(value);
                token.cont = rest;
                token.node = right;
                return Step::Continue(token);
            }
            Frame::Prune { group } => {
                if let Some(woken) = group.bind(value) {
                    trace!(token = %token.id, group = %group.id(), woken = woken.len(), "bound");
                    for waiter in woken {
                        ctx.spawn(waiter);
                    }
                }
                return Step::Suspended;
            }
            Frame::Otherwise { published } => {
                published.store(true, Ordering::Release);
                token.cont = rest;
            }
            Frame::Catch { .. } => token.cont = rest,
        }
    }
}

/// Unwind to the nearest handler, or report the exception and die.
fn raise(ctx: &WorkerContext, mut token: Box<Token>, exception: Value) -> Step {
    loop {
        match token.cont.split() {
            Some((
                Frame::Catch {
                    handler,
                    env,
                    group,
                    region,
                },
                rest,
            )) => {
                token.env = env.extend(exception);
                token.cont = rest;
                token.group = group;
                token.set_region(region);
                token.node = handler;
                return Step::Continue(token);
            }
            // The pruning scope was cancelled: the exception dies with it.
            Some((Frame::Prune { group }, _)) if !group.is_alive() => {
                trace!(token = %token.id, group = %group.id(), "exception dropped in cancelled scope");
                return Step::Suspended;
            }
            Some((_, rest)) => token.cont = rest,
            None => {
                token.trace(|| EventKind::Error {
                    message: exception.to_string(),
                });
                ctx.shared.report(TokenError {
                    token: token.id,
                    location: token.location.clone(),
                    fault: TokenFault::Uncaught(exception),
                });
                return Step::Suspended;
            }
        }
    }
}

fn exhausted(shared: &Shared, token: Box<Token>, limit: TokenLimitReached) -> Step {
    shared.report(TokenError {
        token: token.id,
        location: token.location.clone(),
        fault: TokenFault::ResourceExhausted(limit),
    });
    Step::Suspended
}

/// Sequencing region for `Otherwise`: when the left side's whole extent has
/// halted, `right` is launched in the enclosing context unless something was
/// published.
fn fallback_region(
    shared: &Arc<Shared>,
    token: &Token,
    right: NodeId,
    published: Arc<AtomicBool>,
) -> Arc<Region> {
    let engine = Arc::downgrade(shared);
    let origin = token.id;
    let env = token.env.clone();
    let cont = token.cont.clone();
    let group = token.group.clone();
    let parent = token.region.clone();
    let location = token.location.clone();

    Region::sequencing(&token.region, move || {
        if published.load(Ordering::Acquire) || !group.is_alive() {
            return;
        }
        let Some(shared) = engine.upgrade() else {
            return;
        };
        if shared.scheduler.is_halted() {
            return;
        }
        match shared.pool.new_token() {
            Ok(permit) => {
                let mut fallback = Token::new(
                    permit,
                    right,
                    env,
                    cont,
                    group,
                    parent,
                    shared.tracer.clone(),
                );
                fallback.location = location;
                shared.scheduler.inject(fallback);
            }
            Err(limit) => shared.report(TokenError {
                token: origin,
                location,
                fault: TokenFault::ResourceExhausted(limit),
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::env::Env;
    use crate::runtime::group::GroupCell;
    use crate::runtime::node::{Arg, ProgramBuilder};
    use crate::runtime::token::Cont;
    use crate::runtime::{CollectingHandler, Engine, EngineBuilder, EngineConfig};

    struct Fixture {
        engine: Engine,
        errors: Arc<CollectingHandler>,
        body: NodeId,
        handler: NodeId,
    }

    fn fixture() -> Fixture {
        // try stop catch e -> e
        let mut b = ProgramBuilder::new();
        let body = b.stop();
        let handler = b.publish(Arg::var(0));
        let root = b.catch(body, handler);
        let errors = Arc::new(CollectingHandler::new());
        let engine = EngineBuilder::new(b.build("catch", root).unwrap())
            .with_config(EngineConfig {
                worker_threads: 1,
                ..EngineConfig::default()
            })
            .with_handler(errors.clone())
            .build()
            .unwrap();
        Fixture {
            engine,
            errors,
            body,
            handler,
        }
    }

    /// A token producing into a pruning scope, with a handler outside it.
    fn producer(fx: &Fixture) -> (Box<Token>, Arc<GroupCell>) {
        let shared = &fx.engine.shared;
        let outer = Region::root(|| {});
        let (region, group) = Region::with_group(&outer, &shared.root_group);
        let cont = Cont::new()
            .push(Frame::Catch {
                handler: fx.handler,
                env: Env::new(),
                group: shared.root_group.clone(),
                region: outer.clone(),
            })
            .push(Frame::Prune {
                group: group.clone(),
            });
        let token = Token::new(
            shared.pool.new_token().unwrap(),
            fx.body,
            Env::new(),
            cont,
            group.clone(),
            region,
            shared.tracer.clone(),
        );
        (token, group)
    }

    #[test]
    fn test_raise_unwinds_to_handler_outside_live_prune() {
        let fx = fixture();
        let local = fx.engine.locals.lock().pop().unwrap();
        let ctx = WorkerContext::new(0, local, fx.engine.shared.clone());

        let (token, _group) = producer(&fx);
        match raise(&ctx, token, Value::from("bad")) {
            Step::Continue(token) => {
                assert_eq!(token.node, fx.handler);
                assert!(token.group.is_alive());
            }
            Step::Suspended => panic!("handler was not reached"),
        }
        assert_eq!(fx.engine.shared.pool.live(), 0);
    }

    #[test]
    fn test_raise_stops_at_cancelled_prune() {
        let fx = fixture();
        let local = fx.engine.locals.lock().pop().unwrap();
        let ctx = WorkerContext::new(0, local, fx.engine.shared.clone());

        let (token, group) = producer(&fx);
        // Another producer won while this one was still running.
        assert!(group.bind(Value::Integer(1)).is_some());

        assert!(matches!(raise(&ctx, token, Value::from("late")), Step::Suspended));
        assert_eq!(fx.engine.shared.pool.live(), 0);
        assert!(fx.errors.errors().is_empty());
    }
}
