//! Core site library
//!
//! Sites every program can rely on: binding and conditionals, arithmetic,
//! comparison, output, a timer and error raising.

use std::cmp::Ordering;
use std::time::Duration;

use futures::FutureExt;

use super::error::SiteError;
use super::site::{Site, SiteCall, SiteRegistry};
use super::value::Value;

type SiteResult = Result<Option<Value>, SiteError>;

/// Register the core library.
pub(crate) fn install(registry: &mut SiteRegistry) {
    registry
        .register_fn("let", let_site)
        .register_fn("if", if_site)
        .register_fn("not", not)
        .register_fn("add", add)
        .register_fn("sub", sub)
        .register_fn("mul", mul)
        .register_fn("div", div)
        .register_fn("mod", modulo)
        .register_fn("eq", |args| equality("eq", args, true))
        .register_fn("neq", |args| equality("neq", args, false))
        .register_fn("lt", |args| comparison("lt", args, Ordering::is_lt))
        .register_fn("lte", |args| comparison("lte", args, Ordering::is_le))
        .register_fn("gt", |args| comparison("gt", args, Ordering::is_gt))
        .register_fn("gte", |args| comparison("gte", args, Ordering::is_ge))
        .register_fn("Error", raise_error)
        .register(Print {
            name: "print",
            newline: false,
        })
        .register(Print {
            name: "println",
            newline: true,
        })
        .register_async("Rwait", |args| {
            async move {
                let millis = rwait_delay(&args)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, SiteError>(Some(Value::Signal))
            }
            .boxed()
        });
}

fn arity(site: &str, args: &[Value], expected: usize) -> Result<(), SiteError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(SiteError::Arity {
            site: site.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn type_error(site: &str, index: usize, expected: &'static str, found: &Value) -> SiteError {
    SiteError::ArgumentType {
        site: site.to_string(),
        index,
        expected,
        found: found.type_name(),
    }
}

fn boolean(site: &str, args: &[Value], index: usize) -> Result<bool, SiteError> {
    args[index]
        .as_boolean()
        .ok_or_else(|| type_error(site, index, "boolean", &args[index]))
}

fn float(site: &str, args: &[Value], index: usize) -> Result<f64, SiteError> {
    match &args[index] {
        Value::Integer(num) => Ok(*num as f64),
        Value::Float(num) => Ok(*num),
        other => Err(type_error(site, index, "number", other)),
    }
}

/// `let()` is signal, `let(x)` is `x`, more arguments make a tuple.
fn let_site(args: &[Value]) -> SiteResult {
    Ok(Some(match args {
        [] => Value::Signal,
        [one] => one.clone(),
        many => Value::List(many.to_vec()),
    }))
}

/// Publishes signal when true, halts when false.
fn if_site(args: &[Value]) -> SiteResult {
    arity("if", args, 1)?;
    Ok(boolean("if", args, 0)?.then_some(Value::Signal))
}

fn not(args: &[Value]) -> SiteResult {
    arity("not", args, 1)?;
    Ok(Some(Value::Boolean(!boolean("not", args, 0)?)))
}

fn numeric(
    site: &str,
    args: &[Value],
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> SiteResult {
    arity(site, args, 2)?;
    let value = match (&args[0], &args[1]) {
        (Value::Integer(a), Value::Integer(b)) => Value::Integer(
            int_op(*a, *b).ok_or_else(|| SiteError::Failed(format!("integer overflow in '{}'", site)))?,
        ),
        _ => Value::Float(float_op(float(site, args, 0)?, float(site, args, 1)?)),
    };
    Ok(Some(value))
}

fn add(args: &[Value]) -> SiteResult {
    if let [Value::String(a), Value::String(b)] = args {
        return Ok(Some(Value::String(format!("{}{}", a, b))));
    }
    numeric("add", args, i64::checked_add, |a, b| a + b)
}

fn sub(args: &[Value]) -> SiteResult {
    numeric("sub", args, i64::checked_sub, |a, b| a - b)
}

fn mul(args: &[Value]) -> SiteResult {
    numeric("mul", args, i64::checked_mul, |a, b| a * b)
}

fn div(args: &[Value]) -> SiteResult {
    if matches!(args, [_, Value::Integer(0)]) {
        return Err(SiteError::DivisionByZero("div".into()));
    }
    numeric("div", args, i64::checked_div, |a, b| a / b)
}

fn modulo(args: &[Value]) -> SiteResult {
    if matches!(args, [_, Value::Integer(0)]) {
        return Err(SiteError::DivisionByZero("mod".into()));
    }
    numeric("mod", args, i64::checked_rem_euclid, f64::rem_euclid)
}

fn equality(site: &str, args: &[Value], expect_equal: bool) -> SiteResult {
    arity(site, args, 2)?;
    Ok(Some(Value::Boolean((args[0] == args[1]) == expect_equal)))
}

fn comparison(site: &str, args: &[Value], test: fn(Ordering) -> bool) -> SiteResult {
    arity(site, args, 2)?;
    let ordering = match (&args[0], &args[1]) {
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => float(site, args, 0)?
            .partial_cmp(&float(site, args, 1)?)
            .ok_or_else(|| SiteError::Failed(format!("'{}' on unordered numbers", site)))?,
    };
    Ok(Some(Value::Boolean(test(ordering))))
}

/// Raise the message as a host error.
fn raise_error(args: &[Value]) -> SiteResult {
    arity("Error", args, 1)?;
    Err(SiteError::Failed(args[0].to_text()))
}

fn rwait_delay(args: &[Value]) -> Result<u64, SiteError> {
    arity("Rwait", args, 1)?;
    let millis = args[0]
        .as_integer()
        .ok_or_else(|| type_error("Rwait", 0, "integer", &args[0]))?;
    u64::try_from(millis).map_err(|_| SiteError::Failed(format!("Rwait: negative delay {}", millis)))
}

/// Writes its arguments through the engine handler and publishes signal.
struct Print {
    name: &'static str,
    newline: bool,
}

impl Site for Print {
    fn name(&self) -> &str {
        self.name
    }

    fn call(&self, args: Vec<Value>, call: SiteCall) {
        let mut text = args.iter().map(Value::to_text).collect::<Vec<_>>().join(" ");
        if self.newline {
            text.push('\n');
        }
        call.print(&text);
        call.publish(Value::Signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Integer).collect()
    }

    #[test]
    fn test_let_builds_tuples() {
        assert_eq!(let_site(&[]).unwrap(), Some(Value::Signal));
        assert_eq!(let_site(&ints(&[3])).unwrap(), Some(Value::Integer(3)));
        assert_eq!(
            let_site(&ints(&[1, 2])).unwrap(),
            Some(Value::List(ints(&[1, 2])))
        );
    }

    #[test]
    fn test_if_halts_on_false() {
        assert_eq!(if_site(&[Value::Boolean(true)]).unwrap(), Some(Value::Signal));
        assert_eq!(if_site(&[Value::Boolean(false)]).unwrap(), None);
        assert!(matches!(
            if_site(&[Value::Integer(1)]),
            Err(SiteError::ArgumentType { expected: "boolean", .. })
        ));
    }

    #[test]
    fn test_arithmetic_mixes_integers_and_floats() {
        assert_eq!(add(&ints(&[2, 3])).unwrap(), Some(Value::Integer(5)));
        assert_eq!(
            mul(&[Value::Integer(2), Value::Float(1.5)]).unwrap(),
            Some(Value::Float(3.0))
        );
        assert_eq!(
            add(&[Value::from("ab"), Value::from("cd")]).unwrap(),
            Some(Value::from("abcd"))
        );
        assert_eq!(modulo(&ints(&[-7, 3])).unwrap(), Some(Value::Integer(2)));
    }

    #[test]
    fn test_arithmetic_errors() {
        assert_eq!(
            div(&ints(&[1, 0])).unwrap_err(),
            SiteError::DivisionByZero("div".into())
        );
        assert!(matches!(add(&ints(&[i64::MAX, 1])), Err(SiteError::Failed(_))));
        assert!(matches!(sub(&ints(&[1])), Err(SiteError::Arity { expected: 2, got: 1, .. })));
    }

    #[test]
    fn test_comparisons() {
        let lt = |args: &[Value]| comparison("lt", args, Ordering::is_lt);
        assert_eq!(lt(&ints(&[1, 2])).unwrap(), Some(Value::Boolean(true)));
        assert_eq!(
            lt(&[Value::from("b"), Value::from("a")]).unwrap(),
            Some(Value::Boolean(false))
        );
        assert_eq!(
            equality("neq", &ints(&[4, 4]), false).unwrap(),
            Some(Value::Boolean(false))
        );
    }

    #[test]
    fn test_error_and_rwait_arguments() {
        assert_eq!(
            raise_error(&[Value::from("boom")]).unwrap_err(),
            SiteError::Failed("boom".into())
        );
        assert_eq!(rwait_delay(&ints(&[25])).unwrap(), 25);
        assert!(rwait_delay(&ints(&[-1])).is_err());
    }
}
