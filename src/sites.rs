//! Core sites: the pure computations every program can rely on, plus the
//! virtual-timer site. Anything heavier — real services, I/O — is supplied
//! by the embedder through the registry.

use std::sync::Arc;

use crate::error::TokenError;
use crate::site::{Continuation, PureSite, Site, SiteRegistry};
use crate::value::Value;

type SiteResult = Result<Option<Value>, TokenError>;

/// The default registry: arithmetic, comparison, logic, conditional
/// publication, tupling, error raising, and the virtual timer.
pub fn core_sites() -> SiteRegistry {
    let mut registry = SiteRegistry::new();
    registry.register("Let", Arc::new(PureSite(let_site)));
    registry.register("Add", Arc::new(PureSite(add)));
    registry.register("Sub", Arc::new(PureSite(sub)));
    registry.register("Mul", Arc::new(PureSite(mul)));
    registry.register("Div", Arc::new(PureSite(div)));
    registry.register("Mod", Arc::new(PureSite(rem)));
    registry.register("Eq", Arc::new(PureSite(eq)));
    registry.register("NotEq", Arc::new(PureSite(not_eq)));
    registry.register("Less", Arc::new(PureSite(less)));
    registry.register("LessEq", Arc::new(PureSite(less_eq)));
    registry.register("Greater", Arc::new(PureSite(greater)));
    registry.register("GreaterEq", Arc::new(PureSite(greater_eq)));
    registry.register("Not", Arc::new(PureSite(not)));
    registry.register("And", Arc::new(PureSite(and)));
    registry.register("Or", Arc::new(PureSite(or)));
    registry.register("Ift", Arc::new(PureSite(ift)));
    registry.register("Iff", Arc::new(PureSite(iff)));
    registry.register("Error", Arc::new(PureSite(error_site)));
    registry.register("Timer", Arc::new(TimerSite));
    registry
}

/// Publishes a signal for no arguments, the argument itself for one, and a
/// tuple for several.
fn let_site(mut args: Vec<Value>) -> SiteResult {
    Ok(Some(match args.len() {
        0 => Value::Signal,
        1 => args.remove(0),
        _ => Value::list(args),
    }))
}

fn expect2(args: &[Value]) -> Result<(&Value, &Value), TokenError> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(TokenError::ArityMismatch {
            expected: 2,
            actual: args.len(),
        }),
    }
}

fn expect1(args: &[Value]) -> Result<&Value, TokenError> {
    match args {
        [a] => Ok(a),
        _ => Err(TokenError::ArityMismatch {
            expected: 1,
            actual: args.len(),
        }),
    }
}

fn as_real(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(n) => Some(*n as f64),
        Value::Real(x) => Some(*x),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Result<bool, TokenError> {
    match v {
        Value::Boolean(b) => Ok(*b),
        other => Err(TokenError::Type {
            expected: "boolean",
            actual: other.type_name(),
        }),
    }
}

fn numeric_type_error(a: &Value, b: &Value) -> TokenError {
    let actual = if as_real(a).is_none() {
        a.type_name()
    } else {
        b.type_name()
    };
    TokenError::Type {
        expected: "number",
        actual,
    }
}

fn add(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(Value::Integer(x + y))),
        (Value::String(x), Value::String(y)) => Ok(Some(Value::String(format!("{x}{y}")))),
        _ => match (as_real(a), as_real(b)) {
            (Some(x), Some(y)) => Ok(Some(Value::Real(x + y))),
            _ => Err(numeric_type_error(a, b)),
        },
    }
}

fn sub(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(Value::Integer(x - y))),
        _ => match (as_real(a), as_real(b)) {
            (Some(x), Some(y)) => Ok(Some(Value::Real(x - y))),
            _ => Err(numeric_type_error(a, b)),
        },
    }
}

fn mul(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(Value::Integer(x * y))),
        _ => match (as_real(a), as_real(b)) {
            (Some(x), Some(y)) => Ok(Some(Value::Real(x * y))),
            _ => Err(numeric_type_error(a, b)),
        },
    }
}

fn div(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    match (a, b) {
        (Value::Integer(_), Value::Integer(0)) => Err(TokenError::DivisionByZero),
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(Value::Integer(x / y))),
        _ => match (as_real(a), as_real(b)) {
            (Some(x), Some(y)) => Ok(Some(Value::Real(x / y))),
            _ => Err(numeric_type_error(a, b)),
        },
    }
}

fn rem(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    match (a, b) {
        (Value::Integer(_), Value::Integer(0)) => Err(TokenError::DivisionByZero),
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(Value::Integer(x % y))),
        _ => Err(numeric_type_error(a, b)),
    }
}

fn eq(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    Ok(Some(Value::Boolean(a == b)))
}

fn not_eq(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    Ok(Some(Value::Boolean(a != b)))
}

fn compare(args: &[Value], op: fn(f64, f64) -> bool) -> SiteResult {
    let (a, b) = expect2(args)?;
    match (as_real(a), as_real(b)) {
        (Some(x), Some(y)) => Ok(Some(Value::Boolean(op(x, y)))),
        _ => Err(numeric_type_error(a, b)),
    }
}

fn less(args: Vec<Value>) -> SiteResult {
    compare(&args, |x, y| x < y)
}

fn less_eq(args: Vec<Value>) -> SiteResult {
    compare(&args, |x, y| x <= y)
}

fn greater(args: Vec<Value>) -> SiteResult {
    compare(&args, |x, y| x > y)
}

fn greater_eq(args: Vec<Value>) -> SiteResult {
    compare(&args, |x, y| x >= y)
}

fn not(args: Vec<Value>) -> SiteResult {
    Ok(Some(Value::Boolean(!as_bool(expect1(&args)?)?)))
}

fn and(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    Ok(Some(Value::Boolean(as_bool(a)? && as_bool(b)?)))
}

fn or(args: Vec<Value>) -> SiteResult {
    let (a, b) = expect2(&args)?;
    Ok(Some(Value::Boolean(as_bool(a)? || as_bool(b)?)))
}

/// Publishes a signal if the condition holds, otherwise stays silent.
/// The basic conditional: guard a branch with `Ift(c) >> branch`.
fn ift(args: Vec<Value>) -> SiteResult {
    Ok(as_bool(expect1(&args)?)?.then_some(Value::Signal))
}

fn iff(args: Vec<Value>) -> SiteResult {
    Ok((!as_bool(expect1(&args)?)?).then_some(Value::Signal))
}

/// Fails the call with the given message; programs use it to raise
/// catchable errors without `throw`.
fn error_site(args: Vec<Value>) -> SiteResult {
    let message = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "error".to_string(),
    };
    Err(TokenError::Site {
        message,
        cause: None,
    })
}

/// Virtual delay: parks the caller on its scope's clock and resumes it with
/// a signal after the given number of ticks. Time only moves when the engine
/// has nothing else to do, so delays cost no wall-clock time.
pub struct TimerSite;

impl Site for TimerSite {
    fn invoke(&self, args: Vec<Value>, cont: Continuation) {
        match args.as_slice() {
            [Value::Integer(delay)] if *delay >= 0 => cont.park(*delay as u64),
            [other] => cont.error(TokenError::Type {
                expected: "non-negative integer",
                actual: other.type_name(),
            }),
            _ => cont.error(TokenError::ArityMismatch {
                expected: 1,
                actual: args.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Value {
        Value::Integer(n)
    }

    #[test]
    fn test_let_site_shapes() {
        assert_eq!(let_site(vec![]).unwrap(), Some(Value::Signal));
        assert_eq!(let_site(vec![int(3)]).unwrap(), Some(int(3)));
        assert_eq!(
            let_site(vec![int(1), int(2)]).unwrap(),
            Some(Value::list(vec![int(1), int(2)]))
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(add(vec![int(2), int(3)]).unwrap(), Some(int(5)));
        assert_eq!(
            add(vec![Value::Real(0.5), int(1)]).unwrap(),
            Some(Value::Real(1.5))
        );
        assert_eq!(
            add(vec![Value::String("a".into()), Value::String("b".into())]).unwrap(),
            Some(Value::String("ab".into()))
        );
        assert_eq!(sub(vec![int(2), int(3)]).unwrap(), Some(int(-1)));
        assert_eq!(mul(vec![int(4), int(3)]).unwrap(), Some(int(12)));
        assert_eq!(div(vec![int(7), int(2)]).unwrap(), Some(int(3)));
        assert_eq!(rem(vec![int(7), int(2)]).unwrap(), Some(int(1)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            div(vec![int(1), int(0)]).unwrap_err(),
            TokenError::DivisionByZero
        );
        assert_eq!(
            rem(vec![int(1), int(0)]).unwrap_err(),
            TokenError::DivisionByZero
        );
    }

    #[test]
    fn test_type_errors_name_the_culprit() {
        let err = add(vec![Value::Signal, int(1)]).unwrap_err();
        assert_eq!(
            err,
            TokenError::Type {
                expected: "number",
                actual: "signal"
            }
        );
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(less(vec![int(1), int(2)]).unwrap(), Some(Value::Boolean(true)));
        assert_eq!(
            greater_eq(vec![int(2), int(2)]).unwrap(),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            eq(vec![int(2), Value::Real(2.0)]).unwrap(),
            Some(Value::Boolean(false))
        );
    }

    #[test]
    fn test_conditional_publication() {
        assert_eq!(ift(vec![Value::Boolean(true)]).unwrap(), Some(Value::Signal));
        assert_eq!(ift(vec![Value::Boolean(false)]).unwrap(), None);
        assert_eq!(iff(vec![Value::Boolean(false)]).unwrap(), Some(Value::Signal));
        assert!(ift(vec![int(1)]).is_err());
    }

    #[test]
    fn test_error_site_message() {
        let err = error_site(vec![Value::String("nope".into())]).unwrap_err();
        assert_eq!(
            err,
            TokenError::Site {
                message: "nope".into(),
                cause: None
            }
        );
    }

    #[test]
    fn test_core_registry_contents() {
        let registry = core_sites();
        for name in ["Let", "Add", "Ift", "Timer", "Error"] {
            assert!(registry.contains(name), "missing core site {name}");
        }
    }
}
