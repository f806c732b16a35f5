use std::cmp::Ordering;

use serde_json::Value;

use flowmill_core::types::Variables;

use super::parser::{Assignment, BinaryOp, Expr, UnaryOp};
use super::EvalError;

/// Evaluate an expression against the supplied bindings only.
pub fn evaluate(expr: &Expr, vars: &Variables) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(lookup(vars, segments).cloned().unwrap_or(Value::Null)),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&evaluate(inner, vars)?))),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let v = evaluate(inner, vars)?;
            let n = as_number(&v).ok_or_else(|| EvalError::Type(format!("cannot negate {}", v)))?;
            number(-n)
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !truthy(&evaluate(lhs, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, vars)?)))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if truthy(&evaluate(lhs, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, vars)?)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, vars)?;
            let r = evaluate(rhs, vars)?;
            binary(*op, &l, &r)
        }
    }
}

/// Run script assignments in order against a copy of `vars`; later
/// statements see earlier results. Returns only the assigned names.
pub fn run_script(statements: &[Assignment], vars: &Variables) -> Result<Variables, EvalError> {
    let mut scope = vars.clone();
    let mut assigned = Variables::new();
    for stmt in statements {
        let value = evaluate(&stmt.value, &scope)?;
        scope.insert(stmt.target.clone(), value.clone());
        assigned.insert(stmt.target.clone(), value);
    }
    Ok(assigned)
}

/// Dotted-path lookup through objects and array indices.
pub fn lookup<'a, S: AsRef<str>>(vars: &'a Variables, segments: &[S]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = vars.get(first.as_ref())?;
    for seg in rest {
        current = match current {
            Value::Object(map) => map.get(seg.as_ref())?,
            Value::Array(items) => items.get(seg.as_ref().parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// JS-like truthiness: null, false, 0, "" and empty collections are false.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(l, r)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add if l.is_string() || r.is_string() => {
            Ok(Value::String(format!("{}{}", display(l), display(r))))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, l, r)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators handled in evaluate"),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    // Integer arithmetic where both sides are integers and nothing overflows.
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem if b != 0 => a.checked_rem(b),
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let a = as_number(l).ok_or_else(|| EvalError::Type(format!("{} is not a number", l)))?;
    let b = as_number(r).ok_or_else(|| EvalError::Type(format!("{} is not a number", r)))?;
    match op {
        BinaryOp::Add => number(a + b),
        BinaryOp::Sub => number(a - b),
        BinaryOp::Mul => number(a * b),
        BinaryOp::Div if b == 0.0 => Err(EvalError::DivisionByZero),
        BinaryOp::Div => number(a / b),
        BinaryOp::Rem if b == 0.0 => Err(EvalError::DivisionByZero),
        BinaryOp::Rem => number(a % b),
        _ => unreachable!("non-arithmetic operator"),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let a = as_number(l);
            let b = as_number(r);
            match (a, b) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| EvalError::Type("cannot order NaN".into())),
                _ => Err(EvalError::Type(format!("cannot compare {} with {}", l, r))),
            }
        }
    }
}

/// Numbers, and strings that parse as numbers (form inputs arrive as text).
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn number(n: f64) -> Result<Value, EvalError> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type("result is not a finite number".into()))
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
