//! Sandboxed expression language for edge conditions and script tasks.
//!
//! Expressions see nothing but the variable map they are given: there are no
//! function calls, no globals, and no I/O. Supported operators are boolean
//! (`&& || !`), comparison (`== != < <= > >=`) and arithmetic (`+ - * / %`)
//! over JSON values, with dotted paths (`order.total`) for lookups.

pub mod eval;
pub mod lexer;
pub mod parser;

use thiserror::Error;

use flowmill_core::types::Variables;

pub use eval::{evaluate, lookup, run_script, truthy};
pub use parser::{parse_expression, parse_script, Assignment, Expr};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Parse and evaluate a condition, reducing the result to a boolean.
pub fn eval_condition(src: &str, vars: &Variables) -> Result<bool, EvalError> {
    let expr = parse_expression(src)?;
    Ok(truthy(&evaluate(&expr, vars)?))
}
