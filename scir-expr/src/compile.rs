//! Expression compilation.
//!
//! The interpreter core depends only on the [`Compiler`] and [`CompiledExpr`]
//! traits, so a host can swap in a different expression language without
//! touching the core. [`DefaultCompiler`] implements them over [`Expr`] with
//! a cache keyed by source text, so a condition appearing on many
//! transitions is parsed once.

use crate::error::ExprError;
use crate::expr::{is_truthy, Expr};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A compiled expression, evaluable against a JSON data context.
pub trait CompiledExpr: fmt::Debug + Send + Sync {
    /// Evaluates to a value.
    fn eval(&self, ctx: &Value) -> Result<Value, ExprError>;

    /// Evaluates as a boolean condition.
    fn eval_bool(&self, ctx: &Value) -> Result<bool, ExprError> {
        Ok(is_truthy(&self.eval(ctx)?))
    }

    /// Evaluates, requiring an array result.
    fn eval_array(&self, ctx: &Value) -> Result<Vec<Value>, ExprError> {
        match self.eval(ctx)? {
            Value::Array(items) => Ok(items),
            other => Err(ExprError::NotAnArray {
                found: match other {
                    Value::Null => "null",
                    Value::Bool(_) => "boolean",
                    Value::Number(_) => "number",
                    Value::String(_) => "string",
                    Value::Object(_) => "object",
                    Value::Array(_) => unreachable!(),
                }
                .to_string(),
            }),
        }
    }
}

impl CompiledExpr for Expr {
    fn eval(&self, ctx: &Value) -> Result<Value, ExprError> {
        Expr::eval(self, ctx)
    }

    fn eval_bool(&self, ctx: &Value) -> Result<bool, ExprError> {
        Expr::eval_bool(self, ctx)
    }

    fn eval_array(&self, ctx: &Value) -> Result<Vec<Value>, ExprError> {
        Expr::eval_array(self, ctx)
    }
}

/// Compiles expression source into an evaluable form.
///
/// Compilation failures are load-time errors; they never surface during
/// execution.
pub trait Compiler: Send + Sync {
    fn compile(&self, src: &str) -> Result<Arc<dyn CompiledExpr>, ExprError>;
}

/// Default compiler over the built-in expression language, with a
/// per-source cache.
#[derive(Debug, Default)]
pub struct DefaultCompiler {
    cache: DashMap<String, Arc<Expr>>,
}

impl DefaultCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compiler for DefaultCompiler {
    fn compile(&self, src: &str) -> Result<Arc<dyn CompiledExpr>, ExprError> {
        if let Some(cached) = self.cache.get(src) {
            return Ok(Arc::clone(cached.value()) as Arc<dyn CompiledExpr>);
        }
        let expr = Arc::new(Expr::parse(src)?);
        self.cache.insert(src.to_string(), Arc::clone(&expr));
        Ok(expr)
    }
}
