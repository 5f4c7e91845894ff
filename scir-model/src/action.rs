//! Resolved executable content.
//!
//! Executable content is a closed enum dispatched by match in the
//! interpreter core; adding a node kind is a compile-time-checked change.
//! Expressions are compiled at load time, so execution never parses.

use crate::chart::Chart;
use scir_expr::{CompiledExpr, ExprError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A value produced either from a literal or from an expression.
#[derive(Debug, Clone)]
pub enum ValueSource {
    Literal(Value),
    Expr(Arc<dyn CompiledExpr>),
}

impl ValueSource {
    /// Resolves against the data context.
    pub fn resolve(&self, ctx: &Value) -> Result<Value, ExprError> {
        match self {
            ValueSource::Literal(v) => Ok(v.clone()),
            ValueSource::Expr(expr) => expr.eval(ctx),
        }
    }
}

/// A static-or-expression attribute, e.g. `target` vs `targetExpr`.
/// Exactly one form exists after validation.
#[derive(Debug, Clone)]
pub enum Attr<T> {
    Static(T),
    Expr(Arc<dyn CompiledExpr>),
}

impl Attr<String> {
    /// Resolves to a string (non-string evaluation results are rendered
    /// as JSON text).
    pub fn resolve(&self, ctx: &Value) -> Result<String, ExprError> {
        match self {
            Attr::Static(s) => Ok(s.clone()),
            Attr::Expr(expr) => Ok(match expr.eval(ctx)? {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        }
    }
}

impl Attr<Duration> {
    /// Resolves to a duration; expression results are milliseconds.
    pub fn resolve(&self, ctx: &Value) -> Result<Duration, ExprError> {
        match self {
            Attr::Static(d) => Ok(*d),
            Attr::Expr(expr) => {
                let value = expr.eval(ctx)?;
                let ms = value.as_f64().ok_or_else(|| ExprError::Eval {
                    reason: format!("delay expression did not yield a number: {}", value),
                })?;
                if ms < 0.0 {
                    return Err(ExprError::Eval {
                        reason: format!("negative delay: {}", ms),
                    });
                }
                Ok(Duration::from_millis(ms as u64))
            }
        }
    }
}

/// Executable content node.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write a value into the data context.
    Assign { location: String, value: ValueSource },
    /// Enqueue an event on the internal queue.
    Raise { event: String },
    /// Forward a message to the logging sink.
    Log {
        label: Option<String>,
        message: Option<String>,
        value: Option<ValueSource>,
    },
    /// Condition chain; the first truthy branch runs.
    If {
        branches: Vec<Branch>,
        else_actions: Vec<Action>,
    },
    /// Iterate over an array snapshot with item/index bindings.
    Foreach {
        array: Arc<dyn CompiledExpr>,
        item: String,
        index: Option<String>,
        actions: Vec<Action>,
    },
    /// Send a message, immediately or after a delay.
    Send(SendSpec),
    /// Cancel a previously scheduled delayed send.
    Cancel { send_id: Attr<String> },
    /// Query an external service and store the result.
    Query(QuerySpec),
    /// Invoke a child machine and await its completion.
    Invoke(InvokeSpec),
}

/// One branch of an `If`.
#[derive(Debug, Clone)]
pub struct Branch {
    pub cond: Arc<dyn CompiledExpr>,
    pub actions: Vec<Action>,
}

/// Resolved send.
#[derive(Debug, Clone)]
pub struct SendSpec {
    /// Event / message name.
    pub event: Attr<String>,
    /// Delivery target; absent means the machine itself.
    pub target: Option<Attr<String>>,
    /// Activity type routed to the service invoker; absent means internal
    /// event delivery.
    pub activity: Option<Attr<String>>,
    pub delay: Option<Attr<Duration>>,
    pub id: Option<String>,
    /// Context location receiving the (possibly generated) send id.
    pub id_location: Option<String>,
    pub params: Option<ValueSource>,
}

/// Resolved query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub activity: Attr<String>,
    pub target: Option<Attr<String>>,
    pub params: Option<ValueSource>,
    pub result_location: String,
}

/// Resolved child machine invocation.
#[derive(Debug, Clone)]
pub struct InvokeSpec {
    /// Correlation id, used in `done.invoke.<id>`.
    pub id: String,
    pub machine: ChildMachine,
    pub input: Option<ValueSource>,
    /// Runs against the parent context when the child completes.
    pub finalize: Vec<Action>,
}

/// The child machine of an invocation.
#[derive(Debug, Clone)]
pub enum ChildMachine {
    /// Resolved through the injected child resolver at execution time.
    Named(String),
    /// Defined inline; built at load time.
    Inline(Arc<Chart>),
}
