//! Boundary traits: external service delivery and child machines.
//!
//! The interpreter never talks to the outside world directly; `send`,
//! `query` and `invoke` actions go through these traits so hosts can plug
//! in real transports and tests can plug in recorders.

use crate::interp::{Interpreter, InterpreterOptions, RunStatus};
use async_trait::async_trait;
use scir_model::Chart;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from service delivery or child resolution. Surfaced to the
/// machine as `error.communication` / `error.execution` events, never as
/// panics.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service request failed: {reason}")]
    Failed { reason: String },

    #[error("unknown child machine: {identifier}")]
    UnknownChild { identifier: String },
}

impl ServiceError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ServiceError::Failed {
            reason: reason.into(),
        }
    }
}

/// Outbound message delivery and request/response queries.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Delivers a fire-and-forget message to an external activity.
    async fn invoke(
        &self,
        activity: &str,
        target: Option<&str>,
        message: &str,
        correlation_id: Option<&str>,
        params: Value,
    ) -> Result<(), ServiceError>;

    /// Performs a request and returns the response payload.
    async fn query(
        &self,
        activity: &str,
        target: Option<&str>,
        params: Value,
    ) -> Result<Value, ServiceError>;
}

/// Discards deliveries and answers queries with `null`. The default when
/// a host wires no transport.
#[derive(Debug, Default)]
pub struct NullInvoker;

#[async_trait]
impl ServiceInvoker for NullInvoker {
    async fn invoke(
        &self,
        activity: &str,
        target: Option<&str>,
        message: &str,
        _correlation_id: Option<&str>,
        _params: Value,
    ) -> Result<(), ServiceError> {
        debug!(activity, ?target, message, "discarding send (no invoker wired)");
        Ok(())
    }

    async fn query(
        &self,
        activity: &str,
        target: Option<&str>,
        _params: Value,
    ) -> Result<Value, ServiceError> {
        debug!(activity, ?target, "answering query with null (no invoker wired)");
        Ok(Value::Null)
    }
}

/// Resolves named child machines and runs invocations to completion.
#[async_trait]
pub trait ChildResolver: Send + Sync {
    /// Looks up a chart by the identifier given in the invoke definition.
    fn resolve(&self, identifier: &str) -> Result<Arc<Chart>, ServiceError>;

    /// Runs a child machine with the given input until it reaches a
    /// top-level final state, returning its output data.
    async fn run_child(&self, chart: Arc<Chart>, input: Value) -> Result<Value, ServiceError>;
}

/// A fixed registry of charts. Children run with a [`NullInvoker`] and
/// this same registry, so invocations nest.
#[derive(Clone, Default)]
pub struct StaticResolver {
    charts: HashMap<String, Arc<Chart>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, chart: Arc<Chart>) {
        self.charts.insert(name.into(), chart);
    }
}

#[async_trait]
impl ChildResolver for StaticResolver {
    fn resolve(&self, identifier: &str) -> Result<Arc<Chart>, ServiceError> {
        self.charts
            .get(identifier)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownChild {
                identifier: identifier.to_string(),
            })
    }

    async fn run_child(&self, chart: Arc<Chart>, input: Value) -> Result<Value, ServiceError> {
        let (interp, sender) = Interpreter::new(
            chart,
            input,
            InterpreterOptions::default(),
            Arc::new(NullInvoker),
            Arc::new(self.clone()),
        );
        // No events flow into an invoked child; it must run to completion
        // on its own.
        drop(sender);
        let outcome = interp.run().await.map_err(|err| match err {
            crate::error::CoreError::EventSourceClosed => {
                ServiceError::failed("child machine stalled waiting for events")
            }
            other => ServiceError::failed(other.to_string()),
        })?;
        match outcome.status {
            RunStatus::Completed => Ok(outcome.data),
            RunStatus::Faulted { error } => Err(ServiceError::failed(error)),
        }
    }
}

/// Convenience alias for hosts that compose the two boundaries.
pub type SharedInvoker = Arc<dyn ServiceInvoker>;

#[cfg(test)]
mod tests {
    use super::*;
    use scir_expr::DefaultCompiler;
    use serde_json::json;

    #[tokio::test]
    async fn test_null_invoker_answers_null() {
        let invoker = NullInvoker;
        invoker
            .invoke("queue", Some("orders"), "ping", None, json!({}))
            .await
            .unwrap();
        let answer = invoker.query("db", None, json!({})).await.unwrap();
        assert_eq!(answer, Value::Null);
    }

    #[tokio::test]
    async fn test_static_resolver_unknown_child() {
        let resolver = StaticResolver::new();
        let err = resolver.resolve("missing").unwrap_err();
        assert!(matches!(err, ServiceError::UnknownChild { .. }));
    }

    #[tokio::test]
    async fn test_static_resolver_runs_child_to_completion() {
        let chart = Chart::from_json(
            "child",
            &json!({
                "initial": "work",
                "states": [
                    {"id": "work",
                     "onEntry": [{"assign": {"location": "doubled", "expr": "ctx.input.n"}}],
                     "transitions": [{"target": "done"}]},
                    {"id": "done", "type": "final"}
                ]
            }),
            &DefaultCompiler::new(),
        )
        .unwrap();

        let mut resolver = StaticResolver::new();
        resolver.register("child", Arc::new(chart));

        let chart = resolver.resolve("child").unwrap();
        let output = resolver
            .run_child(chart, json!({"n": 21}))
            .await
            .unwrap();
        assert_eq!(output["doubled"], json!(21));
    }

    #[tokio::test]
    async fn test_child_that_waits_for_events_reports_failure() {
        let chart = Chart::from_json(
            "waits",
            &json!({
                "initial": "idle",
                "states": [
                    {"id": "idle", "transitions": [{"event": "go", "target": "done"}]},
                    {"id": "done", "type": "final"}
                ]
            }),
            &DefaultCompiler::new(),
        )
        .unwrap();

        let resolver = StaticResolver::new();
        let err = resolver
            .run_child(Arc::new(chart), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Failed { .. }));
    }
}
