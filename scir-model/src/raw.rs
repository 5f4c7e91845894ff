//! Raw chart definition types.
//!
//! Chart definitions use a nested JSON DSL:
//!
//! ```json
//! {
//!   "initial": "idle",
//!   "datamodel": {"count": 0},
//!   "states": [
//!     {"id": "idle", "transitions": [{"event": "start", "target": "running"}]},
//!     {
//!       "id": "running",
//!       "initial": "warmup",
//!       "onEntry": [{"assign": {"location": "started", "value": true}}],
//!       "states": [
//!         {"id": "warmup", "transitions": [{"event": "ready", "target": "steady"}]},
//!         {"id": "steady"},
//!         {"id": "mem", "type": "history"}
//!       ],
//!       "transitions": [{"event": "stop", "target": "idle", "cond": "ctx.count > 0"}]
//!     },
//!     {"id": "done", "type": "final"}
//!   ]
//! }
//! ```
//!
//! A state's kind is usually inferred (children present means compound,
//! otherwise atomic); `type` overrides it for `parallel`, `final`,
//! `history` and `deepHistory` states.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw chart definition as stored/transmitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChart {
    /// Initial target state(s) of the chart. Defaults to the first state.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    /// Initial data context defaults, merged under caller-provided input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datamodel: Option<Value>,

    /// Init actions executed once before the initial configuration is entered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_init: Vec<RawAction>,

    /// Top-level states.
    #[serde(default)]
    pub states: Vec<RawState>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Raw state node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawState {
    /// State id, unique within the chart. Anonymous states get a synthetic
    /// path-based id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Explicit kind: `atomic`, `compound`, `parallel`, `final`, `history`,
    /// `deepHistory`. Inferred from children when absent.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Initial child target(s) for compound states.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    /// Content of the initial transition (runs on default entry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_actions: Vec<RawAction>,

    /// Child states.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<RawState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<RawAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<RawAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<RawTransition>,

    /// Child machine invocations started when this state is entered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invoke: Vec<RawInvoke>,
}

/// Raw transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransition {
    /// Event pattern(s). Empty means eventless. Supports `*` and trailing
    /// `.*` wildcards.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub event: Vec<String>,

    /// Target state id(s). Empty means a targetless "stay" transition.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,

    /// Optional guard condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,

    /// `external` (default) or `internal`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RawAction>,
}

/// Raw executable content node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawAction {
    Assign(RawAssign),
    Raise(RawRaise),
    Log(RawLog),
    If(RawIf),
    Foreach(RawForeach),
    Send(RawSend),
    Cancel(RawCancel),
    Query(RawQuery),
    Invoke(RawInvoke),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAssign {
    /// Dotted context location to write.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRaise {
    pub event: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIf {
    /// Condition branches, tried in order.
    pub branches: Vec<RawBranch>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub else_actions: Vec<RawAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBranch {
    pub cond: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RawAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawForeach {
    /// Array expression. Snapshotted before iteration.
    pub array: String,
    /// Context key bound to the current item.
    pub item: String,
    /// Optional context key bound to the current index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RawAction>,
}

/// Raw send. Static and `-Expr` forms of an attribute are mutually
/// exclusive; setting both (or, for `event`, neither) is a validation
/// error at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_expr: Option<String>,
    /// Activity type routed to the service invoker (HTTP, queue, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_expr: Option<String>,
    /// Explicit send id, usable with cancel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Context location receiving a generated send id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_expr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCancel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id_expr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_expr: Option<String>,
    /// Context location receiving the query result.
    pub result_location: String,
}

/// Raw child machine invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInvoke {
    /// Invocation id, used in `done.invoke.<id>`. Synthesized when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Child machine identifier, resolved through the child resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Inline child machine definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Box<RawChart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_expr: Option<String>,
    /// Actions run against the parent context when the child completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<RawAction>,
}

/// Accepts either a bare string or an array of strings.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct OneOrManyVisitor;

    impl<'de> Visitor<'de> for OneOrManyVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.push(s);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(OneOrManyVisitor)
}
