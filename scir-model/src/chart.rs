//! The immutable state tree.
//!
//! States are stored in a flat arena indexed by [`StateId`]; parent and
//! child links are indices, so ancestor walks are O(depth) without any
//! reference cycles. Document order (pre-order position in the source
//! definition) is precomputed per state and is the tie-break everywhere
//! the interpreter sorts.

use crate::action::{Action, InvokeSpec};
use crate::error::ModelError;
use crate::raw::RawChart;
use scir_expr::{CompiledExpr, Compiler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Arena index of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

impl StateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// The synthetic root. Never part of a configuration.
    Root,
    /// Has children; exactly one is active at a time.
    Compound,
    /// Has children; all are active at a time.
    Parallel,
    /// Leaf state.
    Atomic,
    /// Leaf state; entering a final child of the root terminates the run.
    Final,
    /// History pseudostate.
    History { deep: bool },
}

/// External or internal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionKind {
    #[default]
    External,
    Internal,
}

/// Event name pattern: exact, trailing-wildcard prefix, or match-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl EventPattern {
    /// Parses `*`, `name.*`, or an exact name.
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            EventPattern::Any
        } else if let Some(stem) = s.strip_suffix(".*") {
            EventPattern::Prefix(stem.to_string())
        } else {
            EventPattern::Exact(s.to_string())
        }
    }

    /// Matches an event name. A prefix pattern `error.*` matches `error`
    /// itself and anything under `error.`.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Exact(exact) => exact == name,
            EventPattern::Prefix(stem) => {
                name == stem
                    || (name.len() > stem.len()
                        && name.starts_with(stem.as_str())
                        && name.as_bytes()[stem.len()] == b'.')
            }
        }
    }

    /// Whether two patterns can match a common event name. Used by
    /// validation to detect cross-region target clashes.
    pub fn overlaps(&self, other: &EventPattern) -> bool {
        match (self, other) {
            (EventPattern::Any, _) | (_, EventPattern::Any) => true,
            (EventPattern::Exact(a), EventPattern::Exact(b)) => a == b,
            (EventPattern::Prefix(stem), EventPattern::Exact(name))
            | (EventPattern::Exact(name), EventPattern::Prefix(stem)) => {
                EventPattern::Prefix(stem.clone()).matches(name)
            }
            (EventPattern::Prefix(a), EventPattern::Prefix(b)) => {
                a.starts_with(b.as_str()) || b.starts_with(a.as_str())
            }
        }
    }
}

/// A transition edge.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Owning state.
    pub source: StateId,
    /// Resolved targets. Empty means a targetless "stay" transition.
    pub targets: Vec<StateId>,
    /// Empty means eventless (evaluated every microstep).
    pub events: Vec<EventPattern>,
    pub cond: Option<Arc<dyn CompiledExpr>>,
    pub kind: TransitionKind,
    pub actions: Vec<Action>,
    /// Position in document order among all transitions; unique within the
    /// chart, used for dedup and deterministic ordering.
    pub ordinal: u32,
}

impl Transition {
    /// Whether this transition fires without consuming an event.
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether any event pattern matches the given name.
    pub fn matches_event(&self, name: &str) -> bool {
        self.events.iter().any(|p| p.matches(name))
    }
}

/// A state node in the arena.
#[derive(Debug)]
pub struct StateNode {
    /// Unique id within the chart (synthetic path-based for anonymous
    /// states).
    pub id: String,
    pub kind: StateKind,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub transitions: Vec<Transition>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    /// Initial transition (compound/root default entry; history default).
    pub initial: Option<Transition>,
    /// Child machine invocations dispatched on entry.
    pub invokes: Vec<InvokeSpec>,
    /// Pre-order position in the source definition.
    pub doc_order: u32,
}

impl StateNode {
    pub fn is_atomic_or_final(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_compound_like(&self) -> bool {
        matches!(self.kind, StateKind::Compound | StateKind::Root)
    }

    pub fn is_parallel(&self) -> bool {
        self.kind == StateKind::Parallel
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History { .. })
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }
}

/// Validated, immutable chart: the state tree plus lookup structures.
#[derive(Debug)]
pub struct Chart {
    /// Chart name.
    pub name: String,
    /// Initial data context defaults.
    pub datamodel: Option<Value>,
    /// Init actions executed before the initial configuration is entered.
    pub on_init: Vec<Action>,
    /// Hash of the raw definition for integrity checks.
    pub checksum: String,
    pub(crate) states: Vec<StateNode>,
    pub(crate) root: StateId,
    pub(crate) by_id: HashMap<String, StateId>,
}

impl Chart {
    /// Parses, compiles and validates a chart definition from JSON.
    pub fn from_json(
        name: impl Into<String>,
        json: &Value,
        compiler: &dyn Compiler,
    ) -> Result<Self, ModelError> {
        let raw: RawChart = serde_json::from_value(json.clone())?;
        Self::from_raw(name, raw, compiler)
    }

    /// Builds a chart from raw parts.
    pub fn from_raw(
        name: impl Into<String>,
        raw: RawChart,
        compiler: &dyn Compiler,
    ) -> Result<Self, ModelError> {
        crate::builder::build(name.into(), raw, compiler)
    }

    pub fn root(&self) -> StateId {
        self.root
    }

    pub fn state(&self, id: StateId) -> &StateNode {
        &self.states[id.index()]
    }

    /// Number of states, root included.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Looks up a state by id string.
    pub fn resolve(&self, id: &str) -> Option<StateId> {
        self.by_id.get(id).copied()
    }

    /// All state ids in arena order.
    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        (0..self.states.len() as u32).map(StateId)
    }

    pub fn doc_order(&self, id: StateId) -> u32 {
        self.state(id).doc_order
    }

    /// Proper ancestors of `id`, nearest first, root last.
    pub fn ancestors(&self, id: StateId) -> Ancestors<'_> {
        Ancestors {
            chart: self,
            next: self.state(id).parent,
        }
    }

    /// Whether `a` is a proper descendant of `b`.
    pub fn is_descendant(&self, a: StateId, b: StateId) -> bool {
        self.ancestors(a).any(|anc| anc == b)
    }

    /// Whether `a` is `b` or a proper descendant of `b`.
    pub fn is_descendant_or_self(&self, a: StateId, b: StateId) -> bool {
        a == b || self.is_descendant(a, b)
    }

    /// Sorts state ids into document order.
    pub fn sort_document(&self, ids: &mut [StateId]) {
        ids.sort_by_key(|&id| self.doc_order(id));
    }

    /// Sorts state ids into reverse document order (exit order).
    pub fn sort_reverse_document(&self, ids: &mut [StateId]) {
        ids.sort_by_key(|&id| std::cmp::Reverse(self.doc_order(id)));
    }

    /// The nearest ancestor of `id` (inclusive) that is compound or root.
    /// Exists for every state, since root qualifies.
    pub fn nearest_compound_ancestor(&self, id: StateId) -> StateId {
        let mut current = id;
        loop {
            if self.state(current).is_compound_like() {
                return current;
            }
            match self.state(current).parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }
}

/// Iterator over proper ancestors.
pub struct Ancestors<'a> {
    chart: &'a Chart,
    next: Option<StateId>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = self.chart.state(current).parent;
        Some(current)
    }
}
