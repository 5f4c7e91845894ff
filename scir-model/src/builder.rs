//! Chart construction from raw definitions.
//!
//! Building is two passes over the raw tree: the first allocates arena
//! nodes (assigning ids, kinds and document order), the second resolves
//! transition targets, compiles expressions and converts executable
//! content. Validation problems are collected into a [`ValidationErrors`]
//! map instead of failing at the first one.

use crate::action::{Action, Attr, Branch, ChildMachine, InvokeSpec, QuerySpec, SendSpec, ValueSource};
use crate::chart::{Chart, EventPattern, StateId, StateKind, StateNode, Transition, TransitionKind};
use crate::error::{ModelError, ValidationErrors};
use crate::raw::{RawAction, RawChart, RawInvoke, RawState, RawTransition};
use scir_expr::{CompiledExpr, Compiler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn build(
    name: String,
    raw: RawChart,
    compiler: &dyn Compiler,
) -> Result<Chart, ModelError> {
    let json_bytes = serde_json::to_vec(&raw)?;
    let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

    let mut builder = Builder {
        states: Vec::new(),
        by_id: HashMap::new(),
        flat: Vec::new(),
        errors: ValidationErrors::new(),
        compiler,
        next_ordinal: 0,
        invoke_seq: HashMap::new(),
    };

    // Pass 1: allocate the arena in pre-order.
    let root = builder.alloc_root(&name);
    if raw.states.is_empty() {
        builder.errors.push(&name, "chart has no states");
    }
    for (index, child) in raw.states.iter().enumerate() {
        builder.alloc(child, root, index);
    }

    // Pass 2: resolve and compile.
    for position in 0..builder.flat.len() {
        let (sid, raw_state) = builder.flat[position].clone();
        builder.fill(sid, &raw_state);
    }

    // Root initial transition and init actions.
    let root_id = builder.states[root.index()].id.clone();
    let root_initial = builder.initial_transition(root, &root_id, &raw.initial, &[]);
    builder.states[root.index()].initial = root_initial;
    let on_init = builder.convert_actions(&root_id, &raw.on_init);

    builder.check_cross_region_targets();

    if !builder.errors.is_empty() {
        return Err(ModelError::Validation(builder.errors));
    }

    Ok(Chart {
        name,
        datamodel: raw.datamodel.clone(),
        on_init,
        checksum,
        states: builder.states,
        root,
        by_id: builder.by_id,
    })
}

struct Builder<'a> {
    states: Vec<StateNode>,
    by_id: HashMap<String, StateId>,
    /// Pre-order list pairing each arena slot with its raw node (children
    /// stripped; pass 2 only reads own fields).
    flat: Vec<(StateId, RawState)>,
    errors: ValidationErrors,
    compiler: &'a dyn Compiler,
    next_ordinal: u32,
    /// Per-owner counter for synthesized invoke ids.
    invoke_seq: HashMap<String, u32>,
}

impl<'a> Builder<'a> {
    fn alloc_root(&mut self, name: &str) -> StateId {
        let root = StateId(0);
        self.states.push(StateNode {
            id: name.to_string(),
            kind: StateKind::Root,
            parent: None,
            children: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            initial: None,
            invokes: Vec::new(),
            doc_order: 0,
        });
        root
    }

    fn alloc(&mut self, raw: &RawState, parent: StateId, child_index: usize) -> StateId {
        let id = match &raw.id {
            Some(id) => id.clone(),
            None => format!("{}.{}", self.states[parent.index()].id, child_index),
        };

        let kind = self.resolve_kind(&id, raw);

        let sid = StateId(self.states.len() as u32);
        let doc_order = sid.0;
        if self.by_id.contains_key(&id) {
            self.errors.push(&id, "duplicate state id");
        } else {
            self.by_id.insert(id.clone(), sid);
        }

        self.states.push(StateNode {
            id,
            kind,
            parent: Some(parent),
            children: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            initial: None,
            invokes: Vec::new(),
            doc_order,
        });
        self.states[parent.index()].children.push(sid);

        let mut shallow = raw.clone();
        shallow.states = Vec::new();
        self.flat.push((sid, shallow));

        for (index, child) in raw.states.iter().enumerate() {
            self.alloc(child, sid, index);
        }
        sid
    }

    fn resolve_kind(&mut self, id: &str, raw: &RawState) -> StateKind {
        let has_children = !raw.states.is_empty();
        match raw.kind.as_deref() {
            None => {
                if has_children {
                    StateKind::Compound
                } else {
                    StateKind::Atomic
                }
            }
            Some("compound") => StateKind::Compound,
            Some("parallel") => StateKind::Parallel,
            Some("atomic") => StateKind::Atomic,
            Some("final") => StateKind::Final,
            Some("history") => StateKind::History { deep: false },
            Some("deepHistory") => StateKind::History { deep: true },
            Some(other) => {
                self.errors
                    .push(id, format!("unknown state type '{}'", other));
                StateKind::Atomic
            }
        }
    }

    /// Pass 2 for one state: kind rules, transitions, content, invokes.
    fn fill(&mut self, sid: StateId, raw: &RawState) {
        let id = self.states[sid.index()].id.clone();
        let kind = self.states[sid.index()].kind;
        let has_children = !self.states[sid.index()].children.is_empty();

        match kind {
            StateKind::Compound => {
                if !has_children {
                    self.errors.push(&id, "compound state has no children");
                }
                let initial =
                    self.initial_transition(sid, &id, &raw.initial, &raw.initial_actions);
                self.states[sid.index()].initial = initial;
            }
            StateKind::Parallel => {
                if !has_children {
                    self.errors.push(&id, "parallel state has no children");
                }
                if !raw.initial.is_empty() {
                    self.errors
                        .push(&id, "parallel state cannot declare an initial child");
                }
            }
            StateKind::Atomic | StateKind::Final => {
                if has_children {
                    self.errors.push(&id, "leaf state cannot have children");
                }
            }
            StateKind::History { .. } => {
                self.fill_history(sid, &id, raw);
                return;
            }
            StateKind::Root => {}
        }

        let transitions: Vec<Transition> = raw
            .transitions
            .iter()
            .map(|t| self.convert_transition(sid, &id, t))
            .collect();
        let on_entry = self.convert_actions(&id, &raw.on_entry);
        let on_exit = self.convert_actions(&id, &raw.on_exit);
        let invokes: Vec<InvokeSpec> = raw
            .invoke
            .iter()
            .map(|inv| self.convert_invoke(&id, inv))
            .collect();

        let node = &mut self.states[sid.index()];
        node.transitions = transitions;
        node.on_entry = on_entry;
        node.on_exit = on_exit;
        node.invokes = invokes;
    }

    fn fill_history(&mut self, sid: StateId, id: &str, raw: &RawState) {
        if !self.states[sid.index()].children.is_empty() {
            self.errors.push(id, "history state cannot have children");
        }

        let parent = self.states[sid.index()].parent.expect("history has parent");
        if !matches!(
            self.states[parent.index()].kind,
            StateKind::Compound | StateKind::Parallel
        ) {
            self.errors
                .push(id, "history state must be a child of a compound or parallel state");
        }

        // Exactly one eventless, unconditioned default transition.
        match raw.transitions.as_slice() {
            [] => {
                self.errors
                    .push(id, "history state requires a default transition");
            }
            [default] => {
                if !default.event.is_empty() {
                    self.errors
                        .push(id, "history default transition cannot have an event");
                }
                if default.cond.is_some() {
                    self.errors
                        .push(id, "history default transition cannot have a condition");
                }
                if default.target.is_empty() {
                    self.errors
                        .push(id, "history default transition requires a target");
                }
                let transition = self.convert_transition(sid, id, default);
                for &target in &transition.targets {
                    if !self.is_descendant(target, parent) {
                        self.errors.push(
                            id,
                            format!(
                                "history default target '{}' is outside the containing state",
                                self.states[target.index()].id
                            ),
                        );
                    }
                }
                self.states[sid.index()].initial = Some(transition);
            }
            _ => {
                self.errors
                    .push(id, "history state takes exactly one default transition");
            }
        }
    }

    /// Builds the initial transition of a compound/root state.
    fn initial_transition(
        &mut self,
        sid: StateId,
        id: &str,
        initial: &[String],
        initial_actions: &[RawAction],
    ) -> Option<Transition> {
        if !self.states[sid.index()].is_compound_like() {
            return None;
        }

        let targets: Vec<StateId> = if initial.is_empty() {
            // Default: first non-history child.
            let first = self.states[sid.index()]
                .children
                .iter()
                .copied()
                .find(|&c| !self.states[c.index()].is_history());
            match first {
                Some(c) => vec![c],
                None => return None, // childless; reported elsewhere
            }
        } else {
            let resolved: Vec<StateId> = initial
                .iter()
                .filter_map(|t| self.resolve_target(id, t))
                .collect();
            for &target in &resolved {
                if !self.is_descendant(target, sid) {
                    self.errors.push(
                        id,
                        format!(
                            "initial target '{}' is not a descendant",
                            self.states[target.index()].id
                        ),
                    );
                }
            }
            resolved
        };

        let actions = self.convert_actions(id, initial_actions);
        Some(Transition {
            source: sid,
            targets,
            events: Vec::new(),
            cond: None,
            kind: TransitionKind::Internal,
            actions,
            ordinal: self.ordinal(),
        })
    }

    fn convert_transition(&mut self, sid: StateId, id: &str, raw: &RawTransition) -> Transition {
        let events: Vec<EventPattern> = raw
            .event
            .iter()
            .filter_map(|e| {
                if e.is_empty() {
                    self.errors.push(id, "empty event name in transition");
                    None
                } else {
                    Some(EventPattern::parse(e))
                }
            })
            .collect();

        let targets: Vec<StateId> = raw
            .target
            .iter()
            .filter_map(|t| self.resolve_target(id, t))
            .collect();

        let cond = raw.cond.as_ref().and_then(|src| self.compile(id, src));

        let kind = match raw.kind.as_deref() {
            None | Some("external") => TransitionKind::External,
            Some("internal") => TransitionKind::Internal,
            Some(other) => {
                self.errors
                    .push(id, format!("unknown transition type '{}'", other));
                TransitionKind::External
            }
        };

        Transition {
            source: sid,
            targets,
            events,
            cond,
            kind,
            actions: self.convert_actions(id, &raw.actions),
            ordinal: self.ordinal(),
        }
    }

    fn convert_actions(&mut self, owner: &str, raw: &[RawAction]) -> Vec<Action> {
        raw.iter()
            .filter_map(|a| self.convert_action(owner, a))
            .collect()
    }

    fn convert_action(&mut self, owner: &str, raw: &RawAction) -> Option<Action> {
        match raw {
            RawAction::Assign(assign) => {
                let value = self.value_pair(
                    owner,
                    "assign",
                    &assign.value,
                    &assign.expr,
                    true,
                )?;
                Some(Action::Assign {
                    location: assign.location.clone(),
                    value,
                })
            }
            RawAction::Raise(raise) => {
                if raise.event.is_empty() {
                    self.errors.push(owner, "raise requires an event name");
                    return None;
                }
                Some(Action::Raise {
                    event: raise.event.clone(),
                })
            }
            RawAction::Log(log) => {
                let value = log
                    .expr
                    .as_ref()
                    .and_then(|src| self.compile(owner, src))
                    .map(ValueSource::Expr);
                Some(Action::Log {
                    label: log.label.clone(),
                    message: log.message.clone(),
                    value,
                })
            }
            RawAction::If(raw_if) => {
                if raw_if.branches.is_empty() {
                    self.errors.push(owner, "if requires at least one branch");
                    return None;
                }
                let branches: Vec<Branch> = raw_if
                    .branches
                    .iter()
                    .filter_map(|b| {
                        let cond = self.compile(owner, &b.cond)?;
                        Some(Branch {
                            cond,
                            actions: self.convert_actions(owner, &b.actions),
                        })
                    })
                    .collect();
                Some(Action::If {
                    branches,
                    else_actions: self.convert_actions(owner, &raw_if.else_actions),
                })
            }
            RawAction::Foreach(foreach) => {
                let array = self.compile(owner, &foreach.array)?;
                if foreach.item.is_empty() {
                    self.errors.push(owner, "foreach requires an item binding");
                    return None;
                }
                Some(Action::Foreach {
                    array,
                    item: foreach.item.clone(),
                    index: foreach.index.clone(),
                    actions: self.convert_actions(owner, &foreach.actions),
                })
            }
            RawAction::Send(send) => {
                let event = self.attr_pair(owner, "send event", &send.event, &send.event_expr, true)?;
                let target = self.attr_pair(owner, "send target", &send.target, &send.target_expr, false);
                let activity =
                    self.attr_pair(owner, "send activity", &send.activity, &send.activity_expr, false);
                let delay = self.delay_pair(owner, &send.delay_ms, &send.delay_expr);
                if send.id.is_some() && send.id_location.is_some() {
                    self.errors
                        .push(owner, "send cannot set both id and idLocation");
                }
                let params = self.value_pair(owner, "send params", &send.params, &send.params_expr, false);
                Some(Action::Send(SendSpec {
                    event,
                    target,
                    activity,
                    delay,
                    id: send.id.clone(),
                    id_location: send.id_location.clone(),
                    params,
                }))
            }
            RawAction::Cancel(cancel) => {
                let send_id =
                    self.attr_pair(owner, "cancel sendId", &cancel.send_id, &cancel.send_id_expr, true)?;
                Some(Action::Cancel { send_id })
            }
            RawAction::Query(query) => {
                let activity =
                    self.attr_pair(owner, "query activity", &query.activity, &query.activity_expr, true)?;
                let target =
                    self.attr_pair(owner, "query target", &query.target, &query.target_expr, false);
                let params =
                    self.value_pair(owner, "query params", &query.params, &query.params_expr, false);
                if query.result_location.is_empty() {
                    self.errors.push(owner, "query requires a resultLocation");
                    return None;
                }
                Some(Action::Query(QuerySpec {
                    activity,
                    target,
                    params,
                    result_location: query.result_location.clone(),
                }))
            }
            RawAction::Invoke(invoke) => {
                let spec = self.convert_invoke(owner, invoke);
                Some(Action::Invoke(spec))
            }
        }
    }

    fn convert_invoke(&mut self, owner: &str, raw: &RawInvoke) -> InvokeSpec {
        let id = match &raw.id {
            Some(id) => id.clone(),
            None => {
                let seq = self.invoke_seq.entry(owner.to_string()).or_insert(0);
                let id = format!("{}.invoke{}", owner, seq);
                *seq += 1;
                id
            }
        };

        let machine = match (&raw.src, &raw.definition) {
            (Some(_), Some(_)) => {
                self.errors
                    .push(owner, "invoke cannot set both src and definition");
                ChildMachine::Named(String::new())
            }
            (Some(src), None) => ChildMachine::Named(src.clone()),
            (None, Some(definition)) => {
                let child_name = format!("{}:{}", owner, id);
                match Chart::from_raw(child_name.clone(), (**definition).clone(), self.compiler) {
                    Ok(chart) => ChildMachine::Inline(Arc::new(chart)),
                    Err(ModelError::Validation(child_errors)) => {
                        for (child_id, messages) in child_errors.iter() {
                            for message in messages {
                                self.errors
                                    .push(format!("{}/{}", child_name, child_id), message.clone());
                            }
                        }
                        ChildMachine::Named(String::new())
                    }
                    Err(e) => {
                        self.errors
                            .push(owner, format!("invalid inline child definition: {}", e));
                        ChildMachine::Named(String::new())
                    }
                }
            }
            (None, None) => {
                self.errors
                    .push(owner, "invoke requires either src or definition");
                ChildMachine::Named(String::new())
            }
        };

        let input = self.value_pair(owner, "invoke input", &raw.input, &raw.input_expr, false);
        let finalize = self.convert_actions(owner, &raw.finalize);

        InvokeSpec {
            id,
            machine,
            input,
            finalize,
        }
    }

    /// Static-vs-expression string attribute pair. Both set, or neither
    /// when required, is a validation error.
    fn attr_pair(
        &mut self,
        owner: &str,
        what: &str,
        static_form: &Option<String>,
        expr_form: &Option<String>,
        required: bool,
    ) -> Option<Attr<String>> {
        match (static_form, expr_form) {
            (Some(_), Some(_)) => {
                self.errors.push(
                    owner,
                    format!("{}: static and expression forms are mutually exclusive", what),
                );
                None
            }
            (Some(value), None) => Some(Attr::Static(value.clone())),
            (None, Some(src)) => self.compile(owner, src).map(Attr::Expr),
            (None, None) => {
                if required {
                    self.errors
                        .push(owner, format!("{}: one of the forms is required", what));
                }
                None
            }
        }
    }

    fn value_pair(
        &mut self,
        owner: &str,
        what: &str,
        literal: &Option<serde_json::Value>,
        expr_form: &Option<String>,
        required: bool,
    ) -> Option<ValueSource> {
        match (literal, expr_form) {
            (Some(_), Some(_)) => {
                self.errors.push(
                    owner,
                    format!("{}: literal and expression forms are mutually exclusive", what),
                );
                None
            }
            (Some(value), None) => Some(ValueSource::Literal(value.clone())),
            (None, Some(src)) => self.compile(owner, src).map(ValueSource::Expr),
            (None, None) => {
                if required {
                    self.errors
                        .push(owner, format!("{}: one of the forms is required", what));
                }
                None
            }
        }
    }

    fn delay_pair(
        &mut self,
        owner: &str,
        delay_ms: &Option<u64>,
        delay_expr: &Option<String>,
    ) -> Option<Attr<Duration>> {
        match (delay_ms, delay_expr) {
            (Some(_), Some(_)) => {
                self.errors.push(
                    owner,
                    "send delay: static and expression forms are mutually exclusive",
                );
                None
            }
            (Some(ms), None) => Some(Attr::Static(Duration::from_millis(*ms))),
            (None, Some(src)) => self.compile(owner, src).map(Attr::Expr),
            (None, None) => None,
        }
    }

    fn compile(&mut self, owner: &str, src: &str) -> Option<Arc<dyn CompiledExpr>> {
        match self.compiler.compile(src) {
            Ok(expr) => Some(expr),
            Err(e) => {
                self.errors.push(owner, format!("'{}': {}", src, e));
                None
            }
        }
    }

    fn resolve_target(&mut self, owner: &str, target: &str) -> Option<StateId> {
        match self.by_id.get(target) {
            Some(&sid) => Some(sid),
            None => {
                self.errors
                    .push(owner, format!("unknown target state '{}'", target));
                None
            }
        }
    }

    fn ordinal(&mut self) -> u32 {
        let n = self.next_ordinal;
        self.next_ordinal += 1;
        n
    }

    fn is_descendant(&self, a: StateId, b: StateId) -> bool {
        let mut current = self.states[a.index()].parent;
        while let Some(p) = current {
            if p == b {
                return true;
            }
            current = self.states[p.index()].parent;
        }
        false
    }

    /// Rejects models where transitions in sibling parallel regions can
    /// fire together yet target the same state. The interpreter refuses
    /// to guess a resolution for such clashes at runtime.
    fn check_cross_region_targets(&mut self) {
        let parallels: Vec<StateId> = (0..self.states.len() as u32)
            .map(StateId)
            .filter(|&sid| self.states[sid.index()].kind == StateKind::Parallel)
            .collect();

        for p in parallels {
            let regions = self.states[p.index()].children.clone();
            for (i, &r1) in regions.iter().enumerate() {
                for &r2 in &regions[i + 1..] {
                    self.check_region_pair(p, r1, r2);
                }
            }
        }
    }

    fn check_region_pair(&mut self, parallel: StateId, r1: StateId, r2: StateId) {
        let t1s = self.region_transitions(r1);
        let t2s = self.region_transitions(r2);

        let mut clashes: Vec<String> = Vec::new();
        for &(s1, i1) in &t1s {
            for &(s2, i2) in &t2s {
                let a = &self.states[s1.index()].transitions[i1];
                let b = &self.states[s2.index()].transitions[i2];
                let can_cofire = (a.is_eventless() && b.is_eventless())
                    || a.events
                        .iter()
                        .any(|pa| b.events.iter().any(|pb| pa.overlaps(pb)));
                if !can_cofire {
                    continue;
                }
                if let Some(&shared) = a.targets.iter().find(|t| b.targets.contains(t)) {
                    clashes.push(format!(
                        "transitions in sibling regions '{}' and '{}' both target '{}'",
                        self.states[r1.index()].id,
                        self.states[r2.index()].id,
                        self.states[shared.index()].id
                    ));
                }
            }
        }
        let parallel_id = self.states[parallel.index()].id.clone();
        for clash in clashes {
            self.errors.push(&parallel_id, clash);
        }
    }

    /// Transition slots of a region: the state itself and all descendants.
    fn region_transitions(&self, region: StateId) -> Vec<(StateId, usize)> {
        let mut out = Vec::new();
        let mut stack = vec![region];
        while let Some(sid) = stack.pop() {
            for index in 0..self.states[sid.index()].transitions.len() {
                out.push((sid, index));
            }
            stack.extend(self.states[sid.index()].children.iter().copied());
        }
        out
    }
}
