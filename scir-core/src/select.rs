//! Transition selection, conflict resolution, exit and entry sets.
//!
//! Pure functions over the chart, the configuration and the history
//! store; the interpreter loop in [`crate::interp`] sequences them. The
//! algorithms follow the usual statechart treatment: one transition is
//! selected per active atomic branch, conflicts are resolved by exit-set
//! intersection with the deeper source winning, and the exit/entry sets
//! are derived from each surviving transition's domain.

use crate::config::Configuration;
use crate::event::Event;
use crate::history::HistoryStore;
use scir_model::{Action, Chart, StateId, StateKind, Transition, TransitionKind};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Result of transition selection for one event (or for the eventless
/// check).
#[derive(Debug, Default)]
pub struct Selection<'a> {
    /// Surviving transitions, ordered by source document order then by
    /// transition ordinal.
    pub transitions: Vec<&'a Transition>,
    /// Guard evaluation failures encountered during selection. The guards
    /// were treated as false; the interpreter raises `error.execution`
    /// for each.
    pub eval_errors: Vec<String>,
}

impl<'a> Selection<'a> {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Selects at most one enabled transition per active atomic branch.
///
/// With `event = None` only eventless transitions are candidates;
/// otherwise only transitions with a matching event pattern. Within a
/// branch, candidate states are the atomic state and then its ancestors
/// nearest-first, and within a state transitions are tried in definition
/// order; the first one whose guard holds wins the branch.
pub fn select_transitions<'a>(
    chart: &'a Chart,
    config: &Configuration,
    history: &HistoryStore,
    event: Option<&Event>,
    ctx: &Value,
) -> Selection<'a> {
    let mut selected: Vec<&'a Transition> = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();
    let mut eval_errors = Vec::new();

    for atomic in config.atomic_states(chart) {
        'branch: for state in std::iter::once(atomic).chain(chart.ancestors(atomic)) {
            for transition in &chart.state(state).transitions {
                let candidate = match event {
                    Some(event) => transition.matches_event(&event.name),
                    None => transition.is_eventless(),
                };
                if !candidate {
                    continue;
                }
                let enabled = match &transition.cond {
                    None => true,
                    Some(cond) => match cond.eval_bool(ctx) {
                        Ok(holds) => holds,
                        Err(err) => {
                            eval_errors.push(format!(
                                "guard on transition from '{}' failed: {}",
                                chart.state(state).id,
                                err
                            ));
                            false
                        }
                    },
                };
                if enabled {
                    if seen.insert(transition.ordinal) {
                        selected.push(transition);
                    }
                    break 'branch;
                }
            }
        }
    }

    let mut transitions = resolve_conflicts(chart, config, history, selected);
    transitions.sort_by_key(|t| (chart.doc_order(t.source), t.ordinal));
    Selection {
        transitions,
        eval_errors,
    }
}

/// Drops conflicting transitions: two transitions conflict when their
/// exit sets intersect, or when one's source is a proper ancestor of the
/// other's and their domains overlap (one domain contains the other).
/// The transition whose source is deeper in the tree preempts the other.
/// The second clause is what lets a descendant's transition preempt an
/// ancestor's targetless transition, whose exit set is empty.
fn resolve_conflicts<'a>(
    chart: &Chart,
    config: &Configuration,
    history: &HistoryStore,
    enabled: Vec<&'a Transition>,
) -> Vec<&'a Transition> {
    struct Candidate<'a> {
        transition: &'a Transition,
        exit: HashSet<StateId>,
        domain: StateId,
    }

    let mut filtered: Vec<Candidate<'a>> = Vec::new();

    'next: for t1 in enabled {
        let exit1: HashSet<StateId> = transition_exit_set(chart, config, history, t1)
            .into_iter()
            .collect();
        let targets1 = effective_targets(chart, history, &t1.targets);
        let domain1 = transition_domain(chart, t1, &targets1);
        let mut preempted: Vec<usize> = Vec::new();
        for (i, other) in filtered.iter().enumerate() {
            let t2 = other.transition;
            let nested_sources = chart.is_descendant(t1.source, t2.source)
                || chart.is_descendant(t2.source, t1.source);
            let overlapping_domains = chart.is_descendant_or_self(domain1, other.domain)
                || chart.is_descendant_or_self(other.domain, domain1);
            if exit1.is_disjoint(&other.exit) && !(nested_sources && overlapping_domains) {
                continue;
            }
            if chart.is_descendant(t1.source, t2.source) {
                preempted.push(i);
            } else {
                continue 'next;
            }
        }
        for &i in preempted.iter().rev() {
            filtered.remove(i);
        }
        filtered.push(Candidate {
            transition: t1,
            exit: exit1,
            domain: domain1,
        });
    }

    filtered.into_iter().map(|c| c.transition).collect()
}

/// Resolves history pseudostates among the targets: a stored snapshot
/// replaces the pseudostate, otherwise its default transition's targets
/// do (recursively). Order-preserving, deduplicated.
pub fn effective_targets(
    chart: &Chart,
    history: &HistoryStore,
    targets: &[StateId],
) -> Vec<StateId> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    collect_effective(chart, history, targets, &mut out, &mut seen);
    out
}

fn collect_effective(
    chart: &Chart,
    history: &HistoryStore,
    targets: &[StateId],
    out: &mut Vec<StateId>,
    seen: &mut HashSet<StateId>,
) {
    for &target in targets {
        if chart.state(target).is_history() {
            if let Some(snapshot) = history.get(target) {
                let snapshot = snapshot.to_vec();
                collect_effective(chart, history, &snapshot, out, seen);
            } else if let Some(default) = &chart.state(target).initial {
                collect_effective(chart, history, &default.targets, out, seen);
            }
        } else if seen.insert(target) {
            out.push(target);
        }
    }
}

/// The transition domain: the innermost compound state (or the root)
/// whose descendants cover the whole transition. Internal transitions
/// whose source covers every target keep the source as domain.
pub fn transition_domain(chart: &Chart, transition: &Transition, targets: &[StateId]) -> StateId {
    if targets.is_empty() {
        return transition.source;
    }
    let source = transition.source;
    if transition.kind == TransitionKind::Internal
        && chart.state(source).is_compound_like()
        && targets.iter().all(|&t| chart.is_descendant(t, source))
    {
        return source;
    }
    for anc in chart.ancestors(source) {
        if chart.state(anc).is_compound_like()
            && targets.iter().all(|&t| chart.is_descendant(t, anc))
        {
            return anc;
        }
    }
    chart.root()
}

/// Exit set of a single transition: active proper descendants of its
/// domain. Targetless transitions exit nothing.
fn transition_exit_set(
    chart: &Chart,
    config: &Configuration,
    history: &HistoryStore,
    transition: &Transition,
) -> Vec<StateId> {
    if transition.targets.is_empty() {
        return Vec::new();
    }
    let targets = effective_targets(chart, history, &transition.targets);
    let domain = transition_domain(chart, transition, &targets);
    config
        .iter()
        .filter(|&s| chart.is_descendant(s, domain))
        .collect()
}

/// Combined exit set of the surviving transitions, in reverse document
/// order (innermost first).
pub fn compute_exit_set(
    chart: &Chart,
    config: &Configuration,
    history: &HistoryStore,
    transitions: &[&Transition],
) -> Vec<StateId> {
    let mut set: HashSet<StateId> = HashSet::new();
    for transition in transitions {
        set.extend(transition_exit_set(chart, config, history, transition));
    }
    let mut out: Vec<StateId> = set.into_iter().collect();
    chart.sort_reverse_document(&mut out);
    out
}

/// States to enter for one microstep, plus the default-entry content to
/// run after each state's entry actions.
#[derive(Debug, Default)]
pub struct EntrySet<'a> {
    /// States to enter, in document order.
    pub states: Vec<StateId>,
    /// Initial-transition or history-default content keyed by the state
    /// it runs under.
    pub default_content: HashMap<StateId, &'a [Action]>,
}

/// Computes the entry set of the surviving transitions. Targets are
/// completed downward (compound default entry, parallel regions, history
/// restoration) and upward to each transition's domain.
pub fn compute_entry_set<'a>(
    chart: &'a Chart,
    history: &HistoryStore,
    transitions: &[&Transition],
) -> EntrySet<'a> {
    let mut entry = EntryBuilder {
        chart,
        history,
        states: HashSet::new(),
        default_content: HashMap::new(),
    };
    for transition in transitions {
        if transition.targets.is_empty() {
            continue;
        }
        for &target in &transition.targets {
            entry.add_descendants(target);
        }
        let targets = effective_targets(chart, history, &transition.targets);
        let domain = transition_domain(chart, transition, &targets);
        for &target in &targets {
            entry.add_ancestors(target, domain);
        }
    }
    let mut states: Vec<StateId> = entry.states.into_iter().collect();
    chart.sort_document(&mut states);
    EntrySet {
        states,
        default_content: entry.default_content,
    }
}

struct EntryBuilder<'a, 'h> {
    chart: &'a Chart,
    history: &'h HistoryStore,
    states: HashSet<StateId>,
    default_content: HashMap<StateId, &'a [Action]>,
}

impl<'a, 'h> EntryBuilder<'a, 'h> {
    fn add_descendants(&mut self, state: StateId) {
        let node = self.chart.state(state);
        match node.kind {
            StateKind::History { .. } => {
                let parent = node.parent.unwrap_or_else(|| self.chart.root());
                if let Some(snapshot) = self.history.get(state) {
                    let snapshot = snapshot.to_vec();
                    for &s in &snapshot {
                        self.add_descendants(s);
                    }
                    for &s in &snapshot {
                        self.add_ancestors(s, parent);
                    }
                } else if let Some(default) = &node.initial {
                    self.default_content
                        .insert(parent, default.actions.as_slice());
                    for &s in &default.targets {
                        self.add_descendants(s);
                    }
                    for &s in &default.targets {
                        self.add_ancestors(s, parent);
                    }
                }
            }
            StateKind::Compound => {
                self.states.insert(state);
                if let Some(initial) = &node.initial {
                    self.default_content
                        .insert(state, initial.actions.as_slice());
                    let targets = initial.targets.clone();
                    for &s in &targets {
                        self.add_descendants(s);
                    }
                    for &s in &targets {
                        self.add_ancestors(s, state);
                    }
                }
            }
            StateKind::Parallel => {
                self.states.insert(state);
                self.complete_parallel(state);
            }
            StateKind::Atomic | StateKind::Final => {
                self.states.insert(state);
            }
            StateKind::Root => {}
        }
    }

    fn add_ancestors(&mut self, state: StateId, upto: StateId) {
        let ancestors: Vec<StateId> = self.chart.ancestors(state).collect();
        for anc in ancestors {
            if anc == upto || self.chart.state(anc).kind == StateKind::Root {
                break;
            }
            self.states.insert(anc);
            if self.chart.state(anc).is_parallel() {
                self.complete_parallel(anc);
            }
        }
    }

    /// Enters the default child of every region not already covered by an
    /// explicit target.
    fn complete_parallel(&mut self, parallel: StateId) {
        let children = self.chart.state(parallel).children.clone();
        for child in children {
            if self.chart.state(child).is_history() {
                continue;
            }
            let covered = self
                .states
                .iter()
                .any(|&s| self.chart.is_descendant_or_self(s, child));
            if !covered {
                self.add_descendants(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scir_expr::DefaultCompiler;
    use serde_json::json;

    fn chart(json: Value) -> Chart {
        Chart::from_json("test", &json, &DefaultCompiler::new()).unwrap()
    }

    fn enter_initial(chart: &Chart, config: &mut Configuration) {
        // Walk the default entry of the root's initial transition.
        let initial = chart.state(chart.root()).initial.as_ref().unwrap();
        let entry = compute_entry_set(chart, &HistoryStore::new(), &[initial]);
        for id in entry.states {
            config.insert(id);
        }
    }

    #[test]
    fn test_first_matching_transition_wins() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "ctx.flag", "target": "b"},
                    {"event": "go", "target": "c"}
                ]},
                {"id": "b"},
                {"id": "c"}
            ]
        }));
        let mut config = Configuration::new();
        config.insert(chart.resolve("a").unwrap());

        let history = HistoryStore::new();
        let event = Event::external("go", json!(null));

        let sel = select_transitions(&chart, &config, &history, Some(&event), &json!({"flag": true}));
        assert_eq!(sel.transitions.len(), 1);
        assert_eq!(sel.transitions[0].targets, vec![chart.resolve("b").unwrap()]);

        let sel = select_transitions(&chart, &config, &history, Some(&event), &json!({"flag": false}));
        assert_eq!(sel.transitions[0].targets, vec![chart.resolve("c").unwrap()]);
    }

    #[test]
    fn test_non_numeric_comparison_guard_falls_through() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "cond": "ctx.items > 1", "target": "b"},
                    {"event": "go", "target": "c"}
                ]},
                {"id": "b"},
                {"id": "c"}
            ]
        }));
        let mut config = Configuration::new();
        config.insert(chart.resolve("a").unwrap());

        let event = Event::external("go", json!(null));
        let sel = select_transitions(
            &chart,
            &config,
            &HistoryStore::new(),
            Some(&event),
            &json!({"items": [1, 2]}),
        );
        assert_eq!(sel.transitions.len(), 1);
        assert_eq!(sel.transitions[0].targets, vec![chart.resolve("c").unwrap()]);
    }

    #[test]
    fn test_descendant_source_preempts_ancestor() {
        let chart = chart(json!({
            "states": [
                {"id": "outer", "initial": "inner", "transitions": [
                    {"event": "go", "target": "other"}
                ], "states": [
                    {"id": "inner", "transitions": [{"event": "go", "target": "sibling"}]},
                    {"id": "sibling"}
                ]},
                {"id": "other"}
            ]
        }));
        let mut config = Configuration::new();
        config.insert(chart.resolve("outer").unwrap());
        config.insert(chart.resolve("inner").unwrap());

        let event = Event::external("go", json!(null));
        let sel = select_transitions(&chart, &config, &HistoryStore::new(), Some(&event), &json!({}));
        assert_eq!(sel.transitions.len(), 1);
        assert_eq!(sel.transitions[0].source, chart.resolve("inner").unwrap());
    }

    #[test]
    fn test_targetless_ancestor_loses_to_targeted_descendant() {
        let chart = chart(json!({
            "initial": "outer",
            "states": [
                {"id": "outer", "initial": "p",
                 "transitions": [{"event": "go",
                     "actions": [{"assign": {"location": "noted", "value": true}}]}],
                 "states": [
                    {"id": "p", "type": "parallel", "states": [
                        {"id": "x", "initial": "x1", "states": [
                            {"id": "x1", "transitions": [{"event": "go", "target": "x2"}]},
                            {"id": "x2"}
                        ]},
                        {"id": "y", "initial": "y1", "states": [{"id": "y1"}]}
                    ]}
                 ]}
            ]
        }));
        let mut config = Configuration::new();
        enter_initial(&chart, &mut config);

        // region y has no handler for `go`, so its branch walks up to the
        // targetless transition on `outer`; the targeted transition in
        // region x must preempt it even though its exit set is empty
        let event = Event::external("go", json!(null));
        let sel = select_transitions(&chart, &config, &HistoryStore::new(), Some(&event), &json!({}));
        assert_eq!(sel.transitions.len(), 1);
        assert_eq!(sel.transitions[0].source, chart.resolve("x1").unwrap());
    }

    #[test]
    fn test_parallel_regions_fire_together() {
        let chart = chart(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "x", "initial": "x1", "states": [
                        {"id": "x1", "transitions": [{"event": "go", "target": "x2"}]},
                        {"id": "x2"}
                    ]},
                    {"id": "y", "initial": "y1", "states": [
                        {"id": "y1", "transitions": [{"event": "go", "target": "y2"}]},
                        {"id": "y2"}
                    ]}
                ]}
            ]
        }));
        let mut config = Configuration::new();
        enter_initial(&chart, &mut config);

        let event = Event::external("go", json!(null));
        let sel = select_transitions(&chart, &config, &HistoryStore::new(), Some(&event), &json!({}));
        assert_eq!(sel.transitions.len(), 2);
        // deterministic order by source document order
        assert_eq!(sel.transitions[0].source, chart.resolve("x1").unwrap());
        assert_eq!(sel.transitions[1].source, chart.resolve("y1").unwrap());
    }

    #[test]
    fn test_exit_set_reverse_document_order() {
        let chart = chart(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "x", "initial": "x1", "states": [{"id": "x1"}]},
                    {"id": "y", "initial": "y1", "states": [{"id": "y1"}]}
                ]},
                {"id": "done", "transitions": []}
            ]
        }));
        let mut config = Configuration::new();
        enter_initial(&chart, &mut config);

        // a transition from x1 out of the whole parallel exits everything
        let t = Transition {
            source: chart.resolve("x1").unwrap(),
            targets: vec![chart.resolve("done").unwrap()],
            events: vec![],
            cond: None,
            kind: TransitionKind::External,
            actions: vec![],
            ordinal: 99,
        };
        let exits = compute_exit_set(&chart, &config, &HistoryStore::new(), &[&t]);
        let ids: Vec<&str> = exits.iter().map(|&s| chart.state(s).id.as_str()).collect();
        assert_eq!(ids, vec!["y1", "y", "x1", "x", "p"]);
    }

    #[test]
    fn test_entry_set_completes_defaults() {
        let chart = chart(json!({
            "initial": "deep",
            "states": [
                {"id": "deep", "initial": "mid", "states": [
                    {"id": "mid", "initial": "leaf", "states": [{"id": "leaf"}]}
                ]}
            ]
        }));
        let initial = chart.state(chart.root()).initial.clone().unwrap();
        let entry = compute_entry_set(&chart, &HistoryStore::new(), &[&initial]);
        let ids: Vec<&str> = entry
            .states
            .iter()
            .map(|&s| chart.state(s).id.as_str())
            .collect();
        assert_eq!(ids, vec!["deep", "mid", "leaf"]);
    }

    #[test]
    fn test_entry_set_enters_uncovered_parallel_regions() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "x2"}]},
                {"id": "p", "type": "parallel", "states": [
                    {"id": "x", "initial": "x1", "states": [{"id": "x1"}, {"id": "x2"}]},
                    {"id": "y", "initial": "y1", "states": [{"id": "y1"}]}
                ]}
            ]
        }));
        let a = chart.resolve("a").unwrap();
        let t = &chart.state(a).transitions[0];
        let entry = compute_entry_set(&chart, &HistoryStore::new(), &[t]);
        let ids: Vec<&str> = entry
            .states
            .iter()
            .map(|&s| chart.state(s).id.as_str())
            .collect();
        assert_eq!(ids, vec!["p", "x", "x2", "y", "y1"]);
    }

    #[test]
    fn test_history_targets_resolve_to_snapshot_or_default() {
        let chart = chart(json!({
            "states": [
                {"id": "off", "transitions": [{"event": "on", "target": "h"}]},
                {"id": "on", "initial": "low", "states": [
                    {"id": "h", "type": "history", "transitions": [{"target": "low"}]},
                    {"id": "low"},
                    {"id": "high"}
                ]}
            ]
        }));
        let h = chart.resolve("h").unwrap();
        let low = chart.resolve("low").unwrap();
        let high = chart.resolve("high").unwrap();

        let empty = HistoryStore::new();
        assert_eq!(effective_targets(&chart, &empty, &[h]), vec![low]);

        let mut recorded = HistoryStore::new();
        recorded.record(h, vec![high]);
        assert_eq!(effective_targets(&chart, &recorded, &[h]), vec![high]);

        // entering through history restores the snapshot
        let off = chart.resolve("off").unwrap();
        let t = &chart.state(off).transitions[0];
        let entry = compute_entry_set(&chart, &recorded, &[t]);
        let ids: Vec<&str> = entry
            .states
            .iter()
            .map(|&s| chart.state(s).id.as_str())
            .collect();
        assert_eq!(ids, vec!["on", "high"]);
    }

    #[test]
    fn test_internal_transition_domain_is_source() {
        let chart = chart(json!({
            "states": [
                {"id": "outer", "initial": "inner", "transitions": [
                    {"event": "cycle", "target": "inner", "type": "internal"},
                    {"event": "restart", "target": "inner"}
                ], "states": [{"id": "inner"}]}
            ]
        }));
        let outer = chart.resolve("outer").unwrap();
        let inner = chart.resolve("inner").unwrap();

        let internal = &chart.state(outer).transitions[0];
        assert_eq!(transition_domain(&chart, internal, &[inner]), outer);

        // the external variant exits and re-enters `outer` itself
        let external = &chart.state(outer).transitions[1];
        assert_eq!(transition_domain(&chart, external, &[inner]), chart.root());
    }
}
