//! The active configuration.

use scir_model::{Chart, StateId, StateKind};
use std::collections::HashSet;

/// The set of currently active states. The root is never a member.
///
/// Membership is a hash set; ordered views are produced on demand against
/// the chart's precomputed document order.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    members: HashSet<StateId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.members.contains(&id)
    }

    pub fn insert(&mut self, id: StateId) -> bool {
        self.members.insert(id)
    }

    pub fn remove(&mut self, id: StateId) -> bool {
        self.members.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Unordered iteration over members.
    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.members.iter().copied()
    }

    /// Members in document order (entry order).
    pub fn ordered(&self, chart: &Chart) -> Vec<StateId> {
        let mut ids: Vec<StateId> = self.members.iter().copied().collect();
        chart.sort_document(&mut ids);
        ids
    }

    /// Members in reverse document order (exit order).
    pub fn ordered_reverse(&self, chart: &Chart) -> Vec<StateId> {
        let mut ids = self.ordered(chart);
        ids.reverse();
        ids
    }

    /// Active atomic/final states in document order; the selection
    /// algorithm walks one branch per entry.
    pub fn atomic_states(&self, chart: &Chart) -> Vec<StateId> {
        let mut ids: Vec<StateId> = self
            .members
            .iter()
            .copied()
            .filter(|&id| chart.state(id).is_atomic_or_final())
            .collect();
        chart.sort_document(&mut ids);
        ids
    }

    /// Member id strings in document order.
    pub fn state_ids(&self, chart: &Chart) -> Vec<String> {
        self.ordered(chart)
            .into_iter()
            .map(|id| chart.state(id).id.clone())
            .collect()
    }

    /// Legality invariant: every compound member has exactly one active
    /// child, every parallel member has all children active, every
    /// member's parent chain (below root) is active, and pseudostates are
    /// never members.
    pub fn is_legal(&self, chart: &Chart) -> bool {
        for &id in &self.members {
            let node = chart.state(id);
            match node.kind {
                StateKind::Compound => {
                    let active = node
                        .children
                        .iter()
                        .filter(|&&c| self.members.contains(&c))
                        .count();
                    if active != 1 {
                        return false;
                    }
                }
                StateKind::Parallel => {
                    let all_active = node
                        .children
                        .iter()
                        .filter(|&&c| !chart.state(c).is_history())
                        .all(|&c| self.members.contains(&c));
                    if !all_active {
                        return false;
                    }
                }
                StateKind::Atomic | StateKind::Final => {}
                StateKind::Root | StateKind::History { .. } => return false,
            }
            if let Some(parent) = node.parent {
                if parent != chart.root() && !self.members.contains(&parent) {
                    return false;
                }
            }
        }
        true
    }
}
