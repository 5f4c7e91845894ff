//! History snapshots.
//!
//! When a compound state with history children is exited, the relevant
//! slice of the configuration is recorded per history pseudostate. A later
//! transition targeting the pseudostate restores the snapshot; if none was
//! ever recorded, the pseudostate's default transition applies instead.

use crate::config::Configuration;
use scir_model::{Chart, StateId, StateKind};
use std::collections::HashMap;

/// Recorded history, keyed by history pseudostate.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    snapshots: HashMap<StateId, Vec<StateId>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot for a history pseudostate, if one was ever recorded.
    pub fn get(&self, history: StateId) -> Option<&[StateId]> {
        self.snapshots.get(&history).map(Vec::as_slice)
    }

    pub fn record(&mut self, history: StateId, snapshot: Vec<StateId>) {
        self.snapshots.insert(history, snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Records snapshots for every history child of every state being exited.
/// Runs against the configuration as it stood before the exit set is
/// removed. Shallow history records the active immediate children; deep
/// history records the active atomic descendants. Both in document order.
pub fn record_history(
    chart: &Chart,
    config: &Configuration,
    exit_set: &[StateId],
    store: &mut HistoryStore,
) {
    for &exited in exit_set {
        for &child in &chart.state(exited).children {
            let deep = match chart.state(child).kind {
                StateKind::History { deep } => deep,
                _ => continue,
            };
            let mut snapshot: Vec<StateId> = if deep {
                config
                    .iter()
                    .filter(|&s| {
                        chart.state(s).is_atomic_or_final() && chart.is_descendant(s, exited)
                    })
                    .collect()
            } else {
                config
                    .iter()
                    .filter(|&s| chart.state(s).parent == Some(exited))
                    .collect()
            };
            chart.sort_document(&mut snapshot);
            store.record(child, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scir_expr::DefaultCompiler;
    use serde_json::json;

    fn chart() -> Chart {
        Chart::from_json(
            "test",
            &json!({
                "states": [
                    {"id": "off"},
                    {"id": "on", "initial": "low", "states": [
                        {"id": "h", "type": "history",
                         "transitions": [{"target": "low"}]},
                        {"id": "hd", "type": "deepHistory",
                         "transitions": [{"target": "low"}]},
                        {"id": "low"},
                        {"id": "mid", "initial": "m1", "states": [
                            {"id": "m1"}, {"id": "m2"}
                        ]}
                    ]}
                ]
            }),
            &DefaultCompiler::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_shallow_and_deep_snapshots() {
        let chart = chart();
        let on = chart.resolve("on").unwrap();
        let mid = chart.resolve("mid").unwrap();
        let m2 = chart.resolve("m2").unwrap();

        let mut config = Configuration::new();
        config.insert(on);
        config.insert(mid);
        config.insert(m2);

        let mut store = HistoryStore::new();
        record_history(&chart, &config, &[m2, mid, on], &mut store);

        let h = chart.resolve("h").unwrap();
        let hd = chart.resolve("hd").unwrap();
        assert_eq!(store.get(h).unwrap(), &[mid]);
        assert_eq!(store.get(hd).unwrap(), &[m2]);
    }

    #[test]
    fn test_no_snapshot_before_first_exit() {
        let chart = chart();
        let store = HistoryStore::new();
        assert!(store.get(chart.resolve("h").unwrap()).is_none());
    }
}
