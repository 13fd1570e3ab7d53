//! Field-level last-write-wins CRDT over graph deltas.
//!
//! Every field carries a state (millisecond timestamp). A field from an
//! update wins when its state is greater than the stored one; equal states
//! are resolved by comparing canonical serializations, the greater value
//! winning. States further in the future than the grace window are ignored.
//!
//! These are pure functions: no I/O, no shared state.

use crate::types::{GraphData, Node, State, Value, machine_state};

/// Default tolerance for writes stamped ahead of the local clock.
pub const DEFAULT_FUTURE_GRACE_MS: State = 10 * 60 * 1000;

/// Knobs for [`diff`].
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Reference "now". `None` reads the machine clock.
    pub machine_state: Option<State>,
    pub future_grace: State,
    /// Canonical form used to order values written at the same state.
    pub lexical: fn(&Value) -> String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            machine_state: None,
            future_grace: DEFAULT_FUTURE_GRACE_MS,
            lexical: Value::canonical,
        }
    }
}

impl DiffOptions {
    pub fn with_grace(future_grace: State) -> Self {
        Self {
            future_grace,
            ..Default::default()
        }
    }

    pub fn at(mut self, machine_state: State) -> Self {
        self.machine_state = Some(machine_state);
        self
    }
}

/// Compute the minimal delta of `updated` over `existing`.
///
/// Returns `None` when nothing in `updated` advances `existing`.
pub fn diff(updated: &GraphData, existing: &GraphData, opts: &DiffOptions) -> Option<GraphData> {
    let max_state = opts.machine_state.unwrap_or_else(machine_state) + opts.future_grace;
    let mut changes = GraphData::new();

    for (soul, updated_node) in updated {
        let Some(updated_node) = updated_node else {
            // Absence only travels to replicas that have never heard of the soul.
            if !existing.contains_key(soul) {
                changes.insert(soul.clone(), None);
            }
            continue;
        };

        let existing_node = existing.get(soul).and_then(Option::as_ref);
        if let Some(node) = diff_node(soul, updated_node, existing_node, max_state, opts) {
            changes.insert(soul.clone(), Some(node));
        }
    }

    (!changes.is_empty()).then_some(changes)
}

fn diff_node(
    soul: &str,
    updated: &Node,
    existing: Option<&Node>,
    max_state: State,
    opts: &DiffOptions,
) -> Option<Node> {
    let mut update = Node::new(soul);

    for (key, &state) in &updated.meta.state {
        let Some(value) = updated.fields.get(key) else {
            continue;
        };
        if state > max_state {
            continue;
        }

        if let Some(existing) = existing
            && let Some(existing_state) = existing.state_of(key)
        {
            if existing_state > state {
                continue;
            }
            if existing_state == state
                && let Some(existing_value) = existing.get(key)
                && (opts.lexical)(value) <= (opts.lexical)(existing_value)
            {
                continue;
            }
        }

        update.meta.state.insert(key.clone(), state);
        update.fields.insert(key.clone(), value.clone());
    }

    (!update.is_empty()).then_some(update)
}

/// Apply a pre-filtered diff node onto `existing`, mutating it.
pub fn merge_node_in_place(existing: &mut Node, diff: &Node) {
    if existing.meta.soul.is_empty() {
        existing.meta.soul = diff.meta.soul.clone();
    }
    for (key, &state) in &diff.meta.state {
        if let Some(value) = diff.fields.get(key) {
            existing.fields.insert(key.clone(), value.clone());
            existing.meta.state.insert(key.clone(), state);
        }
    }
}

/// Copying variant of [`merge_node_in_place`]; inputs are left untouched.
pub fn merge_node(existing: Option<&Node>, diff: Option<&Node>) -> Option<Node> {
    match (existing, diff) {
        (Some(existing), Some(diff)) => {
            let mut merged = existing.clone();
            merge_node_in_place(&mut merged, diff);
            Some(merged)
        }
        (Some(existing), None) => Some(existing.clone()),
        (None, diff) => diff.cloned(),
    }
}

/// Merge every soul of `diff` into `existing` in place.
pub fn merge_graph(existing: &mut GraphData, diff: &GraphData) {
    for (soul, diff_node) in diff {
        match existing.get_mut(soul) {
            Some(Some(node)) => {
                if let Some(diff_node) = diff_node {
                    merge_node_in_place(node, diff_node);
                }
            }
            Some(slot) => {
                if diff_node.is_some() {
                    *slot = diff_node.clone();
                }
            }
            None => {
                existing.insert(soul.clone(), diff_node.clone());
            }
        }
    }
}

/// Copying variant of [`merge_graph`].
pub fn merged_graph(existing: &GraphData, diff: &GraphData) -> GraphData {
    let mut merged = existing.clone();
    merge_graph(&mut merged, diff);
    merged
}

/// Stamp `state` on every field that carries none and fill in missing souls.
pub fn add_missing_state(graph: &mut GraphData, state: State) {
    for (soul, node) in graph.iter_mut() {
        let Some(node) = node else { continue };
        if node.meta.soul.is_empty() {
            node.meta.soul = soul.clone();
        }
        for key in node.fields.keys() {
            node.meta.state.entry(key.clone()).or_insert(state);
        }
    }
}
