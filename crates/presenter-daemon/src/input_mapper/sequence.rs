//! Prefix-sharing sequence tree
//!
//! Configured sequences are merged into a tree whose levels correspond to
//! positions in a sequence. Sequences with a common prefix share the nodes of
//! that prefix, so matching is a walk from the current position to one of
//! its children.
//!
//! ```text
//! level 0      level 1      level 2      level 3
//! BTN_LEFT:1 ─ BTN_LEFT:0 ┬ BTN_LEFT:1 ─ BTN_LEFT:0   (double click)
//!                         └ (action: single click)
//! KEY_NEXT:1 ─ KEY_NEXT:0   (action)
//! ```

use crate::input_mapper::{KeyEvent, MappedAction, Mapping};

/// Result of feeding one key event to the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// No configured sequence starts, or continues, with this event; state is reset
    Miss,
    /// The event extends a prefix of at least one sequence
    Valid,
    /// The event completes a sequence that nothing longer extends; state is reset
    Hit(MappedAction),
    /// The event completes a sequence but longer sequences remain reachable
    AmbiguouslyHit(MappedAction),
}

#[derive(Debug)]
struct Node {
    event: KeyEvent,
    action: Option<MappedAction>,
    children: Vec<usize>,
}

/// Incremental matcher over the configured sequences
#[derive(Debug, Default)]
pub struct SequenceTree {
    nodes: Vec<Node>,
    /// Node ids per sequence position; level 0 holds the roots
    levels: Vec<Vec<usize>>,
    position: Option<usize>,
}

impl SequenceTree {
    /// Build a tree from resolved mappings
    ///
    /// If two mappings have the same sequence, the later one wins.
    pub fn new(mappings: &[Mapping]) -> Self {
        let mut tree = Self::default();
        for mapping in mappings {
            tree.insert(mapping);
        }
        tree
    }

    fn insert(&mut self, mapping: &Mapping) {
        let mut parent: Option<usize> = None;
        for (depth, event) in mapping.sequence.iter().enumerate() {
            let existing = self
                .candidates(parent)
                .iter()
                .copied()
                .find(|&id| self.nodes[id].event == *event);
            let id = match existing {
                Some(id) => id,
                None => self.add_node(parent, depth, event.clone()),
            };
            parent = Some(id);
        }

        if let Some(id) = parent {
            let node = &mut self.nodes[id];
            if node.action.is_some() {
                tracing::warn!(
                    "Sequence {} is configured more than once; using the last action",
                    describe(&mapping.sequence)
                );
            }
            node.action = Some(mapping.action.clone());
        }
    }

    fn add_node(&mut self, parent: Option<usize>, depth: usize, event: KeyEvent) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            event,
            action: None,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        if self.levels.len() <= depth {
            self.levels.resize_with(depth + 1, Vec::new);
        }
        self.levels[depth].push(id);
        id
    }

    fn candidates(&self, position: Option<usize>) -> &[usize] {
        match position {
            Some(id) => &self.nodes[id].children,
            None => self.levels.first().map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    fn lookup(&self, position: Option<usize>, event: &KeyEvent) -> Option<usize> {
        self.candidates(position)
            .iter()
            .copied()
            .find(|&id| self.nodes[id].event == *event)
    }

    /// Whether `event` extends the partial match in progress
    ///
    /// Returns `false` when no partial match is in progress.
    pub fn continues(&self, event: &KeyEvent) -> bool {
        self.position.is_some() && self.lookup(self.position, event).is_some()
    }

    /// Advance by one key event
    ///
    /// An event that does not continue the partial match abandons it and is
    /// matched again from the start of every sequence.
    pub fn feed(&mut self, event: &KeyEvent) -> MatchResult {
        let next = self
            .lookup(self.position, event)
            .or_else(|| self.position.and_then(|_| self.lookup(None, event)));

        let Some(id) = next else {
            self.position = None;
            return MatchResult::Miss;
        };

        let node = &self.nodes[id];
        match &node.action {
            Some(action) if node.children.is_empty() => {
                let action = action.clone();
                self.position = None;
                MatchResult::Hit(action)
            }
            Some(action) => {
                let action = action.clone();
                self.position = Some(id);
                MatchResult::AmbiguouslyHit(action)
            }
            None => {
                self.position = Some(id);
                MatchResult::Valid
            }
        }
    }

    /// Return to "no position"
    pub fn reset(&mut self) {
        self.position = None;
    }

    /// Whether no partial match is in progress
    pub fn is_idle(&self) -> bool {
        self.position.is_none()
    }

    /// Whether no sequence is configured
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct key events at each sequence position
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }
}

fn describe(sequence: &[KeyEvent]) -> String {
    sequence
        .iter()
        .map(|e| format!("\"{}\"", e))
        .collect::<Vec<_>>()
        .join(" ")
}
