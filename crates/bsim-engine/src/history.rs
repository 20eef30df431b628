//! History Manager - bounded undo/redo of topology snapshots
//!
//! Snapshots hold deep copies of nodes and connections only. Messages and
//! traveling messages are never part of a snapshot.

use std::collections::VecDeque;
use tracing::debug;

use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct History {
    undo_stack: VecDeque<Topology>,
    redo_stack: Vec<Topology>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo_stack: VecDeque::with_capacity(capacity),
            redo_stack: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record the pre-mutation state. Discards redo entries and drops the
    /// oldest snapshot once capacity is reached.
    pub fn save(&mut self, current: &Topology) {
        self.redo_stack.clear();
        self.undo_stack.push_back(current.clone());
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
        debug!(depth = self.undo_stack.len(), "History snapshot saved");
    }

    /// Step back: returns the snapshot to restore, remembering `current` for redo
    pub fn undo(&mut self, current: &Topology) -> Option<Topology> {
        let previous = self.undo_stack.pop_back()?;
        self.redo_stack.push(current.clone());
        Some(previous)
    }

    /// Step forward: returns the snapshot to restore, remembering `current` for undo
    pub fn redo(&mut self, current: &Topology) -> Option<Topology> {
        let next = self.redo_stack.pop()?;
        self.undo_stack.push_back(current.clone());
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
        Some(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}
