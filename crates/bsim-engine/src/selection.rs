//! Editor selection state and the two-step connect gesture

use bsim_common::{ConnectionId, NodeId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selected_node_id: Option<NodeId>,
    pub selected_connection_id: Option<ConnectionId>,
    /// Multi-selection, in the order nodes were added
    pub selected_node_ids: Vec<NodeId>,
    pub is_connecting: bool,
    pub connecting_from_id: Option<NodeId>,
}

impl Selection {
    /// Single-select a node (or clear with `None`); drops any connection selection
    pub fn select_node(&mut self, id: Option<NodeId>) {
        self.selected_node_ids = id.iter().cloned().collect();
        self.selected_node_id = id;
        self.selected_connection_id = None;
    }

    /// Select a connection; drops any node selection
    pub fn select_connection(&mut self, id: Option<ConnectionId>) {
        self.selected_connection_id = id;
        self.selected_node_id = None;
        self.selected_node_ids.clear();
    }

    /// Replace the multi-selection. The primary selection is the first id.
    pub fn select_multiple(&mut self, ids: Vec<NodeId>) {
        self.selected_node_id = ids.first().cloned();
        self.selected_node_ids = ids;
        self.selected_connection_id = None;
    }

    /// Add a node to the multi-selection, or remove it if already selected
    pub fn toggle(&mut self, id: &str) {
        if let Some(index) = self.selected_node_ids.iter().position(|n| n == id) {
            self.selected_node_ids.remove(index);
        } else {
            self.selected_node_ids.push(id.to_string());
        }
        self.selected_node_id = self.selected_node_ids.first().cloned();
        self.selected_connection_id = None;
    }

    /// Forget a node that no longer exists
    pub fn forget_node(&mut self, id: &str) {
        self.selected_node_ids.retain(|n| n != id);
        if self.selected_node_id.as_deref() == Some(id) {
            self.selected_node_id = self.selected_node_ids.first().cloned();
        }
        if self.connecting_from_id.as_deref() == Some(id) {
            self.cancel_connecting();
        }
    }

    pub fn forget_connection(&mut self, id: &str) {
        if self.selected_connection_id.as_deref() == Some(id) {
            self.selected_connection_id = None;
        }
    }

    pub fn start_connecting(&mut self, from: NodeId) {
        self.is_connecting = true;
        self.connecting_from_id = Some(from);
    }

    /// End the gesture, returning its source if one was pending
    pub fn take_connecting_source(&mut self) -> Option<NodeId> {
        self.is_connecting = false;
        self.connecting_from_id.take()
    }

    pub fn cancel_connecting(&mut self) {
        self.is_connecting = false;
        self.connecting_from_id = None;
    }

    /// Clear node and connection selection, leaving the connect gesture alone
    pub fn clear_selection(&mut self) {
        self.selected_node_id = None;
        self.selected_connection_id = None;
        self.selected_node_ids.clear();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
