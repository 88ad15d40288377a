//! Centralized execution state: per-node output snapshots and run metadata.
//!
//! One [`StateManager`] lives inside the engine for the engine's lifetime.
//! It is cleared at the start of each execution and exported through the
//! persistence hook after every node completion.

use crate::data::{ExecutionState, NodeOutput};
use crate::node::NodeState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timing and status of one node within the current execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionMetadata {
    /// Epoch milliseconds when the node started
    pub start_time: i64,
    /// Epoch milliseconds when the node settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Derived `end_time - start_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Running while in flight, then Completed or Failed
    pub status: NodeState,
}

/// By-value snapshot of the full execution state, for persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Node name to last completed output
    pub state: ExecutionState,
    /// Node name to run metadata
    pub metadata: HashMap<String, NodeExecutionMetadata>,
}

/// Ledger of per-node outputs and metadata for the current execution
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    state: ExecutionState,
    metadata: HashMap<String, NodeExecutionMetadata>,
}

impl StateManager {
    /// Create an empty state manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a node started running now
    pub fn record_node_start<N: Into<String>>(&mut self, name: N) {
        self.metadata.insert(
            name.into(),
            NodeExecutionMetadata {
                start_time: now_ms(),
                end_time: None,
                duration_ms: None,
                status: NodeState::Running,
            },
        );
    }

    /// Record that a node settled with the given status.
    ///
    /// A missing start record is backfilled with the end time so the entry
    /// is still well-formed.
    pub fn record_node_end<N: Into<String>>(&mut self, name: N, status: NodeState) {
        let end = now_ms();
        let entry = self
            .metadata
            .entry(name.into())
            .or_insert_with(|| NodeExecutionMetadata {
                start_time: end,
                end_time: None,
                duration_ms: None,
                status,
            });
        entry.end_time = Some(end);
        entry.duration_ms = Some(end - entry.start_time);
        entry.status = status;
    }

    /// Store a node's completed output
    pub fn set_node_state<N: Into<String>>(&mut self, name: N, output: NodeOutput) {
        self.state.insert(name.into(), output);
    }

    /// A node's recorded output, if any
    pub fn get_node_state(&self, name: &str) -> Option<&NodeOutput> {
        self.state.get(name)
    }

    /// A node's run metadata, if any
    pub fn get_node_metadata(&self, name: &str) -> Option<&NodeExecutionMetadata> {
        self.metadata.get(name)
    }

    /// Defensive copy of the full output snapshot
    pub fn get_state(&self) -> ExecutionState {
        self.state.clone()
    }

    /// Empty both the output snapshot and the metadata ledger
    pub fn clear(&mut self) {
        self.state.clear();
        self.metadata.clear();
    }

    /// Export a by-value snapshot for the persistence hook
    pub fn export(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Replace the ledger with a recovered snapshot
    pub fn import(&mut self, snapshot: StateSnapshot) {
        self.state = snapshot.state;
        self.metadata = snapshot.metadata;
    }

    /// Names of nodes whose metadata says Completed
    pub fn completed_nodes(&self) -> Vec<String> {
        self.metadata
            .iter()
            .filter(|(_, m)| m.status == NodeState::Completed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PortData;
    use serde_json::json;

    fn sample_output() -> NodeOutput {
        let mut output = NodeOutput::new();
        output.insert(
            "output".to_string(),
            PortData::Single(crate::data::into_record(json!({"v": 1}))),
        );
        output
    }

    #[test]
    fn test_start_then_end_derives_duration() {
        let mut manager = StateManager::new();
        manager.record_node_start("fetch");
        assert_eq!(
            manager.get_node_metadata("fetch").unwrap().status,
            NodeState::Running
        );

        manager.record_node_end("fetch", NodeState::Completed);
        let meta = manager.get_node_metadata("fetch").unwrap();
        assert_eq!(meta.status, NodeState::Completed);
        let duration = meta.duration_ms.unwrap();
        assert!(duration >= 0);
        assert_eq!(meta.end_time.unwrap() - meta.start_time, duration);
    }

    #[test]
    fn test_completed_nodes_have_state() {
        let mut manager = StateManager::new();
        manager.record_node_start("fetch");
        manager.record_node_end("fetch", NodeState::Completed);
        manager.set_node_state("fetch", sample_output());

        for name in manager.completed_nodes() {
            assert!(manager.get_node_state(&name).is_some());
        }
    }

    #[test]
    fn test_get_state_is_a_copy() {
        let mut manager = StateManager::new();
        manager.set_node_state("fetch", sample_output());

        let mut copy = manager.get_state();
        copy.remove("fetch");
        assert!(manager.get_node_state("fetch").is_some());
    }

    #[test]
    fn test_clear_empties_both_ledgers() {
        let mut manager = StateManager::new();
        manager.record_node_start("a");
        manager.set_node_state("a", sample_output());
        manager.clear();
        assert!(manager.get_node_state("a").is_none());
        assert!(manager.get_node_metadata("a").is_none());
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut manager = StateManager::new();
        manager.record_node_start("a");
        manager.record_node_end("a", NodeState::Completed);
        manager.set_node_state("a", sample_output());

        let snapshot = manager.export();
        let mut restored = StateManager::new();
        restored.import(snapshot.clone());
        assert_eq!(restored.export(), snapshot);
    }
}
