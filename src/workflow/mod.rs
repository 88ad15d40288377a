//! Workflow structure: nodes, typed links, settings, and run state.
//!
//! Nodes and triggers share one insertion-ordered collection; `is_trigger`
//! distinguishes them. Links are indexed twice — by source for traversal and
//! by target for input assembly — and the two indexes stay consistent.

pub mod serialize;

use crate::data::{DataRecord, NodeOutput};
use crate::error::{FlowError, FlowResult};
use crate::node::{FlowNode, LinkType};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Run state of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Not executing
    #[default]
    Idle,
    /// An execution is in flight
    Running,
    /// The last execution finished successfully
    Completed,
    /// The last execution failed
    Failed,
}

/// A directed edge from a source output port to a target input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Name of the node producing the data
    pub source_node: String,
    /// Output port on the source
    pub source_output: String,
    /// Name of the node consuming the data
    pub target_node: String,
    /// Input port on the target
    pub target_input: String,
    /// Link interpretation
    #[serde(default)]
    pub link_type: LinkType,
}

impl Link {
    /// Create a standard link
    pub fn new<A, B, C, D>(source_node: A, source_output: B, target_node: C, target_input: D) -> Self
    where
        A: Into<String>,
        B: Into<String>,
        C: Into<String>,
        D: Into<String>,
    {
        Self {
            source_node: source_node.into(),
            source_output: source_output.into(),
            target_node: target_node.into(),
            target_input: target_input.into(),
            link_type: LinkType::Standard,
        }
    }
}

/// Enumerated workflow options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Dispatch independent nodes concurrently
    pub enable_parallel_execution: bool,
    /// Cap on concurrent node tasks; 0 means unlimited
    pub max_parallel_executions: usize,
    /// IANA timezone name for schedule-driven consumers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Error handling mode hint ("stop", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<String>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            enable_parallel_execution: true,
            max_parallel_executions: 0,
            timezone: None,
            error_handling: None,
        }
    }
}

/// A graph of nodes wired by typed links, plus run state
#[derive(Debug)]
pub struct Workflow {
    id: String,
    name: Option<String>,
    nodes: IndexMap<String, Arc<FlowNode>>,
    links_by_source: HashMap<String, Vec<Link>>,
    links_by_target: HashMap<String, Vec<Link>>,
    settings: WorkflowSettings,
    static_data: Mutex<DataRecord>,
    mock_data: Mutex<HashMap<String, NodeOutput>>,
    state: Mutex<WorkflowState>,
}

impl Workflow {
    /// Create an empty workflow
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes: IndexMap::new(),
            links_by_source: HashMap::new(),
            links_by_target: HashMap::new(),
            settings: WorkflowSettings::default(),
            static_data: Mutex::new(DataRecord::new()),
            mock_data: Mutex::new(HashMap::new()),
            state: Mutex::new(WorkflowState::Idle),
        }
    }

    /// Set the display name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name, if set
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Workflow settings
    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Current run state
    pub fn state(&self) -> WorkflowState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WorkflowState) {
        *self.state.lock() = state;
    }

    /// Atomically claim the workflow for execution.
    ///
    /// Returns the previous state so a failed admission step can restore it;
    /// a workflow already Running is rejected.
    pub(crate) fn begin_execution(&self) -> FlowResult<WorkflowState> {
        let mut state = self.state.lock();
        if *state == WorkflowState::Running {
            return Err(FlowError::AlreadyRunning {
                workflow_id: self.id.clone(),
            });
        }
        let previous = *state;
        *state = WorkflowState::Running;
        Ok(previous)
    }

    /// Add a node; names must be unique within the workflow
    pub fn add_node(&mut self, node: FlowNode) -> FlowResult<()> {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(FlowError::structure(format!(
                "node '{name}' already exists in workflow '{}'",
                self.id
            )));
        }
        self.nodes.insert(name, Arc::new(node));
        Ok(())
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&Arc<FlowNode>> {
        self.nodes.get(name)
    }

    /// Node names in insertion order
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Arc<FlowNode>)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Wire a source output port to a target input port.
    ///
    /// Both endpoints must exist and the ports' `data_type` tags must match
    /// exactly. The source- and target-side indexes are updated together.
    pub fn add_link(&mut self, link: Link) -> FlowResult<()> {
        let source = self.nodes.get(&link.source_node).ok_or_else(|| {
            FlowError::structure(format!("unknown source node '{}'", link.source_node))
        })?;
        let target = self.nodes.get(&link.target_node).ok_or_else(|| {
            FlowError::structure(format!("unknown target node '{}'", link.target_node))
        })?;

        let output = source.output_port(&link.source_output).ok_or_else(|| {
            FlowError::structure(format!(
                "node '{}' has no output port '{}'",
                link.source_node, link.source_output
            ))
        })?;
        let input = target.input_port(&link.target_input).ok_or_else(|| {
            FlowError::structure(format!(
                "node '{}' has no input port '{}'",
                link.target_node, link.target_input
            ))
        })?;

        if output.data_type != input.data_type {
            return Err(FlowError::structure(format!(
                "type mismatch linking {}.{} ({}) -> {}.{} ({})",
                link.source_node,
                link.source_output,
                output.data_type,
                link.target_node,
                link.target_input,
                input.data_type
            )));
        }

        self.links_by_source
            .entry(link.source_node.clone())
            .or_default()
            .push(link.clone());
        self.links_by_target
            .entry(link.target_node.clone())
            .or_default()
            .push(link);
        Ok(())
    }

    /// Links leaving the given node
    pub fn links_from(&self, node: &str) -> &[Link] {
        self.links_by_source
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Links entering the given node
    pub fn links_to(&self, node: &str) -> &[Link] {
        self.links_by_target
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The source-side link index
    pub fn links_by_source(&self) -> &HashMap<String, Vec<Link>> {
        &self.links_by_source
    }

    /// The target-side link index
    pub fn links_by_target(&self) -> &HashMap<String, Vec<Link>> {
        &self.links_by_target
    }

    /// All links, via the source index
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links_by_source.values().flatten()
    }

    /// Copy of the workflow-scoped static data
    pub fn static_data(&self) -> DataRecord {
        self.static_data.lock().clone()
    }

    /// Set one static data value
    pub fn set_static_value<K: Into<String>>(&self, key: K, value: serde_json::Value) {
        self.static_data.lock().insert(key.into(), value);
    }

    pub(crate) fn replace_static_data(&self, data: DataRecord) {
        *self.static_data.lock() = data;
    }

    /// Mocked output for a node, if configured
    pub fn mock_data(&self, node: &str) -> Option<NodeOutput> {
        self.mock_data.lock().get(node).cloned()
    }

    /// Short-circuit a node with a fixed output for deterministic tests
    pub fn set_mock_data<N: Into<String>>(&self, node: N, output: NodeOutput) {
        self.mock_data.lock().insert(node.into(), output);
    }

    pub(crate) fn all_mock_data(&self) -> HashMap<String, NodeOutput> {
        self.mock_data.lock().clone()
    }

    /// Reset every non-trigger node to Idle and clear the run state.
    ///
    /// Trigger state and buffered output are left untouched so the data that
    /// seeded the last run can seed the next one. Resetting twice is the
    /// same as resetting once.
    pub fn reset(&self) {
        self.reset_nodes();
        self.set_state(WorkflowState::Idle);
    }

    /// Reset non-trigger nodes without touching the workflow state
    pub(crate) fn reset_nodes(&self) {
        for node in self.nodes.values() {
            if !node.properties().is_trigger {
                node.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{NodeOutput, PortData};
    use crate::error::FlowResult;
    use crate::node::{NodeState, Process, ProcessContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct Passthrough;

    #[async_trait]
    impl Process for Passthrough {
        fn node_type(&self) -> &'static str {
            "test.passthrough"
        }

        async fn process(&self, ctx: ProcessContext) -> FlowResult<NodeOutput> {
            let mut output = NodeOutput::new();
            if let Some(data) = ctx.input.get("input") {
                output.insert("output".to_string(), data.clone());
            }
            Ok(output)
        }
    }

    fn plain_node(name: &str) -> FlowNode {
        FlowNode::builder(name)
            .input("input", "record")
            .output("output", "record")
            .behavior(Passthrough)
            .build()
            .unwrap()
    }

    fn trigger_node(name: &str) -> FlowNode {
        FlowNode::builder(name)
            .trigger(true)
            .output("output", "record")
            .behavior(Passthrough)
            .build()
            .unwrap()
    }

    fn typed_node(name: &str, in_type: &str, out_type: &str) -> FlowNode {
        FlowNode::builder(name)
            .input("input", in_type)
            .output("output", out_type)
            .behavior(Passthrough)
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let mut workflow = Workflow::new("wf");
        workflow.add_node(plain_node("a")).unwrap();
        assert!(matches!(
            workflow.add_node(plain_node("a")),
            Err(FlowError::Structure(_))
        ));
    }

    #[test]
    fn test_link_requires_matching_data_types() {
        let mut workflow = Workflow::new("wf");
        workflow.add_node(typed_node("a", "record", "text")).unwrap();
        workflow.add_node(typed_node("b", "record", "record")).unwrap();

        let err = workflow
            .add_link(Link::new("a", "output", "b", "input"))
            .unwrap_err();
        assert!(err.to_string().contains("type mismatch"));

        workflow.add_node(typed_node("c", "text", "text")).unwrap();
        workflow
            .add_link(Link::new("a", "output", "c", "input"))
            .unwrap();
    }

    #[test]
    fn test_link_rejects_unknown_endpoints() {
        let mut workflow = Workflow::new("wf");
        workflow.add_node(plain_node("a")).unwrap();

        assert!(workflow
            .add_link(Link::new("a", "output", "ghost", "input"))
            .is_err());
        assert!(workflow
            .add_link(Link::new("a", "missing_port", "a", "input"))
            .is_err());
    }

    #[test]
    fn test_link_indexes_stay_consistent() {
        let mut workflow = Workflow::new("wf");
        workflow.add_node(plain_node("a")).unwrap();
        workflow.add_node(plain_node("b")).unwrap();
        workflow
            .add_link(Link::new("a", "output", "b", "input"))
            .unwrap();

        assert_eq!(workflow.links_from("a").len(), 1);
        assert_eq!(workflow.links_to("b").len(), 1);
        assert_eq!(workflow.links_from("a")[0], workflow.links_to("b")[0]);

        // Every source-index entry names an existing target node.
        for link in workflow.links() {
            assert!(workflow.node(&link.target_node).is_some());
        }
    }

    #[test]
    fn test_reset_preserves_trigger_state() {
        let mut workflow = Workflow::new("wf");
        workflow.add_node(trigger_node("t")).unwrap();
        workflow.add_node(plain_node("a")).unwrap();

        let trigger = workflow.node("t").unwrap().clone();
        let mut output = NodeOutput::new();
        output.insert(
            "output".to_string(),
            PortData::Single(crate::data::into_record(json!({"seed": 1}))),
        );
        trigger.seed_output(output).unwrap();

        let plain = workflow.node("a").unwrap().clone();
        plain.seed_output(NodeOutput::new()).unwrap();

        workflow.reset();
        workflow.reset();

        assert_eq!(trigger.state(), NodeState::Completed);
        assert!(trigger.get_result("output").is_some());
        assert_eq!(plain.state(), NodeState::Idle);
        assert_eq!(workflow.state(), WorkflowState::Idle);
    }

    #[test]
    fn test_begin_execution_is_exclusive() {
        let workflow = Workflow::new("wf");
        let previous = workflow.begin_execution().unwrap();
        assert_eq!(previous, WorkflowState::Idle);
        assert!(matches!(
            workflow.begin_execution(),
            Err(FlowError::AlreadyRunning { .. })
        ));

        workflow.set_state(WorkflowState::Completed);
        assert_eq!(workflow.begin_execution().unwrap(), WorkflowState::Completed);
    }
}
