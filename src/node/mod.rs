//! Node runtime: lifecycle state machine, ports, configuration, results.
//!
//! A concrete node type supplies only a [`Process`] implementation; the
//! surrounding machinery — port registration, schema-validated configuration,
//! the state machine, result buffering — lives in [`FlowNode`] and is shared
//! by every node kind, triggers included.

pub mod schema;

use crate::data::{DataRecord, ExecutionState, NodeInput, NodeOutput, PortData};
use crate::error::{FlowError, FlowResult};
use crate::retry::RetryDelay;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle states of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Ready to run
    #[default]
    Idle,
    /// `process` is in flight
    Running,
    /// Last run finished successfully; results are buffered
    Completed,
    /// Last run raised an error
    Failed,
}

impl NodeState {
    /// The legal transition table.
    ///
    /// ```text
    /// Idle      -> Running
    /// Running   -> Completed | Failed
    /// Completed -> Idle
    /// Failed    -> Idle
    /// ```
    pub fn can_transition_to(self, to: NodeState) -> bool {
        matches!(
            (self, to),
            (NodeState::Idle, NodeState::Running)
                | (NodeState::Running, NodeState::Completed)
                | (NodeState::Running, NodeState::Failed)
                | (NodeState::Completed, NodeState::Idle)
                | (NodeState::Failed, NodeState::Idle)
        )
    }
}

/// How a link is interpreted by consumers of the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkType {
    /// Ordinary data flow
    #[default]
    Standard,
    /// Secondary flow (error branches, fallbacks)
    Alternative,
}

/// A named, typed connection point on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Port name, unique within the node's input or output set
    pub name: String,
    /// Type tag; links require exact equality on both ends
    pub data_type: String,
    /// Link interpretation
    #[serde(default)]
    pub link_type: LinkType,
}

impl Port {
    /// Create a standard port
    pub fn new<N: Into<String>, D: Into<String>>(name: N, data_type: D) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            link_type: LinkType::Standard,
        }
    }
}

/// Immutable identity and scheduling options of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProperties {
    /// Opaque stable identifier
    pub id: String,
    /// Name, unique within the workflow; the reference key for links and state
    pub name: String,
    /// Type string; fixed by the behavior on construction, authoritative on import
    pub node_type: String,
    /// Node type version
    pub version: u32,
    /// UI hint only
    pub position: (f64, f64),
    /// Triggers do not await inputs and are seeded via `fire`
    #[serde(default)]
    pub is_trigger: bool,
    /// Disabled nodes are skipped but count as executed
    #[serde(default)]
    pub disabled: bool,
    /// Whether failures are retried
    #[serde(default)]
    pub retry_on_fail: bool,
    /// Retries after the first attempt; total attempts = 1 + max_retries
    #[serde(default)]
    pub max_retries: u32,
    /// Fixed delay or exponential backoff parameters; absent means fixed 1000 ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<RetryDelay>,
    /// Treat terminal failure as an empty-output completion
    #[serde(default)]
    pub continue_on_fail: bool,
}

/// Context handed to [`Process::process`]
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    /// Data collected on the node's input ports
    pub input: NodeInput,
    /// Snapshot of every upstream node's completed output, keyed by node name
    pub state: ExecutionState,
    /// The node's configuration with secret references resolved
    pub config: DataRecord,
    /// Workflow-scoped static data
    pub static_data: DataRecord,
    /// Cancelled when the execution is aborted; long-running nodes should observe it
    pub cancellation: CancellationToken,
}

/// Behavior supplied by a concrete node type
#[async_trait]
pub trait Process: Send + Sync {
    /// The type string this behavior registers under
    fn node_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Transform collected inputs into outputs.
    ///
    /// Implementations own their side-effects and must tolerate re-runs
    /// under the retry policy.
    async fn process(&self, ctx: ProcessContext) -> FlowResult<NodeOutput>;
}

/// Mutable half of a node, guarded by one lock
#[derive(Debug, Default)]
struct NodeRuntime {
    state: NodeState,
    config: DataRecord,
    results: NodeOutput,
    last_error: Option<String>,
}

/// A workflow node: identity, ports, configuration, and buffered results
/// around a boxed [`Process`] behavior.
pub struct FlowNode {
    properties: NodeProperties,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    annotation: Option<String>,
    config_schema: Option<serde_json::Value>,
    behavior: Box<dyn Process>,
    runtime: Mutex<NodeRuntime>,
}

impl std::fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowNode")
            .field("name", &self.properties.name)
            .field("node_type", &self.properties.node_type)
            .field("state", &self.state())
            .finish()
    }
}

impl FlowNode {
    /// Start building a node with the given name
    pub fn builder<N: Into<String>>(name: N) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    /// Node identity and options
    pub fn properties(&self) -> &NodeProperties {
        &self.properties
    }

    /// Node name (reference key within the workflow)
    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// Declared input ports
    pub fn input_ports(&self) -> &[Port] {
        &self.inputs
    }

    /// Declared output ports
    pub fn output_ports(&self) -> &[Port] {
        &self.outputs
    }

    /// Look up an input port by name
    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Look up an output port by name
    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// The node's configuration schema, if the behavior declared one
    pub fn config_schema(&self) -> Option<&serde_json::Value> {
        self.config_schema.as_ref()
    }

    /// Free-form note carried through serialization
    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.runtime.lock().state
    }

    /// Message of the last failed run, if any
    pub fn last_error(&self) -> Option<String> {
        self.runtime.lock().last_error.clone()
    }

    /// Copy of the accumulated configuration
    pub fn config(&self) -> DataRecord {
        self.runtime.lock().config.clone()
    }

    /// Validate `config` against the node's schema and merge it in.
    ///
    /// Repeated calls accumulate: later keys override earlier ones. On schema
    /// violation nothing is merged and the error names the JSON-Pointer path
    /// of the first failing value.
    pub fn setup(&self, config: &serde_json::Value) -> FlowResult<()> {
        let incoming = config.as_object().ok_or_else(|| {
            FlowError::configuration("", "configuration must be a JSON object")
        })?;

        if let Some(node_schema) = &self.config_schema {
            // Validate the merged view so multi-call refinement can satisfy
            // required properties incrementally.
            let mut merged = self.runtime.lock().config.clone();
            for (key, value) in incoming {
                merged.insert(key.clone(), value.clone());
            }
            schema::validate_config(node_schema, &serde_json::Value::Object(merged))?;
        }

        let mut rt = self.runtime.lock();
        for (key, value) in incoming {
            rt.config.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Transition the node through one legal edge of the state machine
    pub fn set_state(&self, to: NodeState) -> FlowResult<()> {
        let mut rt = self.runtime.lock();
        let from = rt.state;
        if !from.can_transition_to(to) {
            return Err(FlowError::IllegalState {
                node: self.properties.name.clone(),
                from,
                to,
            });
        }
        rt.state = to;
        Ok(())
    }

    /// Engine-facing entry: run `process` once.
    ///
    /// Requires Idle. Transitions Idle -> Running, invokes the behavior, and
    /// on success buffers the output and completes; on failure records the
    /// error, fails, and re-raises.
    pub async fn run(&self, ctx: ProcessContext) -> FlowResult<NodeOutput> {
        {
            let mut rt = self.runtime.lock();
            let from = rt.state;
            if from != NodeState::Idle {
                return Err(FlowError::IllegalState {
                    node: self.properties.name.clone(),
                    from,
                    to: NodeState::Running,
                });
            }
            rt.state = NodeState::Running;
            rt.last_error = None;
        }

        match self.behavior.process(ctx).await {
            Ok(output) => {
                let mut rt = self.runtime.lock();
                rt.results = output.clone();
                rt.state = NodeState::Completed;
                Ok(output)
            }
            Err(error) => {
                let mut rt = self.runtime.lock();
                rt.last_error = Some(error.to_string());
                rt.state = NodeState::Failed;
                Err(error)
            }
        }
    }

    /// Complete the node with a supplied output, bypassing `process`.
    ///
    /// Used for mock-data short-circuits; the state machine still walks
    /// Idle -> Running -> Completed so observers see a normal lifecycle.
    pub fn run_mocked(&self, output: NodeOutput) -> FlowResult<NodeOutput> {
        let mut rt = self.runtime.lock();
        let from = rt.state;
        if from != NodeState::Idle {
            return Err(FlowError::IllegalState {
                node: self.properties.name.clone(),
                from,
                to: NodeState::Running,
            });
        }
        rt.state = NodeState::Running;
        rt.last_error = None;
        rt.results = output.clone();
        rt.state = NodeState::Completed;
        Ok(output)
    }

    /// Store an externally produced output and mark the node Completed.
    ///
    /// Triggers are seeded this way by `fire`; a previously Completed or
    /// Failed node is first returned to Idle.
    pub fn seed_output(&self, output: NodeOutput) -> FlowResult<()> {
        let mut rt = self.runtime.lock();
        match rt.state {
            NodeState::Running => {
                return Err(FlowError::IllegalState {
                    node: self.properties.name.clone(),
                    from: NodeState::Running,
                    to: NodeState::Idle,
                })
            }
            NodeState::Completed | NodeState::Failed => rt.state = NodeState::Idle,
            NodeState::Idle => {}
        }
        rt.state = NodeState::Running;
        rt.results = output;
        rt.last_error = None;
        rt.state = NodeState::Completed;
        Ok(())
    }

    /// Clear results and error and return to Idle. Configuration survives.
    pub fn reset(&self) {
        let mut rt = self.runtime.lock();
        rt.results.clear();
        rt.last_error = None;
        rt.state = NodeState::Idle;
    }

    /// Return a settled node to Idle without clearing internals.
    ///
    /// The retry loop uses this so nodes can carry attempt counters across
    /// attempts. No-op while Idle or Running.
    pub fn stop(&self) {
        let mut rt = self.runtime.lock();
        if matches!(rt.state, NodeState::Completed | NodeState::Failed) {
            rt.state = NodeState::Idle;
        }
    }

    /// Buffered result for one output port
    pub fn get_result(&self, port: &str) -> Option<PortData> {
        self.runtime.lock().results.get(port).cloned()
    }

    /// Copy of all buffered results
    pub fn get_all_results(&self) -> NodeOutput {
        self.runtime.lock().results.clone()
    }

    /// Replace identity, ports, and type from a serialized form.
    ///
    /// The stored `node_type` is authoritative here, unlike construction
    /// where the behavior's declared type wins.
    pub(crate) fn apply_import(
        &mut self,
        properties: NodeProperties,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        annotation: Option<String>,
    ) -> FlowResult<()> {
        check_unique_ports(&properties.name, &inputs, "input")?;
        check_unique_ports(&properties.name, &outputs, "output")?;
        self.properties = properties;
        self.inputs = inputs;
        self.outputs = outputs;
        self.annotation = annotation;
        Ok(())
    }
}

fn check_unique_ports(node: &str, ports: &[Port], side: &str) -> FlowResult<()> {
    for (i, port) in ports.iter().enumerate() {
        if ports[..i].iter().any(|p| p.name == port.name) {
            return Err(FlowError::structure(format!(
                "duplicate {side} port '{}' on node '{node}'",
                port.name
            )));
        }
    }
    Ok(())
}

/// Builder for [`FlowNode`]
pub struct NodeBuilder {
    id: Option<String>,
    name: String,
    version: u32,
    position: (f64, f64),
    is_trigger: bool,
    disabled: bool,
    retry_on_fail: bool,
    max_retries: u32,
    retry_delay: Option<RetryDelay>,
    continue_on_fail: bool,
    annotation: Option<String>,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    config_schema: Option<serde_json::Value>,
    behavior: Option<Box<dyn Process>>,
}

impl NodeBuilder {
    fn new<N: Into<String>>(name: N) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: 1,
            position: (0.0, 0.0),
            is_trigger: false,
            disabled: false,
            retry_on_fail: false,
            max_retries: 0,
            retry_delay: None,
            continue_on_fail: false,
            annotation: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            config_schema: None,
            behavior: None,
        }
    }

    /// Set a stable id; a UUID is generated otherwise
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the node type version
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the UI position hint
    pub fn position(mut self, x: f64, y: f64) -> Self {
        self.position = (x, y);
        self
    }

    /// Mark the node as a trigger
    pub fn trigger(mut self, is_trigger: bool) -> Self {
        self.is_trigger = is_trigger;
        self
    }

    /// Disable the node (skipped but counted as executed)
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Enable retry with the given number of retries after the first attempt
    pub fn retry_on_fail(mut self, max_retries: u32) -> Self {
        self.retry_on_fail = true;
        self.max_retries = max_retries;
        self
    }

    /// Select the delay between retry attempts
    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Treat terminal failure as empty-output completion
    pub fn continue_on_fail(mut self, continue_on_fail: bool) -> Self {
        self.continue_on_fail = continue_on_fail;
        self
    }

    /// Attach a free-form annotation
    pub fn annotation<S: Into<String>>(mut self, annotation: S) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Declare an input port
    pub fn input<N: Into<String>, D: Into<String>>(mut self, name: N, data_type: D) -> Self {
        self.inputs.push(Port::new(name, data_type));
        self
    }

    /// Declare an input port with an explicit link type
    pub fn input_with<N: Into<String>, D: Into<String>>(
        mut self,
        name: N,
        data_type: D,
        link_type: LinkType,
    ) -> Self {
        let mut port = Port::new(name, data_type);
        port.link_type = link_type;
        self.inputs.push(port);
        self
    }

    /// Declare an output port
    pub fn output<N: Into<String>, D: Into<String>>(mut self, name: N, data_type: D) -> Self {
        self.outputs.push(Port::new(name, data_type));
        self
    }

    /// Declare an output port with an explicit link type
    pub fn output_with<N: Into<String>, D: Into<String>>(
        mut self,
        name: N,
        data_type: D,
        link_type: LinkType,
    ) -> Self {
        let mut port = Port::new(name, data_type);
        port.link_type = link_type;
        self.outputs.push(port);
        self
    }

    /// Attach a JSON Schema for `setup` validation
    pub fn config_schema(mut self, schema: serde_json::Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Supply the node's behavior
    pub fn behavior<P: Process + 'static>(mut self, behavior: P) -> Self {
        self.behavior = Some(Box::new(behavior));
        self
    }

    /// Build the node.
    ///
    /// The node type is taken from the behavior's declaration; port names
    /// must be unique within each side.
    pub fn build(self) -> FlowResult<FlowNode> {
        let behavior = self
            .behavior
            .ok_or_else(|| FlowError::structure(format!("node '{}' has no behavior", self.name)))?;

        check_unique_ports(&self.name, &self.inputs, "input")?;
        check_unique_ports(&self.name, &self.outputs, "output")?;

        let properties = NodeProperties {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            node_type: behavior.node_type().to_string(),
            version: self.version,
            position: self.position,
            is_trigger: self.is_trigger,
            disabled: self.disabled,
            retry_on_fail: self.retry_on_fail,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            continue_on_fail: self.continue_on_fail,
        };

        Ok(FlowNode {
            properties,
            inputs: self.inputs,
            outputs: self.outputs,
            annotation: self.annotation,
            config_schema: self.config_schema,
            behavior,
            runtime: Mutex::new(NodeRuntime::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Process for Echo {
        fn node_type(&self) -> &'static str {
            "test.echo"
        }

        async fn process(&self, ctx: ProcessContext) -> FlowResult<NodeOutput> {
            let mut output = NodeOutput::new();
            if let Some(data) = ctx.input.get("input") {
                output.insert("output".to_string(), data.clone());
            }
            Ok(output)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Process for AlwaysFails {
        fn node_type(&self) -> &'static str {
            "test.always_fails"
        }

        async fn process(&self, _ctx: ProcessContext) -> FlowResult<NodeOutput> {
            Err(FlowError::process("always_fails", "boom"))
        }
    }

    fn echo_node() -> FlowNode {
        FlowNode::builder("echo")
            .input("input", "record")
            .output("output", "record")
            .behavior(Echo)
            .build()
            .unwrap()
    }

    #[test]
    fn test_node_type_comes_from_behavior() {
        let node = echo_node();
        assert_eq!(node.properties().node_type, "test.echo");
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let result = FlowNode::builder("dup")
            .input("a", "record")
            .input("a", "record")
            .behavior(Echo)
            .build();
        assert!(matches!(result, Err(FlowError::Structure(_))));
    }

    #[test]
    fn test_transition_table() {
        let node = echo_node();
        assert_eq!(node.state(), NodeState::Idle);

        node.set_state(NodeState::Running).unwrap();
        node.set_state(NodeState::Completed).unwrap();
        node.set_state(NodeState::Idle).unwrap();

        // Idle -> Completed is not an edge.
        let err = node.set_state(NodeState::Completed).unwrap_err();
        assert!(matches!(
            err,
            FlowError::IllegalState {
                from: NodeState::Idle,
                to: NodeState::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let node = echo_node();
        let mut input = NodeInput::new();
        input.insert(
            "input".to_string(),
            PortData::Single(crate::data::into_record(json!({"v": 1}))),
        );
        let ctx = ProcessContext {
            input,
            ..Default::default()
        };

        let output = node.run(ctx).await.unwrap();
        assert_eq!(node.state(), NodeState::Completed);
        assert_eq!(node.get_result("output"), output.get("output").cloned());

        // A completed node cannot run again without stop/reset.
        let err = node.run(ProcessContext::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_run_failure_records_error() {
        let node = FlowNode::builder("boom").behavior(AlwaysFails).build().unwrap();
        let err = node.run(ProcessContext::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::Process { .. }));
        assert_eq!(node.state(), NodeState::Failed);
        assert!(node.last_error().unwrap().contains("boom"));

        // stop returns to Idle without clearing the error buffer.
        node.stop();
        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.last_error().is_some());

        // reset clears it.
        node.reset();
        assert!(node.last_error().is_none());
    }

    #[test]
    fn test_setup_merges_and_validates() {
        let node = FlowNode::builder("configured")
            .config_schema(json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string", "enum": ["GET", "POST"]}
                },
                "required": ["url"],
                "additionalProperties": false
            }))
            .behavior(Echo)
            .build()
            .unwrap();

        node.setup(&json!({"url": "https://example.com"})).unwrap();
        node.setup(&json!({"url": "https://example.com", "method": "POST"}))
            .unwrap();
        assert_eq!(node.config()["method"], json!("POST"));

        let err = node
            .setup(&json!({"url": "https://example.com", "method": "DELETE"}))
            .unwrap_err();
        match err {
            FlowError::Configuration { path, .. } => assert!(path.contains("method")),
            other => panic!("unexpected error: {other:?}"),
        }

        // Failed setup merged nothing.
        assert_eq!(node.config()["method"], json!("POST"));
    }

    #[test]
    fn test_setup_rejects_additional_properties() {
        let node = FlowNode::builder("strict")
            .config_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}},
                "additionalProperties": false
            }))
            .behavior(Echo)
            .build()
            .unwrap();

        assert!(node.setup(&json!({"a": 1})).is_ok());
        assert!(node.setup(&json!({"b": 2})).is_err());
    }

    #[test]
    fn test_seed_output_reaches_completed() {
        let node = echo_node();
        let mut output = NodeOutput::new();
        output.insert(
            "output".to_string(),
            PortData::Single(crate::data::into_record(json!({"seeded": true}))),
        );
        node.seed_output(output).unwrap();
        assert_eq!(node.state(), NodeState::Completed);
        assert!(node.get_result("output").is_some());

        // Re-seeding from Completed is allowed.
        node.seed_output(NodeOutput::new()).unwrap();
        assert_eq!(node.state(), NodeState::Completed);
    }
}
