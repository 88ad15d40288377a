//! Workflow execution engine.
//!
//! One orchestrator drives the layer loop and owns every write to the
//! execution ledgers; dispatched nodes run in their own tasks and only
//! invoke `process` and return results. A single lock guards the state
//! manager, the engine's execution state, and the pending-task map, which
//! keeps the engine effectively single-writer despite parallel nodes.
//!
//! Suspension points: awaiting an upstream node's task during input
//! collection, the retry backoff sleep, the node's `process` itself, and
//! the persistence hook calls.

use crate::dag::DependencyGraph;
use crate::data::{DataRecord, ExecutionState, NodeInput, NodeOutput, PortData};
use crate::error::{FlowError, FlowResult};
use crate::node::{FlowNode, NodeState, ProcessContext};
use crate::persistence::PersistenceHook;
use crate::retry::RetryPolicy;
use crate::secret::{resolve_secrets, SecretResolver, DEFAULT_MAX_DEPTH};
use crate::state::{NodeExecutionMetadata, StateManager};
use crate::workflow::{Workflow, WorkflowState};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long input collection waits for a missing task registration
const TASK_GRACE: Duration = Duration::from_millis(10);
/// Interval of the bounded polling fallback
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Iterations of the bounded polling fallback
const MAX_POLL_ITERATIONS: usize = 100;

/// Awaitable completion of a dispatched node, cloneable per waiter
type PendingTask = Shared<BoxFuture<'static, ()>>;

/// Ledgers guarded by the engine's single lock
#[derive(Default)]
struct EngineShared {
    state_manager: StateManager,
    execution_state: ExecutionState,
    pending: HashMap<String, PendingTask>,
    executed: HashSet<String>,
}

/// Drives a workflow from a trigger to completion
pub struct Engine {
    workflow: Arc<Workflow>,
    persistence: Option<Arc<dyn PersistenceHook>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    shared: Arc<Mutex<EngineShared>>,
    cancellation: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflow_id", &self.workflow.id())
            .field("state", &self.workflow.state())
            .finish()
    }
}

impl Engine {
    /// Create an engine owning the given workflow
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            persistence: None,
            secrets: None,
            shared: Arc::new(Mutex::new(EngineShared::default())),
            cancellation: Mutex::new(CancellationToken::new()),
        }
    }

    /// Attach a persistence hook
    pub fn with_persistence_hook(mut self, hook: Arc<dyn PersistenceHook>) -> Self {
        self.persistence = Some(hook);
        self
    }

    /// Attach a secret resolver
    pub fn with_secret_resolver(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(resolver);
        self
    }

    /// The workflow this engine drives
    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    /// Current workflow run state
    pub fn workflow_state(&self) -> WorkflowState {
        self.workflow.state()
    }

    /// Copy of the execution ledger
    pub fn state_manager(&self) -> StateManager {
        self.shared.lock().state_manager.clone()
    }

    /// A node's recorded output in the current execution
    pub fn node_state(&self, name: &str) -> Option<NodeOutput> {
        self.shared.lock().state_manager.get_node_state(name).cloned()
    }

    /// A node's run metadata in the current execution
    pub fn node_metadata(&self, name: &str) -> Option<NodeExecutionMetadata> {
        self.shared
            .lock()
            .state_manager
            .get_node_metadata(name)
            .cloned()
    }

    /// Token observing the in-flight execution's cancellation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.lock().clone()
    }

    /// Cancel the in-flight execution.
    ///
    /// Retry backoffs wake immediately; already-completed node outputs stay
    /// in the state manager for inspection.
    pub fn cancel(&self) {
        self.cancellation.lock().cancel();
    }

    /// Execute the workflow starting from the named trigger.
    ///
    /// Re-entrant calls fail with [`FlowError::AlreadyRunning`] without
    /// touching the workflow state; any other failure leaves the workflow
    /// Failed with all state captured so far preserved.
    pub async fn execute(&self, trigger_name: &str) -> FlowResult<()> {
        let previous = self.workflow.begin_execution()?;

        let trigger = match self.admit_trigger(trigger_name) {
            Ok(node) => node,
            Err(error) => {
                self.workflow.set_state(previous);
                return Err(error);
            }
        };

        let cancellation = {
            let mut current = self.cancellation.lock();
            *current = CancellationToken::new();
            current.clone()
        };

        let execution_id = Uuid::new_v4();
        tracing::info!(
            workflow_id = %self.workflow.id(),
            execution_id = %execution_id,
            trigger = %trigger_name,
            "Starting workflow execution"
        );

        match self
            .run_to_completion(trigger_name, &trigger, &cancellation)
            .await
        {
            Ok(()) => {
                self.workflow.set_state(WorkflowState::Completed);
                tracing::info!(
                    workflow_id = %self.workflow.id(),
                    execution_id = %execution_id,
                    "Workflow execution completed"
                );
                Ok(())
            }
            Err(error) => {
                self.workflow.set_state(WorkflowState::Failed);
                tracing::error!(
                    workflow_id = %self.workflow.id(),
                    execution_id = %execution_id,
                    error = %error,
                    "Workflow execution failed"
                );
                Err(error)
            }
        }
    }

    fn admit_trigger(&self, name: &str) -> FlowResult<Arc<FlowNode>> {
        let node = self
            .workflow
            .node(name)
            .ok_or_else(|| FlowError::structure(format!("unknown trigger node '{name}'")))?;
        if !node.properties().is_trigger {
            return Err(FlowError::structure(format!(
                "node '{name}' is not a trigger"
            )));
        }
        Ok(node.clone())
    }

    async fn run_to_completion(
        &self,
        trigger_name: &str,
        trigger: &Arc<FlowNode>,
        cancellation: &CancellationToken,
    ) -> FlowResult<()> {
        // Reset non-trigger nodes and clear the engine's ledgers.
        self.workflow.reset_nodes();
        {
            let mut shared = self.shared.lock();
            shared.state_manager.clear();
            shared.execution_state.clear();
            shared.pending.clear();
            shared.executed.clear();
        }

        // Recovery: previously completed nodes short-circuit.
        if let Some(hook) = &self.persistence {
            match hook.recover(self.workflow.id()).await {
                Ok(Some(snapshot)) => {
                    let mut shared = self.shared.lock();
                    shared.execution_state = snapshot.state.clone();
                    shared.state_manager.import(snapshot);
                    for name in shared.state_manager.completed_nodes() {
                        if name != trigger_name {
                            shared.executed.insert(name);
                        }
                    }
                    tracing::info!(
                        workflow_id = %self.workflow.id(),
                        recovered = shared.executed.len(),
                        "Recovered execution state"
                    );
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "Recovery failed; starting clean");
                }
            }
        }

        // Seed the trigger's fired output into the execution state; the
        // fire itself counts as the trigger's run.
        if trigger.state() == NodeState::Completed {
            let output = trigger.get_all_results();
            let mut shared = self.shared.lock();
            shared.state_manager.record_node_start(trigger_name);
            shared
                .state_manager
                .record_node_end(trigger_name, NodeState::Completed);
            shared
                .state_manager
                .set_node_state(trigger_name, output.clone());
            shared
                .execution_state
                .insert(trigger_name.to_string(), output);
            shared.executed.insert(trigger_name.to_string());
        }

        // Build the DAG; a cycle fails here, before any node runs.
        let graph = DependencyGraph::from_workflow(&self.workflow);
        let layers = graph.layers()?;
        let start = layers
            .iter()
            .position(|layer| layer.iter().any(|n| n == trigger_name))
            .ok_or_else(|| {
                FlowError::internal(format!("trigger '{trigger_name}' missing from layering"))
            })?;

        let settings = self.workflow.settings().clone();

        for layer in &layers[start..] {
            if cancellation.is_cancelled() {
                return Err(FlowError::Cancelled);
            }

            let members: Vec<String> = {
                let shared = self.shared.lock();
                layer
                    .iter()
                    .filter(|name| !shared.executed.contains(*name))
                    .cloned()
                    .collect()
            };
            if members.is_empty() {
                continue;
            }

            let (independent, residual) = graph.partition_independent(&members);

            if settings.enable_parallel_execution && independent.len() >= 2 {
                let batch_size = if settings.max_parallel_executions == 0 {
                    independent.len()
                } else {
                    settings.max_parallel_executions
                };
                for chunk in independent.chunks(batch_size) {
                    self.dispatch_parallel(chunk, cancellation).await?;
                }
            } else {
                self.dispatch_sequential(&independent, cancellation).await?;
            }

            self.dispatch_sequential(&residual, cancellation).await?;
        }

        Ok(())
    }

    /// Dispatch a batch of independent nodes, one task each.
    ///
    /// Tasks are registered in the pending map before they start so input
    /// collectors can deterministically await them. All results are
    /// committed before the first error propagates.
    async fn dispatch_parallel(
        &self,
        names: &[String],
        cancellation: &CancellationToken,
    ) -> FlowResult<()> {
        let mut dispatched = Vec::new();
        let mut handles = Vec::new();

        for name in names {
            let node = self.lookup(name)?;
            if self.skip_disabled(name, &node) {
                continue;
            }

            let (done_tx, done_rx) = oneshot::channel::<()>();
            let task: BoxFuture<'static, ()> = Box::pin(async move {
                let _ = done_rx.await;
            });
            self.shared
                .lock()
                .pending
                .insert(name.clone(), task.shared());

            let worker = NodeTask {
                workflow: self.workflow.clone(),
                shared: self.shared.clone(),
                secrets: self.secrets.clone(),
                cancellation: cancellation.clone(),
                node: node.clone(),
            };
            handles.push(tokio::spawn(async move {
                let result = worker.run().await;
                let _ = done_tx.send(());
                result
            }));
            dispatched.push((name.clone(), node));
        }

        let joined = futures::future::join_all(handles).await;

        let mut first_error = None;
        for ((name, node), join_result) in dispatched.into_iter().zip(joined) {
            let result = match join_result {
                Ok(result) => result,
                Err(error) => Err(FlowError::internal(format!(
                    "node task for '{name}' aborted: {error}"
                ))),
            };
            if let Err(error) = self.commit_node_result(&name, &node, result).await {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn dispatch_sequential(
        &self,
        names: &[String],
        cancellation: &CancellationToken,
    ) -> FlowResult<()> {
        for name in names {
            if cancellation.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let node = self.lookup(name)?;
            if self.skip_disabled(name, &node) {
                continue;
            }

            let worker = NodeTask {
                workflow: self.workflow.clone(),
                shared: self.shared.clone(),
                secrets: self.secrets.clone(),
                cancellation: cancellation.clone(),
                node: node.clone(),
            };
            let result = worker.run().await;
            self.commit_node_result(name, &node, result).await?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> FlowResult<Arc<FlowNode>> {
        self.workflow
            .node(name)
            .cloned()
            .ok_or_else(|| FlowError::internal(format!("scheduled node '{name}' disappeared")))
    }

    fn skip_disabled(&self, name: &str, node: &Arc<FlowNode>) -> bool {
        if !node.properties().disabled {
            return false;
        }
        tracing::debug!(node = %name, "Skipping disabled node");
        self.shared.lock().executed.insert(name.to_string());
        true
    }

    /// Fold a settled node back into the ledgers and run the persistence hook
    async fn commit_node_result(
        &self,
        name: &str,
        node: &Arc<FlowNode>,
        result: FlowResult<NodeOutput>,
    ) -> FlowResult<()> {
        let outcome = match result {
            Ok(output) => {
                let mut shared = self.shared.lock();
                shared
                    .state_manager
                    .record_node_end(name, NodeState::Completed);
                shared.state_manager.set_node_state(name, output.clone());
                shared.execution_state.insert(name.to_string(), output);
                shared.executed.insert(name.to_string());
                shared.pending.remove(name);
                drop(shared);
                tracing::debug!(node = %name, "Node completed");
                Ok(())
            }
            Err(error)
                if node.properties().continue_on_fail && error.honors_continue_on_fail() =>
            {
                tracing::warn!(
                    node = %name,
                    error = %error,
                    "Node failed; continuing with empty output"
                );
                let mut shared = self.shared.lock();
                shared
                    .state_manager
                    .record_node_end(name, NodeState::Completed);
                shared.state_manager.set_node_state(name, NodeOutput::new());
                shared
                    .execution_state
                    .insert(name.to_string(), NodeOutput::new());
                shared.executed.insert(name.to_string());
                shared.pending.remove(name);
                Ok(())
            }
            Err(error) => {
                tracing::error!(node = %name, error = %error, "Node failed");
                let mut shared = self.shared.lock();
                shared.state_manager.record_node_end(name, NodeState::Failed);
                shared.pending.remove(name);
                Err(error)
            }
        };

        if let Some(hook) = &self.persistence {
            let snapshot = self.shared.lock().state_manager.export();
            if let Err(error) = hook.persist(self.workflow.id(), snapshot).await {
                tracing::warn!(
                    workflow_id = %self.workflow.id(),
                    error = %error,
                    "Persistence hook failed"
                );
            }
        }

        outcome
    }
}

/// Per-node execution: input collection, retry, and the `process` call
struct NodeTask {
    workflow: Arc<Workflow>,
    shared: Arc<Mutex<EngineShared>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    cancellation: CancellationToken,
    node: Arc<FlowNode>,
}

impl NodeTask {
    async fn run(&self) -> FlowResult<NodeOutput> {
        let name = self.node.name().to_string();

        let input = self.collect_inputs().await?;
        if !self.node.input_ports().is_empty() && input.is_empty() {
            tracing::warn!(
                node = %name,
                "No input data collected; running with empty input"
            );
        }

        self.shared.lock().state_manager.record_node_start(&name);

        let properties = self.node.properties();
        let policy = RetryPolicy::from_config(properties.retry_delay);
        let max_retries = if properties.retry_on_fail {
            properties.max_retries
        } else {
            0
        };
        let total_attempts = 1 + max_retries;

        let mut attempt = 1u32;
        loop {
            if attempt > 1 {
                // stop, not reset: nodes may carry counters across attempts
                self.node.stop();
            }

            match self.run_once(&input).await {
                Ok(output) => return Ok(output),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    if attempt >= total_attempts {
                        return Err(error);
                    }
                    tracing::warn!(
                        node = %name,
                        attempt,
                        max_attempts = total_attempts,
                        error = %error,
                        "Node attempt failed; backing off"
                    );
                    policy.backoff(attempt, &self.cancellation).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once(&self, input: &NodeInput) -> FlowResult<NodeOutput> {
        if let Some(mock) = self.workflow.mock_data(self.node.name()) {
            tracing::debug!(node = %self.node.name(), "Short-circuiting with mock data");
            return self.node.run_mocked(mock);
        }

        let ctx = self.build_context(input.clone())?;
        if self.cancellation.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        self.node.run(ctx).await
    }

    fn build_context(&self, input: NodeInput) -> FlowResult<ProcessContext> {
        let config = match &self.secrets {
            Some(resolver) => {
                let raw = serde_json::Value::Object(self.node.config());
                match resolve_secrets(&raw, resolver.as_ref(), DEFAULT_MAX_DEPTH)? {
                    serde_json::Value::Object(map) => map,
                    _ => DataRecord::new(),
                }
            }
            None => self.node.config(),
        };

        Ok(ProcessContext {
            input,
            state: self.merged_state(),
            config,
            static_data: self.workflow.static_data(),
            cancellation: self.cancellation.clone(),
        })
    }

    /// Union of the engine's execution state, the state-manager snapshot,
    /// and completed nodes not yet synchronized into either.
    fn merged_state(&self) -> ExecutionState {
        let (mut state, execution_state) = {
            let shared = self.shared.lock();
            (
                shared.state_manager.get_state(),
                shared.execution_state.clone(),
            )
        };
        for (name, output) in execution_state {
            state.insert(name, output);
        }
        for (name, node) in self.workflow.nodes() {
            if !state.contains_key(name) && node.state() == NodeState::Completed {
                state.insert(name.to_string(), node.get_all_results());
            }
        }
        state
    }

    async fn collect_inputs(&self) -> FlowResult<NodeInput> {
        let name = self.node.name();
        let links = self.workflow.links_to(name);
        if links.is_empty() {
            return Ok(NodeInput::new());
        }

        let mut sources: Vec<&str> = Vec::new();
        for link in links {
            if !sources.contains(&link.source_node.as_str()) {
                sources.push(link.source_node.as_str());
            }
        }

        for source in &sources {
            self.wait_for_source(source).await?;
        }
        for source in &sources {
            if self.source_failed(source) {
                return Err(FlowError::SourceFailed {
                    source_node: source.to_string(),
                    target: name.to_string(),
                });
            }
        }

        // Per input port, concatenate the records of every link feeding it,
        // in link registration order.
        let mut by_port: Vec<(String, Vec<DataRecord>)> = Vec::new();
        for link in links {
            let records = self.source_port_records(&link.source_node, &link.source_output);
            match by_port.iter_mut().find(|(port, _)| *port == link.target_input) {
                Some((_, collected)) => collected.extend(records),
                None => by_port.push((link.target_input.clone(), records)),
            }
        }

        let mut input = NodeInput::new();
        for (port, records) in by_port {
            if let Some(data) = PortData::from_records(records) {
                input.insert(port, data);
            }
        }
        Ok(input)
    }

    /// Wait until a source node is no longer Running.
    ///
    /// Prefers awaiting the source's registered task; a brief grace period
    /// and a bounded poll cover registration races. A source that stays
    /// unsettled with no task is a scheduling bug and raises.
    async fn wait_for_source(&self, source: &str) -> FlowResult<()> {
        let source_node = self.workflow.node(source).cloned().ok_or_else(|| {
            FlowError::structure(format!(
                "link into '{}' references unknown node '{source}'",
                self.node.name()
            ))
        })?;

        if self.source_settled(source, &source_node) {
            return Ok(());
        }
        if let Some(task) = self.pending_task(source) {
            task.await;
            return Ok(());
        }

        tokio::time::sleep(TASK_GRACE).await;
        if let Some(task) = self.pending_task(source) {
            task.await;
            return Ok(());
        }

        for _ in 0..MAX_POLL_ITERATIONS {
            if self.source_settled(source, &source_node) {
                return Ok(());
            }
            if let Some(task) = self.pending_task(source) {
                task.await;
                return Ok(());
            }
            tokio::select! {
                _ = self.cancellation.cancelled() => return Err(FlowError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        Err(FlowError::internal(format!(
            "source '{source}' of '{}' is {:?} with no scheduled task",
            self.node.name(),
            source_node.state()
        )))
    }

    fn source_settled(&self, source: &str, source_node: &Arc<FlowNode>) -> bool {
        matches!(
            source_node.state(),
            NodeState::Completed | NodeState::Failed
        ) || self.shared.lock().executed.contains(source)
    }

    /// A source counts as failed unless the engine recorded it Completed
    /// (continue-on-fail failures are recorded as completions).
    fn source_failed(&self, source: &str) -> bool {
        let failed_state = self
            .workflow
            .node(source)
            .map(|n| n.state() == NodeState::Failed)
            .unwrap_or(false);
        if !failed_state {
            return false;
        }
        !self
            .shared
            .lock()
            .state_manager
            .get_node_metadata(source)
            .map(|m| m.status == NodeState::Completed)
            .unwrap_or(false)
    }

    fn pending_task(&self, source: &str) -> Option<PendingTask> {
        self.shared.lock().pending.get(source).cloned()
    }

    /// Records buffered on a source's output port, falling back to the
    /// execution state for nodes short-circuited by recovery.
    fn source_port_records(&self, source: &str, port: &str) -> Vec<DataRecord> {
        if let Some(node) = self.workflow.node(source) {
            if let Some(data) = node.get_result(port) {
                return data.into_records();
            }
        }
        self.shared
            .lock()
            .execution_state
            .get(source)
            .and_then(|output| output.get(port))
            .map(|data| data.clone().into_records())
            .unwrap_or_default()
    }
}
