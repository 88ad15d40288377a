//! # FlowGraph
//!
//! A DAG-driven workflow execution engine for Rust.
//!
//! FlowGraph drives a graph of user-defined processing nodes from a trigger
//! to completion: it layers the dependency graph, dispatches independent
//! nodes in parallel, applies per-node retry with backoff, propagates typed
//! data between ports, and keeps a centralized, persistable execution state.
//!
//! ## Features
//!
//! - **Dependency-ordered execution**: Kahn layering with cycle detection
//! - **Async by design**: built on tokio; every node runs in its own task
//! - **Per-node retry**: fixed or exponential-backoff delays, cancellable
//! - **Typed ports**: links require exact `dataType` agreement
//! - **Persistable state**: pluggable persist/recover hooks survive restarts
//! - **Secret resolution**: `{{secrets.name.field}}` references in node config
//! - **Observability**: structured tracing throughout the engine
//!
//! ## Quick Start
//!
//! ```rust
//! use flow_graph::{
//!     DataRecord, Engine, FlowNode, FlowResult, Link, NodeOutput, PortData, Process,
//!     ProcessContext, TriggerHandle, Workflow,
//! };
//! use flow_graph::trigger::manual_trigger;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Double;
//!
//! #[async_trait]
//! impl Process for Double {
//!     fn node_type(&self) -> &'static str {
//!         "math.double"
//!     }
//!
//!     async fn process(&self, ctx: ProcessContext) -> FlowResult<NodeOutput> {
//!         let value = ctx
//!             .input
//!             .get("input")
//!             .and_then(|data| {
//!                 data.records()
//!                     .first()
//!                     .and_then(|r| r.get("value"))
//!                     .and_then(|v| v.as_i64())
//!             })
//!             .unwrap_or(0);
//!
//!         let mut record = DataRecord::new();
//!         record.insert("value".to_string(), (value * 2).into());
//!         let mut output = NodeOutput::new();
//!         output.insert("output".to_string(), PortData::Single(record));
//!         Ok(output)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> FlowResult<()> {
//!     let mut workflow = Workflow::new("demo");
//!     workflow.add_node(manual_trigger("start")?)?;
//!     workflow.add_node(
//!         FlowNode::builder("double")
//!             .input("input", "record")
//!             .output("output", "record")
//!             .behavior(Double)
//!             .build()?,
//!     )?;
//!     workflow.add_link(Link::new("start", "output", "double", "input"))?;
//!
//!     let engine = Arc::new(Engine::new(workflow));
//!     let trigger = TriggerHandle::bind(engine.clone(), "start")?;
//!
//!     let mut seed = DataRecord::new();
//!     seed.insert("value".to_string(), 21.into());
//!     trigger.fire(Some(seed)).await?;
//!
//!     println!("double = {:?}", engine.node_state("double"));
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod dag;
pub mod data;
pub mod engine;
pub mod error;
pub mod node;
pub mod persistence;
pub mod retry;
pub mod secret;
pub mod state;
pub mod trigger;
pub mod workflow;

// Re-export core types for convenience
pub use dag::DependencyGraph;
pub use data::{DataRecord, ExecutionState, NodeInput, NodeOutput, PortData};
pub use engine::Engine;
pub use error::{FlowError, FlowResult};
pub use node::{FlowNode, LinkType, NodeProperties, NodeState, Port, Process, ProcessContext};
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceHook};
pub use retry::{RetryDelay, RetryPolicy};
pub use secret::{EnvSecretResolver, MapSecretResolver, SecretResolver};
pub use state::{NodeExecutionMetadata, StateManager, StateSnapshot};
pub use trigger::{manual_trigger, ManualTrigger, ScheduleTrigger, TriggerHandle};
pub use workflow::serialize::{NodeTypeRegistry, WorkflowExport};
pub use workflow::{Link, Workflow, WorkflowSettings, WorkflowState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for the engine
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
