//! Error types and handling for the FlowGraph engine.

use crate::node::NodeState;
use thiserror::Error;

/// Result type alias for engine operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Comprehensive error types for the FlowGraph engine
#[derive(Error, Debug)]
pub enum FlowError {
    /// The dependency graph contains a cycle and cannot be layered
    #[error("cycle detected in workflow graph: node '{node}' can never be scheduled")]
    Cycle {
        /// A node that remained unschedulable when layering stalled
        node: String,
    },

    /// A second `execute` was attempted while the workflow was running
    #[error("workflow '{workflow_id}' is already executing")]
    AlreadyRunning {
        /// The workflow that rejected re-entrant execution
        workflow_id: String,
    },

    /// Node configuration failed schema validation
    #[error("invalid configuration at '{path}': {message}")]
    Configuration {
        /// JSON-Pointer path of the first failing value
        path: String,
        /// Validator message
        message: String,
    },

    /// A node state transition outside the legal table was attempted
    #[error("illegal state transition on node '{node}': {from:?} -> {to:?}")]
    IllegalState {
        /// Node whose state machine was violated
        node: String,
        /// State the node was in
        from: NodeState,
        /// State that was requested
        to: NodeState,
    },

    /// A `{{secrets.name.field}}` reference could not be resolved
    #[error("failed to resolve secret '{reference}': {message}")]
    SecretResolution {
        /// The `name.field` reference that failed
        reference: String,
        /// Resolver message
        message: String,
    },

    /// A node's `process` implementation failed
    #[error("node '{node}' failed: {message}")]
    Process {
        /// The failing node
        node: String,
        /// Error message from the node
        message: String,
    },

    /// An upstream dependency failed, so the target cannot run
    #[error("source node '{source_node}' failed; '{target}' cannot run")]
    SourceFailed {
        /// The failed upstream node
        source_node: String,
        /// The node whose input collection was aborted
        target: String,
    },

    /// The execution was cancelled externally
    #[error("workflow execution cancelled")]
    Cancelled,

    /// A persistence hook call failed (logged, never fatal to execution)
    #[error("persistence hook error: {0}")]
    Persistence(String),

    /// Workflow structure errors (unknown nodes, bad links, duplicate ports)
    #[error("workflow structure error: {0}")]
    Structure(String),

    /// A serialized workflow carried an unknown format version
    #[error("unsupported export format version {version}")]
    UnsupportedExportVersion {
        /// The version found in the export
        version: u32,
    },

    /// Import referenced node types missing from the registry
    #[error("unresolvable node types: {}", types.join(", "))]
    UnknownNodeTypes {
        /// Missing `name@version` tuples
        types: Vec<String>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors (engine bugs, scheduling races)
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Create a new process error
    pub fn process<N: Into<String>, M: Into<String>>(node: N, message: M) -> Self {
        Self::Process {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::Configuration {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new workflow structure error
    pub fn structure<S: Into<String>>(message: S) -> Self {
        Self::Structure(message.into())
    }

    /// Create a new secret resolution error
    pub fn secret<R: Into<String>, M: Into<String>>(reference: R, message: M) -> Self {
        Self::SecretResolution {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the retry policy applies to this error.
    ///
    /// Only process failures and secret resolution failures are retried;
    /// everything else either indicates a bug (illegal state), a structural
    /// problem (cycle, configuration), or an external decision (cancellation).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Process { .. } | FlowError::SecretResolution { .. }
        )
    }

    /// Whether a node's `continue_on_fail` flag may swallow this error.
    ///
    /// Cancellation and engine bugs always propagate.
    pub fn honors_continue_on_fail(&self) -> bool {
        matches!(
            self,
            FlowError::Process { .. }
                | FlowError::SecretResolution { .. }
                | FlowError::SourceFailed { .. }
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            FlowError::Cycle { .. } => "cycle",
            FlowError::AlreadyRunning { .. } => "already_running",
            FlowError::Configuration { .. } => "configuration",
            FlowError::IllegalState { .. } => "illegal_state",
            FlowError::SecretResolution { .. } => "secret_resolution",
            FlowError::Process { .. } => "process",
            FlowError::SourceFailed { .. } => "source_failed",
            FlowError::Cancelled => "cancelled",
            FlowError::Persistence(_) => "persistence",
            FlowError::Structure(_) => "structure",
            FlowError::UnsupportedExportVersion { .. } => "export_version",
            FlowError::UnknownNodeTypes { .. } => "unknown_node_types",
            FlowError::Serialization(_) => "serialization",
            FlowError::Io(_) => "io",
            FlowError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let errors = vec![
            FlowError::process("fetch", "connection reset"),
            FlowError::configuration("/url", "expected string"),
            FlowError::structure("unknown node"),
            FlowError::Cancelled,
        ];

        for error in errors {
            assert!(!error.category().is_empty());
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FlowError::process("n", "boom").is_retryable());
        assert!(FlowError::secret("api.key", "missing").is_retryable());
        assert!(!FlowError::Cancelled.is_retryable());
        assert!(!FlowError::structure("bad link").is_retryable());
    }

    #[test]
    fn test_continue_on_fail_scope() {
        assert!(FlowError::process("n", "boom").honors_continue_on_fail());
        assert!(FlowError::SourceFailed {
            source_node: "a".into(),
            target: "b".into()
        }
        .honors_continue_on_fail());
        assert!(!FlowError::Cancelled.honors_continue_on_fail());
        assert!(!FlowError::IllegalState {
            node: "n".into(),
            from: NodeState::Idle,
            to: NodeState::Completed,
        }
        .honors_continue_on_fail());
    }
}
