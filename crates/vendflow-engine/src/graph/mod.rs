//! Workflow graph: stages connected by conditional transitions.
//!
//! A workflow is a set of [`Stage`]s joined by [`Edge`]s. The
//! [`WorkflowExecutor`] starts at the entry stage, runs each stage against
//! the shared [`Context`](vendflow_core::Context), merges its output, and
//! follows the first outgoing edge whose condition holds until an edge
//! leads to [`Target::Terminal`].

pub mod edge;
pub mod executor;
pub mod stage;
pub mod workflow;

pub use edge::{Edge, EdgeCondition, Target};
pub use executor::{ExecutionRecord, StageResult, WorkflowExecutor};
pub use stage::{Stage, StageEnv, StageExecution, StageId, StageKind, StageOutcome};
pub use workflow::Workflow;
