pub mod graph;
pub mod recovery;
pub mod retry;
pub mod run_log;

pub use graph::{
    Edge, EdgeCondition, ExecutionRecord, Stage, StageId, StageResult, Target, Workflow,
    WorkflowExecutor,
};
pub use retry::RetryPolicy;
pub use run_log::RunLogger;
