use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::{Result, TaskError};
use crate::types::FinalResult;

/// Task executor: runs the named unit of work a stage delegates to.
///
/// Task names correspond to stages (`fetch_images`, `invoke_bedrock`,
/// `store_results`, ...). Implementations must be safe to share between
/// concurrent executions.
pub trait TaskExecutor: Send + Sync + 'static {
    fn invoke(
        &self,
        task: &str,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, TaskError>>;
}

/// Persistence sink: durable destination for final results and notifications.
///
/// The sink owns the durability of its writes (including any retrying); the
/// executor calls each method at most once per execution.
pub trait PersistenceSink: Send + Sync + 'static {
    /// Persist the terminal result of one execution.
    fn store<'a>(&'a self, result: &'a FinalResult, context: &'a Context)
        -> BoxFuture<'a, Result<()>>;

    /// Record that a notification for this execution was sent.
    fn notify<'a>(&'a self, context: &'a Context) -> BoxFuture<'a, Result<()>>;
}
