use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vendflow_core::config::{AppConfig, WorkflowConfig};
use vendflow_core::context::paths;
use vendflow_core::error::{Result, TaskError, VendflowError};
use vendflow_core::traits::{PersistenceSink, TaskExecutor};
use vendflow_core::types::{
    CaughtError, ExecutionOutcome, FinalResult, VerificationRequest, WorkflowEvent,
};
use vendflow_core::{Context, EventBus};

use super::edge::Target;
use super::stage::{StageEnv, StageId, StageOutcome};
use super::workflow::Workflow;
use crate::retry::RetryPolicy;

/// Result of executing a single stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: StageId,
    pub succeeded: bool,
    /// Task attempts, including retries.
    pub attempts: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Result of one complete execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub run_id: String,
    pub verification_id: Option<String>,
    pub outcome: ExecutionOutcome,
    /// Per-stage results in execution order.
    pub stage_results: Vec<StageResult>,
    /// The result handed to the persistence sink, if one was produced.
    pub final_result: Option<FinalResult>,
    /// Whether the persistence sink accepted the result.
    pub stored: bool,
    pub failure_reason: Option<String>,
    pub summary: Option<serde_json::Value>,
    /// The final context with everything every stage wrote.
    pub context: Context,
    pub total_elapsed_ms: u64,
}

impl ExecutionRecord {
    /// Stages in the order they ran.
    pub fn stage_sequence(&self) -> Vec<StageId> {
        self.stage_results.iter().map(|r| r.stage).collect()
    }

    pub fn visited(&self, stage: StageId) -> bool {
        self.stage_results.iter().any(|r| r.stage == stage)
    }

    pub fn stage_result(&self, stage: StageId) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }
}

/// Drives one verification through the workflow.
///
/// Executions are independent: the executor holds no per-run state, so one
/// instance may run many verifications concurrently.
pub struct WorkflowExecutor {
    workflow: Workflow,
    tasks: Arc<dyn TaskExecutor>,
    sink: Arc<dyn PersistenceSink>,
    config: WorkflowConfig,
    events: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

/// Why a bounded stage did not finish.
enum Interrupt {
    Deadline,
    Cancelled,
}

impl WorkflowExecutor {
    pub fn new(
        workflow: Workflow,
        tasks: Arc<dyn TaskExecutor>,
        sink: Arc<dyn PersistenceSink>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            workflow,
            tasks,
            sink,
            config,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// The verification workflow configured from `config`.
    pub fn from_config(
        config: &AppConfig,
        tasks: Arc<dyn TaskExecutor>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self> {
        let workflow = Workflow::verification(&RetryPolicy::from(&config.retry))?;
        Ok(Self::new(workflow, tasks, sink, config.workflow.clone()))
    }

    /// Publish progress events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Stop bounded stages when `token` fires. The interrupted run still
    /// goes through recovery, so a FAILED result is stored.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Await `fut` unless the deadline passes or the run is cancelled first.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = T>,
        deadline: tokio::time::Instant,
    ) -> std::result::Result<T, Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Interrupt::Deadline);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = tokio::time::timeout_at(deadline, fut) => result.map_err(|_| Interrupt::Deadline),
        }
    }

    /// Run a verification request from the entry stage.
    pub async fn run_request(&self, request: &VerificationRequest) -> Result<ExecutionRecord> {
        self.run(Context::from_request(request)?).await
    }

    /// Run the workflow over `initial`.
    ///
    /// Task failures, unusable stage output, the deadline and cancellation
    /// are routed through the recovery stages and end in an `Ok` record;
    /// only configuration errors return `Err`.
    pub async fn run(&self, initial: Context) -> Result<ExecutionRecord> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
        });
        match self.drive(&run_id, initial).await {
            Ok(record) => {
                self.publish(WorkflowEvent::RunCompleted {
                    run_id,
                    verification_id: record.verification_id.clone(),
                    outcome: record.outcome,
                    stored: record.stored,
                });
                Ok(record)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Verification aborted");
                self.publish(WorkflowEvent::RunAborted {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(&self, run_id: &str, initial: Context) -> Result<ExecutionRecord> {
        let start = Instant::now();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.timeout_secs);
        let mut ctx = initial;
        let mut stage_results = Vec::new();
        let mut visits: HashMap<StageId, usize> = HashMap::new();
        let mut current = self.workflow.entry();
        let env = StageEnv {
            tasks: self.tasks.as_ref(),
            sink: self.sink.as_ref(),
            task_timeout: Duration::from_secs(self.config.task_timeout_secs),
            events: self.events.as_deref(),
            run_id,
        };

        info!(run_id, "Starting verification");

        let terminal = loop {
            // Prevent infinite loops
            let count = visits.entry(current).or_insert(0);
            *count += 1;
            if *count > self.config.max_stage_visits {
                return Err(VendflowError::InvalidWorkflow(format!(
                    "stage {} visited more than {} times",
                    current, self.config.max_stage_visits
                )));
            }

            let stage = self.workflow.stage(current)?;
            let name = current.to_string();
            info!(run_id, stage = %name, "Executing stage");
            self.publish(WorkflowEvent::StageStarted {
                run_id: run_id.to_string(),
                stage: name.clone(),
            });

            let stage_start = Instant::now();
            let execution = if current.honors_deadline() {
                self.bounded(stage.execute(&ctx, &env), deadline).await
            } else {
                Ok(stage.execute(&ctx, &env).await)
            };
            let elapsed_ms = stage_start.elapsed().as_millis() as u64;
            let task = stage.task_name().unwrap_or(&name).to_string();

            // Interrupted stages skip their edges and go straight to recovery.
            let mut interrupted = !matches!(execution, Ok(Ok(_)));
            let (outcome, attempts) = match execution {
                Ok(Ok(execution)) => (execution.outcome, execution.attempts),
                Ok(Err(e)) if e.is_configuration() || !current.honors_deadline() => return Err(e),
                Ok(Err(e)) => (
                    StageOutcome::Failed(TaskError::validation(&task, e.to_string())),
                    1,
                ),
                Err(Interrupt::Deadline) => {
                    warn!(run_id, stage = %name, timeout_secs = self.config.timeout_secs, "Workflow deadline exceeded");
                    self.publish(WorkflowEvent::DeadlineExceeded {
                        run_id: run_id.to_string(),
                        stage: name.clone(),
                    });
                    let secs = self.config.timeout_secs;
                    let message = VendflowError::WorkflowTimeout { secs }.to_string();
                    (StageOutcome::Failed(TaskError::timeout(&task, message)), 0)
                }
                Err(Interrupt::Cancelled) => {
                    warn!(run_id, stage = %name, "Verification cancelled");
                    let err = TaskError::unknown(&task, "verification cancelled");
                    (StageOutcome::Failed(err), 0)
                }
            };

            let failure = match outcome {
                StageOutcome::Continue { value, status } => {
                    match stage.write_output(&mut ctx, value) {
                        Ok(()) => {
                            if let Some(status) = status {
                                ctx.set_status(status)?;
                            }
                            None
                        }
                        Err(e) if !current.honors_deadline() => return Err(e),
                        Err(e) => {
                            interrupted = true;
                            Some(TaskError::validation(&task, e.to_string()))
                        }
                    }
                }
                StageOutcome::Failed(err) => Some(err),
            };

            let succeeded = failure.is_none();
            match failure {
                None => {
                    debug!(run_id, stage = %name, elapsed_ms, attempts, "Stage complete");
                    self.publish(WorkflowEvent::StageCompleted {
                        run_id: run_id.to_string(),
                        stage: name.clone(),
                        elapsed_ms,
                    });
                    stage_results.push(StageResult {
                        stage: current,
                        succeeded: true,
                        attempts,
                        elapsed_ms,
                        error: None,
                    });
                }
                Some(err) => {
                    warn!(run_id, stage = %name, error = %err, attempts, "Stage failed");
                    self.publish(WorkflowEvent::StageFailed {
                        run_id: run_id.to_string(),
                        stage: name.clone(),
                        error: err.clone(),
                    });
                    let caught = CaughtError {
                        stage: name,
                        error: err.clone(),
                    };
                    ctx.replace(paths::ERROR, serde_json::to_value(&caught)?)?;
                    stage_results.push(StageResult {
                        stage: current,
                        succeeded: false,
                        attempts,
                        elapsed_ms,
                        error: Some(err),
                    });
                }
            }

            if interrupted {
                current = self.workflow.recovery_route(current);
                continue;
            }
            match self.workflow.next(current, succeeded, &ctx)? {
                Target::Stage(next) => current = next,
                Target::Terminal => break current,
            }
        };

        let outcome = if terminal == StageId::WorkflowComplete {
            ExecutionOutcome::Completed
        } else if terminal.is_early_failure_marker() {
            ExecutionOutcome::FailedEarly
        } else {
            ExecutionOutcome::FailedWithPartial
        };
        let stored = ctx
            .get(&format!("{}.persisted", paths::STORAGE_RESULT))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let final_result = stored_result(&ctx);
        let total_elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            run_id,
            outcome = %outcome,
            stored,
            total_elapsed_ms,
            "Verification finished"
        );

        Ok(ExecutionRecord {
            run_id: run_id.to_string(),
            verification_id: ctx.verification_id().map(String::from),
            outcome,
            stage_results,
            final_result,
            stored,
            failure_reason: ctx
                .get_str(&format!("{}.reason", paths::FAILURE))
                .map(String::from),
            summary: ctx.get(paths::SUMMARY).cloned(),
            context: ctx,
            total_elapsed_ms,
        })
    }
}

/// The final result as it was handed to the sink.
fn stored_result(ctx: &Context) -> Option<FinalResult> {
    let mut result: FinalResult = ctx.read_as(paths::FINAL_RESULTS).ok()?;
    if let Some(url) = ctx.get_str(&format!("{}.resultImageUrl", paths::STORAGE_RESULT)) {
        result.result_image_url = Some(url.to_string());
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vendflow_core::types::{Turn, VerificationStatus};
    use vendflow_test_utils::{layout_request, RecordingSink, ScriptedTaskExecutor};

    fn executor(tasks: Arc<ScriptedTaskExecutor>, sink: Arc<RecordingSink>) -> WorkflowExecutor {
        let workflow = Workflow::verification(&RetryPolicy::immediate(3)).unwrap();
        WorkflowExecutor::new(workflow, tasks, sink, WorkflowConfig::default())
    }

    #[tokio::test]
    async fn test_happy_path_layout() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let record = executor(tasks.clone(), sink.clone())
            .run_request(&layout_request())
            .await
            .unwrap();

        assert_eq!(record.outcome, ExecutionOutcome::Completed);
        assert!(record.stored);
        assert!(!record.visited(StageId::FetchHistoricalVerification));
        assert!(!record.visited(StageId::Notify));
        assert_eq!(record.stage_sequence().last(), Some(&StageId::WorkflowComplete));
        assert_eq!(sink.stored().len(), 1);
        assert_eq!(record.context.status(), Some("COMPLETED"));
        assert_eq!(record.summary.unwrap()["status"], json!("COMPLETED"));
    }

    #[tokio::test]
    async fn test_turn_one_failure_stores_failed_result() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        tasks.fail_on_call("invoke_bedrock", 1, TaskError::validation("invoke_bedrock", "bad prompt"));
        let sink = Arc::new(RecordingSink::new());
        let record = executor(tasks, sink.clone())
            .run_request(&layout_request())
            .await
            .unwrap();

        assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
        assert!(record.visited(StageId::HandleBedrockError(Turn::One)));
        assert!(record.visited(StageId::FinalizeWithError(Turn::One)));
        assert!(!record.visited(StageId::ProcessTurnResponse(Turn::One)));
        assert_eq!(record.stage_sequence().last(), Some(&StageId::StoreResults));
        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
        assert!(stored[0].reference_analysis.is_none());
    }

    #[tokio::test]
    async fn test_early_failure_stores_nothing() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        tasks.fail_always("fetch_images", TaskError::validation("fetch_images", "no such object"));
        let sink = Arc::new(RecordingSink::new());
        let record = executor(tasks, sink.clone())
            .run_request(&layout_request())
            .await
            .unwrap();

        assert_eq!(record.outcome, ExecutionOutcome::FailedEarly);
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("Failed to fetch images or metadata")
        );
        assert!(sink.stored().is_empty());
        assert!(!record.stored);
    }

    #[tokio::test]
    async fn test_unknown_verification_type_aborts() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let mut request = layout_request();
        request.verification_type = "layout_vs_checking".into();
        let err = executor(tasks.clone(), sink.clone())
            .run_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, VendflowError::UnknownVerificationType(_)));
        assert!(sink.stored().is_empty());
        assert_eq!(tasks.call_count("fetch_images"), 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let record = executor(tasks, sink)
            .with_event_bus(bus)
            .run_request(&layout_request())
            .await
            .unwrap();

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), record.run_id);
            if let WorkflowEvent::RunCompleted { outcome, .. } = event {
                assert_eq!(outcome, ExecutionOutcome::Completed);
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_from_config() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let exec = WorkflowExecutor::from_config(&AppConfig::default(), tasks, sink).unwrap();
        assert_eq!(
            exec.workflow()
                .stage(StageId::FetchImages)
                .unwrap()
                .retry
                .max_attempts,
            3
        );
    }

    #[tokio::test]
    async fn test_unmergeable_output_routes_to_recovery() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        tasks.respond("process_turn1_response", json!("six rows"));
        let sink = Arc::new(RecordingSink::new());
        let mut initial = Context::from_request(&layout_request()).unwrap();
        initial
            .merge("referenceAnalysis", json!({"seeded": true}))
            .unwrap();

        let record = executor(tasks, sink.clone()).run(initial).await.unwrap();

        assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
        assert!(record.visited(StageId::FinalizeWithError(Turn::One)));
        assert!(!record.visited(StageId::UpdateConversationState(Turn::One)));
        let processed = record
            .stage_result(StageId::ProcessTurnResponse(Turn::One))
            .unwrap();
        assert!(!processed.succeeded);
        assert_eq!(
            processed.error.as_ref().unwrap().kind,
            vendflow_core::TaskErrorKind::ValidationFailed
        );
        assert_eq!(
            record.context.get("referenceAnalysis"),
            Some(&json!({"seeded": true}))
        );
        assert_eq!(sink.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_data_error_routes_to_recovery() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let mut initial = Context::from_request(&layout_request()).unwrap();
        initial
            .merge("turn1Response", json!({"timestamp": {"not": "a time"}}))
            .unwrap();

        let record = executor(tasks, sink.clone()).run(initial).await.unwrap();

        let update = record
            .stage_result(StageId::UpdateConversationState(Turn::One))
            .unwrap();
        assert!(!update.succeeded);
        assert!(record.visited(StageId::FinalizeWithError(Turn::One)));
        assert!(!record.visited(StageId::PrepareTurnPrompt(Turn::Two)));
        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_ends_early() {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        let sink = Arc::new(RecordingSink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let record = executor(tasks.clone(), sink.clone())
            .with_cancellation(cancel)
            .run_request(&layout_request())
            .await
            .unwrap();

        assert_eq!(record.outcome, ExecutionOutcome::FailedEarly);
        assert!(record.visited(StageId::HandleInitializationError));
        assert_eq!(tasks.call_count("initialize"), 0);
        assert!(sink.stored().is_empty());
    }
}
