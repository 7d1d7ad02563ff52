use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use vendflow_core::context::paths;
use vendflow_core::error::{Result, TaskError};
use vendflow_core::traits::{PersistenceSink, TaskExecutor};
use vendflow_core::types::{
    ConversationState, FinalResult, HistoricalContext, Turn, TurnRecord, TurnResponse,
    VerificationId, WorkflowEvent, WorkflowStatus,
};
use vendflow_core::{Context, EventBus};

use crate::recovery;
use crate::retry::{with_retry, RetryPolicy};

/// Identity of one stage in the verification workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    Initialize,
    FetchHistoricalVerification,
    FetchImages,
    PrepareSystemPrompt,
    InitializeConversationState,
    PrepareTurnPrompt(Turn),
    ExecuteTurn(Turn),
    ProcessTurnResponse(Turn),
    UpdateConversationState(Turn),
    FinalizeResults,
    StoreResults,
    Notify,
    WorkflowComplete,
    HandleBedrockError(Turn),
    FinalizeWithError(Turn),
    HandleInitializationError,
    HandleHistoricalFetchError,
    HandleFetchImagesError,
}

impl StageId {
    /// Every stage of the verification workflow, in normal-path order
    /// followed by the recovery stages.
    pub fn all() -> Vec<StageId> {
        use StageId::*;
        let mut all = vec![
            Initialize,
            FetchHistoricalVerification,
            FetchImages,
            PrepareSystemPrompt,
            InitializeConversationState,
        ];
        for turn in [Turn::One, Turn::Two] {
            all.extend([
                PrepareTurnPrompt(turn),
                ExecuteTurn(turn),
                ProcessTurnResponse(turn),
                UpdateConversationState(turn),
            ]);
        }
        all.extend([FinalizeResults, StoreResults, Notify, WorkflowComplete]);
        for turn in [Turn::One, Turn::Two] {
            all.extend([HandleBedrockError(turn), FinalizeWithError(turn)]);
        }
        all.extend([
            HandleInitializationError,
            HandleHistoricalFetchError,
            HandleFetchImagesError,
        ]);
        all
    }

    /// The turn a stage belongs to, if it is turn-specific.
    pub fn turn(self) -> Option<Turn> {
        match self {
            StageId::PrepareTurnPrompt(t)
            | StageId::ExecuteTurn(t)
            | StageId::ProcessTurnResponse(t)
            | StageId::UpdateConversationState(t)
            | StageId::HandleBedrockError(t)
            | StageId::FinalizeWithError(t) => Some(t),
            _ => None,
        }
    }

    /// Stages that run before data collection is complete. A failure here
    /// ends the execution without storing anything.
    pub fn is_data_collection(self) -> bool {
        matches!(
            self,
            StageId::Initialize | StageId::FetchHistoricalVerification | StageId::FetchImages
        )
    }

    /// The terminal marker a failed data-collection stage routes to.
    pub fn early_failure_marker(self) -> Option<StageId> {
        match self {
            StageId::Initialize => Some(StageId::HandleInitializationError),
            StageId::FetchHistoricalVerification => Some(StageId::HandleHistoricalFetchError),
            StageId::FetchImages => Some(StageId::HandleFetchImagesError),
            _ => None,
        }
    }

    pub fn is_early_failure_marker(self) -> bool {
        matches!(
            self,
            StageId::HandleInitializationError
                | StageId::HandleHistoricalFetchError
                | StageId::HandleFetchImagesError
        )
    }

    pub fn is_recovery(self) -> bool {
        self.is_early_failure_marker()
            || matches!(
                self,
                StageId::HandleBedrockError(_) | StageId::FinalizeWithError(_)
            )
    }

    /// Whether the workflow deadline may interrupt this stage. Recovery
    /// stages and the persistence stages always run to completion.
    pub fn honors_deadline(self) -> bool {
        !self.is_recovery() && !matches!(self, StageId::StoreResults | StageId::WorkflowComplete)
    }

    /// The turn whose recovery chain handles a failure in this stage.
    pub fn recovery_turn(self) -> Turn {
        match self {
            StageId::PrepareTurnPrompt(t)
            | StageId::ExecuteTurn(t)
            | StageId::ProcessTurnResponse(t)
            | StageId::UpdateConversationState(t)
            | StageId::HandleBedrockError(t)
            | StageId::FinalizeWithError(t) => t,
            StageId::FinalizeResults | StageId::StoreResults | StageId::Notify => Turn::Two,
            _ => Turn::One,
        }
    }

    /// Status recorded in the context when this stage completes.
    pub fn success_status(self) -> Option<WorkflowStatus> {
        use WorkflowStatus as S;
        match self {
            StageId::Initialize => Some(S::VerificationInitialized),
            StageId::FetchHistoricalVerification => Some(S::HistoricalContextLoaded),
            StageId::FetchImages => Some(S::ImagesFetched),
            StageId::PrepareSystemPrompt => Some(S::PromptPrepared),
            StageId::InitializeConversationState | StageId::UpdateConversationState(_) => None,
            StageId::PrepareTurnPrompt(Turn::One) => Some(S::Turn1PromptReady),
            StageId::PrepareTurnPrompt(Turn::Two) => Some(S::Turn2PromptReady),
            StageId::ExecuteTurn(Turn::One) => Some(S::Turn1Completed),
            StageId::ExecuteTurn(Turn::Two) => Some(S::Turn2Completed),
            StageId::ProcessTurnResponse(Turn::One) => Some(S::Turn1Processed),
            StageId::ProcessTurnResponse(Turn::Two) => Some(S::Turn2Processed),
            StageId::FinalizeResults => Some(S::ResultsFinalized),
            StageId::StoreResults => Some(S::ResultsStored),
            StageId::Notify => Some(S::NotificationSent),
            StageId::WorkflowComplete => Some(S::Completed),
            StageId::HandleBedrockError(_) => Some(S::BedrockProcessingFailed),
            StageId::FinalizeWithError(_) => Some(S::VerificationFailed),
            StageId::HandleInitializationError => Some(S::InitializationFailed),
            StageId::HandleHistoricalFetchError => Some(S::HistoricalFetchFailed),
            StageId::HandleFetchImagesError => Some(S::ImageFetchFailed),
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageId::Initialize => f.write_str("Initialize"),
            StageId::FetchHistoricalVerification => f.write_str("FetchHistoricalVerification"),
            StageId::FetchImages => f.write_str("FetchImages"),
            StageId::PrepareSystemPrompt => f.write_str("PrepareSystemPrompt"),
            StageId::InitializeConversationState => f.write_str("InitializeConversationState"),
            StageId::PrepareTurnPrompt(t) => write!(f, "PrepareTurn{}Prompt", t),
            StageId::ExecuteTurn(t) => write!(f, "ExecuteTurn{}", t),
            StageId::ProcessTurnResponse(t) => write!(f, "ProcessTurn{}Response", t),
            StageId::UpdateConversationState(t) => {
                write!(f, "UpdateConversationStateAfterTurn{}", t)
            }
            StageId::FinalizeResults => f.write_str("FinalizeResults"),
            StageId::StoreResults => f.write_str("StoreResults"),
            StageId::Notify => f.write_str("Notify"),
            StageId::WorkflowComplete => f.write_str("WorkflowComplete"),
            StageId::HandleBedrockError(t) => write!(f, "HandleBedrockErrorTurn{}", t),
            StageId::FinalizeWithError(t) => write!(f, "FinalizeWithErrorTurn{}", t),
            StageId::HandleInitializationError => f.write_str("HandleInitializationError"),
            StageId::HandleHistoricalFetchError => f.write_str("HandleHistoricalFetchError"),
            StageId::HandleFetchImagesError => f.write_str("HandleFetchImagesError"),
        }
    }
}

impl Serialize for StageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How a stage does its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Delegates to the named task through the [`TaskExecutor`].
    Task { task: String },
    /// Pure transformation of the context; never fails with a task error.
    Local,
}

/// A stage definition: what it reads, what it writes, and how it retries.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub kind: StageKind,
    /// Context paths that must be present before the stage runs.
    pub inputs: Vec<String>,
    /// Context paths included in the task payload when present.
    pub optional_inputs: Vec<String>,
    /// Where the stage's output is merged. Empty means the context root.
    pub output_path: String,
    /// Overwrite the output slot instead of merging into it.
    pub replace_output: bool,
    pub retry: RetryPolicy,
}

impl Stage {
    /// A stage backed by an external task.
    pub fn task(id: StageId, task: impl Into<String>) -> Self {
        Self {
            id,
            kind: StageKind::Task { task: task.into() },
            inputs: vec![],
            optional_inputs: vec![],
            output_path: String::new(),
            replace_output: false,
            retry: RetryPolicy::none(),
        }
    }

    /// A stage computed in-process.
    pub fn local(id: StageId) -> Self {
        Self {
            id,
            kind: StageKind::Local,
            inputs: vec![],
            optional_inputs: vec![],
            output_path: String::new(),
            replace_output: false,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_inputs<'a>(mut self, paths: impl IntoIterator<Item = &'a str>) -> Self {
        self.inputs = paths.into_iter().map(String::from).collect();
        self
    }

    pub fn with_optional_inputs<'a>(mut self, paths: impl IntoIterator<Item = &'a str>) -> Self {
        self.optional_inputs = paths.into_iter().map(String::from).collect();
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.output_path = path.into();
        self
    }

    /// Each run of the stage owns its output slot outright.
    pub fn replacing_output(mut self) -> Self {
        self.replace_output = true;
        self
    }

    /// Write a successful output into `ctx`.
    pub fn write_output(&self, ctx: &mut Context, value: Value) -> Result<()> {
        if self.replace_output {
            ctx.replace(&self.output_path, value)
        } else {
            ctx.merge(&self.output_path, value)
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn task_name(&self) -> Option<&str> {
        match &self.kind {
            StageKind::Task { task } => Some(task),
            StageKind::Local => None,
        }
    }

    /// Fail fast when a required input is absent.
    pub fn check_inputs(&self, ctx: &Context) -> Result<()> {
        for path in &self.inputs {
            ctx.read(path)?;
        }
        Ok(())
    }

    /// Run the stage against a snapshot of the context.
    ///
    /// Configuration problems (missing inputs, malformed state) come back as
    /// `Err`; task failures come back as [`StageOutcome::Failed`] so the
    /// transition graph can route them.
    pub async fn execute(&self, ctx: &Context, env: &StageEnv<'_>) -> Result<StageExecution> {
        self.check_inputs(ctx)?;
        match (&self.kind, self.id) {
            (StageKind::Task { task }, StageId::Initialize) => self.initialize(task, ctx, env).await,
            (StageKind::Task { task }, StageId::StoreResults) => {
                self.store_results(task, ctx, env).await
            }
            (StageKind::Task { task }, StageId::Notify) => self.notify(task, ctx, env).await,
            (StageKind::Task { task }, _) => {
                let payload = self.payload(ctx);
                let (result, attempts) = self.invoke(task, payload, env).await;
                let outcome = match result.and_then(|raw| self.shape_output(task, raw)) {
                    Ok(value) => StageOutcome::success(self.id, value),
                    Err(e) => StageOutcome::Failed(e),
                };
                Ok(StageExecution { outcome, attempts })
            }
            (StageKind::Local, _) => {
                let value = self.run_local(ctx)?;
                Ok(StageExecution {
                    outcome: StageOutcome::success(self.id, value),
                    attempts: 1,
                })
            }
        }
    }

    /// The task payload: every declared input plus stage-specific extras.
    fn payload(&self, ctx: &Context) -> Value {
        let mut payload = ctx.project(
            self.inputs
                .iter()
                .chain(self.optional_inputs.iter())
                .map(String::as_str),
        );
        if let (Some(turn), Value::Object(obj)) = (self.id.turn(), &mut payload) {
            obj.insert("turnNumber".into(), json!(turn.number()));
            if let StageId::PrepareTurnPrompt(_) = self.id {
                obj.insert("includeImage".into(), json!(turn.include_image()));
                if turn == Turn::Two {
                    let previous = ctx
                        .get(Turn::One.analysis_key())
                        .cloned()
                        .unwrap_or(Value::Null);
                    obj.insert("previousContext".into(), previous);
                }
            }
        }
        payload
    }

    /// Invoke the task with per-attempt timeout and the stage's retry policy.
    async fn invoke(
        &self,
        task: &str,
        payload: Value,
        env: &StageEnv<'_>,
    ) -> (std::result::Result<Value, TaskError>, u32) {
        let stage = self.id.to_string();
        let retried = with_retry(
            &self.retry,
            || {
                let payload = payload.clone();
                async move {
                    match tokio::time::timeout(env.task_timeout, env.tasks.invoke(task, payload))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TaskError::timeout(
                            task,
                            format!("no response within {}s", env.task_timeout.as_secs()),
                        )),
                    }
                }
            },
            |attempt, e| {
                env.publish(WorkflowEvent::StageRetried {
                    run_id: env.run_id.to_string(),
                    stage: stage.clone(),
                    attempt,
                    error: e.clone(),
                })
            },
        )
        .await;
        (retried.result, retried.attempts)
    }

    /// Validate and normalize a task response before it enters the context.
    fn shape_output(&self, task: &str, raw: Value) -> std::result::Result<Value, TaskError> {
        match self.id {
            StageId::FetchHistoricalVerification => {
                serde_json::from_value::<HistoricalContext>(raw.clone()).map_err(|e| {
                    TaskError::validation(task, format!("malformed historical context: {}", e))
                })?;
                Ok(raw)
            }
            StageId::ExecuteTurn(_) => {
                serde_json::from_value::<TurnResponse>(raw.clone()).map_err(|e| {
                    TaskError::validation(task, format!("malformed turn response: {}", e))
                })?;
                Ok(raw)
            }
            StageId::FinalizeResults => {
                let mut result: FinalResult = serde_json::from_value(raw)
                    .map_err(|e| TaskError::validation(task, format!("malformed final result: {}", e)))?;
                result.normalize();
                serde_json::to_value(result).map_err(|e| TaskError::unknown(task, e.to_string()))
            }
            _ => Ok(raw),
        }
    }

    /// Assign the verification id once, then let the task enrich the
    /// verification context without touching the id.
    async fn initialize(
        &self,
        task: &str,
        ctx: &Context,
        env: &StageEnv<'_>,
    ) -> Result<StageExecution> {
        let verification_id = match ctx.verification_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => VerificationId::new().to_string(),
        };
        let verification_at = ctx
            .get(&format!("{}.verificationAt", paths::VERIFICATION_CONTEXT))
            .cloned()
            .unwrap_or_else(|| json!(Utc::now()));
        let assigned = json!({
            "verificationId": verification_id,
            "verificationAt": verification_at,
        });

        let mut payload = self.payload(ctx);
        if let Some(vc) = payload
            .get_mut(paths::VERIFICATION_CONTEXT)
            .and_then(Value::as_object_mut)
        {
            vc.insert("verificationId".into(), assigned["verificationId"].clone());
            vc.insert("verificationAt".into(), assigned["verificationAt"].clone());
        }

        let (result, attempts) = self.invoke(task, payload, env).await;
        let outcome = match result {
            Ok(raw) => {
                let mut enriched = match raw {
                    Value::Object(obj) => obj,
                    Value::Null => serde_json::Map::new(),
                    other => {
                        return Ok(StageExecution {
                            outcome: StageOutcome::Failed(TaskError::validation(
                                task,
                                format!("expected an object, got {}", other),
                            )),
                            attempts,
                        })
                    }
                };
                enriched.insert("verificationId".into(), assigned["verificationId"].clone());
                enriched.insert("verificationAt".into(), assigned["verificationAt"].clone());
                StageOutcome::success(self.id, Value::Object(enriched))
            }
            Err(e) => StageOutcome::Failed(e),
        };
        Ok(StageExecution { outcome, attempts })
    }

    /// Hand the result to the storage task and the sink. Never fails: a
    /// storage problem is recorded in the output instead.
    async fn store_results(
        &self,
        task: &str,
        ctx: &Context,
        env: &StageEnv<'_>,
    ) -> Result<StageExecution> {
        let (result, attempts) = self.invoke(task, self.payload(ctx), env).await;
        let mut storage = match result {
            Ok(Value::Object(obj)) => obj,
            Ok(Value::Null) => serde_json::Map::new(),
            Ok(other) => {
                let mut obj = serde_json::Map::new();
                obj.insert("response".into(), other);
                obj
            }
            Err(e) => {
                warn!(run_id = %env.run_id, error = %e, "Result storage task failed");
                let mut obj = serde_json::Map::new();
                obj.insert("error".into(), serde_json::to_value(&e)?);
                obj
            }
        };

        let mut final_result: FinalResult = ctx.read_as(paths::FINAL_RESULTS)?;
        if let Some(url) = storage.get("resultImageUrl").and_then(Value::as_str) {
            final_result.result_image_url = Some(url.to_string());
        }

        let persisted = match env.sink.store(&final_result, ctx).await {
            Ok(()) => true,
            Err(e) => {
                error!(run_id = %env.run_id, error = %e, "Persistence sink rejected result");
                false
            }
        };
        storage.insert("persisted".into(), json!(persisted));

        // A stored failure keeps its VERIFICATION_FAILED status.
        let status = if final_result.is_failed() {
            None
        } else {
            self.id.success_status()
        };
        Ok(StageExecution {
            outcome: StageOutcome::Continue {
                value: Value::Object(storage),
                status,
            },
            attempts,
        })
    }

    async fn notify(&self, task: &str, ctx: &Context, env: &StageEnv<'_>) -> Result<StageExecution> {
        let (result, attempts) = self.invoke(task, self.payload(ctx), env).await;
        let outcome = match result {
            Ok(value) => {
                if let Err(e) = env.sink.notify(ctx).await {
                    warn!(run_id = %env.run_id, error = %e, "Failed to record notification");
                }
                StageOutcome::success(self.id, value)
            }
            Err(e) => StageOutcome::Failed(e),
        };
        Ok(StageExecution { outcome, attempts })
    }

    fn run_local(&self, ctx: &Context) -> Result<Value> {
        match self.id {
            StageId::InitializeConversationState => {
                Ok(serde_json::to_value(ConversationState::new())?)
            }
            StageId::UpdateConversationState(turn) => {
                let mut state = ctx.conversation_state()?;
                let response: TurnResponse = ctx.read_as(turn.response_key())?;
                let analysis = ctx.read(turn.analysis_key())?.clone();
                let fallback = ctx
                    .get_str(&format!("{}.currentPrompt", paths::CURRENT_PROMPT))
                    .or_else(|| ctx.get_str(paths::CURRENT_PROMPT))
                    .unwrap_or_default();
                let record = TurnRecord::from_response(turn, &response, fallback);
                state.record_turn(turn, record, analysis)?;
                debug!(turn = turn.number(), "Conversation state updated");
                Ok(serde_json::to_value(state)?)
            }
            StageId::WorkflowComplete => completion_summary(ctx),
            StageId::HandleBedrockError(turn) => recovery::handle_bedrock_error(ctx, turn),
            StageId::FinalizeWithError(turn) => recovery::finalize_with_error(ctx, turn),
            id if id.is_early_failure_marker() => recovery::mark_early_failure(ctx, id),
            other => Err(vendflow_core::VendflowError::InvalidWorkflow(format!(
                "stage {} has no local implementation",
                other
            ))),
        }
    }
}

/// The summary emitted by `WorkflowComplete`.
fn completion_summary(ctx: &Context) -> Result<Value> {
    let vc = ctx.verification_context()?;
    let result: FinalResult = ctx.read_as(paths::FINAL_RESULTS)?;
    let image_url = ctx
        .get_str(&format!("{}.resultImageUrl", paths::STORAGE_RESULT))
        .map(String::from)
        .or(result.result_image_url.clone());
    Ok(json!({
        "verificationId": vc.verification_id,
        "verificationType": vc.verification_type,
        "status": WorkflowStatus::Completed.as_str(),
        "timestamp": Utc::now(),
        "result": {
            "verificationStatus": result.verification_status,
            "resultImageUrl": image_url,
            "confidenceScore": result.confidence_score,
            "discrepanciesCount": result.discrepancies_count,
        }
    }))
}

/// What a stage produced.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Merge `value` at the stage's output path and record `status`.
    Continue {
        value: Value,
        status: Option<WorkflowStatus>,
    },
    /// Surface the failure to the transition graph.
    Failed(TaskError),
}

impl StageOutcome {
    fn success(id: StageId, value: Value) -> Self {
        StageOutcome::Continue {
            value,
            status: id.success_status(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageExecution {
    pub outcome: StageOutcome,
    /// Task attempts made, including retries. Local stages report 1.
    pub attempts: u32,
}

/// Collaborators a stage needs while running.
pub struct StageEnv<'a> {
    pub tasks: &'a dyn TaskExecutor,
    pub sink: &'a dyn PersistenceSink,
    pub task_timeout: Duration,
    pub events: Option<&'a EventBus>,
    pub run_id: &'a str,
}

impl StageEnv<'_> {
    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = self.events {
            bus.publish(event);
        }
    }
}
