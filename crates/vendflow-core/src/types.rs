use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskError, VendflowError};

/// Number of LLM turns in one verification conversation.
pub const MAX_TURNS: u32 = 2;

/// Unique verification identifier (`verif-YYYYMMDDHHMMSS-xxxxxxxx`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct VerificationId(pub String);

impl VerificationId {
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "verif-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &suffix[..8]
        ))
    }
}

impl Default for VerificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VerificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the checking image is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    /// Compare the checking image against the planogram layout.
    LayoutVsChecking,
    /// Compare the checking image against the previous verification's image.
    PreviousVsCurrent,
}

impl VerificationType {
    pub const LAYOUT_VS_CHECKING: &'static str = "LAYOUT_VS_CHECKING";
    pub const PREVIOUS_VS_CURRENT: &'static str = "PREVIOUS_VS_CURRENT";

    /// Exact, case-sensitive match against the two wire values.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            Self::LAYOUT_VS_CHECKING => Ok(Self::LayoutVsChecking),
            Self::PREVIOUS_VS_CURRENT => Ok(Self::PreviousVsCurrent),
            other => Err(VendflowError::UnknownVerificationType(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LayoutVsChecking => Self::LAYOUT_VS_CHECKING,
            Self::PreviousVsCurrent => Self::PREVIOUS_VS_CURRENT,
        }
    }
}

impl std::fmt::Display for VerificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The input a caller hands to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    /// Pre-assigned id, e.g. when an execution is resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,
    /// Kept as the raw string; it is validated at the type branch.
    pub verification_type: String,
    pub reference_image_url: String,
    pub checking_image_url: String,
    pub vending_machine_id: String,
    #[serde(default)]
    pub notification_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
}

impl VerificationRequest {
    pub fn new(
        verification_type: VerificationType,
        reference_image_url: impl Into<String>,
        checking_image_url: impl Into<String>,
        vending_machine_id: impl Into<String>,
    ) -> Self {
        Self {
            verification_id: None,
            verification_type: verification_type.as_str().to_string(),
            reference_image_url: reference_image_url.into(),
            checking_image_url: checking_image_url.into(),
            vending_machine_id: vending_machine_id.into(),
            notification_enabled: false,
            layout_id: None,
            layout_prefix: None,
            previous_verification_id: None,
        }
    }

    pub fn with_notification(mut self, enabled: bool) -> Self {
        self.notification_enabled = enabled;
        self
    }
}

/// Identifies one verification run. Written once by `Initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContext {
    pub verification_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_at: Option<DateTime<Utc>>,
    pub verification_type: String,
    pub reference_image_url: String,
    pub checking_image_url: String,
    pub vending_machine_id: String,
    #[serde(default)]
    pub notification_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
}

/// Summary of the prior verification, present for `PREVIOUS_VS_CURRENT` runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalContext {
    pub previous_verification_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

/// One of the two conversation turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Turn {
    /// Reference image analysis.
    One,
    /// Checking image analysis and comparison.
    Two,
}

impl Turn {
    pub fn number(self) -> u32 {
        match self {
            Turn::One => 1,
            Turn::Two => 2,
        }
    }

    /// Context key the raw LLM response for this turn is written to.
    pub fn response_key(self) -> &'static str {
        match self {
            Turn::One => "turn1Response",
            Turn::Two => "turn2Response",
        }
    }

    /// Context key the processed analysis for this turn is written to.
    pub fn analysis_key(self) -> &'static str {
        match self {
            Turn::One => "referenceAnalysis",
            Turn::Two => "checkingAnalysis",
        }
    }

    /// Which image the prompt for this turn attaches.
    pub fn include_image(self) -> &'static str {
        match self {
            Turn::One => "reference",
            Turn::Two => "checking",
        }
    }

    pub fn analysis_stage(self) -> &'static str {
        match self {
            Turn::One => "REFERENCE_ANALYSIS",
            Turn::Two => "CHECKING_ANALYSIS",
        }
    }
}

impl From<Turn> for u32 {
    fn from(turn: Turn) -> Self {
        turn.number()
    }
}

impl TryFrom<u32> for Turn {
    type Error = String;

    fn try_from(n: u32) -> std::result::Result<Self, Self::Error> {
        match n {
            1 => Ok(Turn::One),
            2 => Ok(Turn::Two),
            other => Err(format!("invalid turn number {}", other)),
        }
    }
}

impl std::fmt::Display for Turn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// The raw result of an `invoke_bedrock` task, as written to `turnNResponse`.
///
/// Every field is optional on the wire; missing values fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnResponse {
    pub turn_id: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub prompt: Option<String>,
    pub response: serde_json::Value,
    pub latency_ms: u64,
    pub token_usage: TokenUsage,
}

impl TurnResponse {
    /// Extract the response text: either a plain string or `{ "content": "..." }`.
    pub fn text(&self) -> String {
        match &self.response {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            serde_json::Value::Object(obj) => match obj.get("content") {
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => self.response.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// One entry in the conversation history. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub turn_id: u32,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
    pub latency_ms: u64,
    pub token_usage: TokenUsage,
    pub analysis_stage: String,
}

impl TurnRecord {
    pub fn from_response(turn: Turn, response: &TurnResponse, fallback_prompt: &str) -> Self {
        let mut usage = response.token_usage;
        if usage.total == 0 {
            usage.total = usage.input + usage.output;
        }
        Self {
            turn_id: turn.number(),
            timestamp: response.timestamp.unwrap_or_else(Utc::now),
            prompt: response
                .prompt
                .clone()
                .unwrap_or_else(|| fallback_prompt.to_string()),
            response: response.text(),
            latency_ms: response.latency_ms,
            token_usage: usage,
            analysis_stage: turn.analysis_stage().to_string(),
        }
    }
}

/// Two-turn conversation accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub current_turn: u32,
    pub max_turns: u32,
    #[serde(default)]
    pub history: Vec<TurnRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_analysis: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checking_analysis: Option<serde_json::Value>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            current_turn: 0,
            max_turns: MAX_TURNS,
            history: Vec::new(),
            reference_analysis: None,
            checking_analysis: None,
        }
    }

    /// Append a turn. Turns must be recorded in order, exactly once each.
    pub fn record_turn(
        &mut self,
        turn: Turn,
        record: TurnRecord,
        analysis: serde_json::Value,
    ) -> Result<()> {
        if turn.number() != self.current_turn + 1 || turn.number() > self.max_turns {
            return Err(VendflowError::ContextConflict {
                path: "conversationState.currentTurn".into(),
                message: format!(
                    "cannot record turn {} when current turn is {}",
                    turn, self.current_turn
                ),
            });
        }
        self.history.push(record);
        match turn {
            Turn::One => self.reference_analysis = Some(analysis),
            Turn::Two => self.checking_analysis = Some(analysis),
        }
        self.current_turn = turn.number();
        Ok(())
    }

    /// The analysis for `turn`, available only once that turn was recorded.
    pub fn analysis(&self, turn: Turn) -> Option<&serde_json::Value> {
        match turn {
            Turn::One => self.reference_analysis.as_ref(),
            Turn::Two => self.checking_analysis.as_ref(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_turn >= self.max_turns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Correct,
    Incorrect,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Correct => "CORRECT",
            VerificationStatus::Incorrect => "INCORRECT",
            VerificationStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
}

/// The terminal artifact of one verification execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
    #[serde(default)]
    pub discrepancies_count: usize,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Partial turn-1 analysis kept on failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_analysis: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl FinalResult {
    /// A FAILED result carrying whatever partial analysis exists.
    pub fn failed(error: ErrorDescriptor, reference_analysis: Option<serde_json::Value>) -> Self {
        Self {
            verification_status: VerificationStatus::Failed,
            discrepancies: Vec::new(),
            discrepancies_count: 0,
            confidence_score: 0.0,
            result_image_url: None,
            summary: Some(error.message.clone()),
            reference_analysis,
            error: Some(error),
        }
    }

    /// Keep `discrepanciesCount` consistent with the listed discrepancies.
    pub fn normalize(&mut self) {
        if !self.discrepancies.is_empty() {
            self.discrepancies_count = self.discrepancies.len();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.verification_status == VerificationStatus::Failed
    }
}

/// Progress marker kept in the context's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    VerificationInitialized,
    HistoricalContextLoaded,
    ImagesFetched,
    PromptPrepared,
    Turn1PromptReady,
    Turn1Completed,
    Turn1Processed,
    Turn2PromptReady,
    Turn2Completed,
    Turn2Processed,
    ResultsFinalized,
    ResultsStored,
    NotificationSent,
    Completed,
    InitializationFailed,
    HistoricalFetchFailed,
    ImageFetchFailed,
    BedrockProcessingFailed,
    VerificationFailed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::VerificationInitialized => "VERIFICATION_INITIALIZED",
            WorkflowStatus::HistoricalContextLoaded => "HISTORICAL_CONTEXT_LOADED",
            WorkflowStatus::ImagesFetched => "IMAGES_FETCHED",
            WorkflowStatus::PromptPrepared => "PROMPT_PREPARED",
            WorkflowStatus::Turn1PromptReady => "TURN1_PROMPT_READY",
            WorkflowStatus::Turn1Completed => "TURN1_COMPLETED",
            WorkflowStatus::Turn1Processed => "TURN1_PROCESSED",
            WorkflowStatus::Turn2PromptReady => "TURN2_PROMPT_READY",
            WorkflowStatus::Turn2Completed => "TURN2_COMPLETED",
            WorkflowStatus::Turn2Processed => "TURN2_PROCESSED",
            WorkflowStatus::ResultsFinalized => "RESULTS_FINALIZED",
            WorkflowStatus::ResultsStored => "RESULTS_STORED",
            WorkflowStatus::NotificationSent => "NOTIFICATION_SENT",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::InitializationFailed => "INITIALIZATION_FAILED",
            WorkflowStatus::HistoricalFetchFailed => "HISTORICAL_FETCH_FAILED",
            WorkflowStatus::ImageFetchFailed => "IMAGE_FETCH_FAILED",
            WorkflowStatus::BedrockProcessingFailed => "BEDROCK_PROCESSING_FAILED",
            WorkflowStatus::VerificationFailed => "VERIFICATION_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Throttling,
    Validation,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured description of a failure, written by the recovery stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<Turn>,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub severity: ErrorSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The failure a stage raised, as recorded in context under `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaughtError {
    pub stage: String,
    #[serde(flatten)]
    pub error: TaskError,
}

/// Downstream-visible execution category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    /// Full result with discrepancies was stored.
    Completed,
    /// A FAILED result with whatever partial analysis existed was stored.
    FailedWithPartial,
    /// Failed before data collection finished; nothing was stored.
    FailedEarly,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "COMPLETED",
            ExecutionOutcome::FailedWithPartial => "FAILED_WITH_PARTIAL",
            ExecutionOutcome::FailedEarly => "FAILED_EARLY",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while a workflow executes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution started.
    RunStarted { run_id: String },
    /// A stage began executing.
    StageStarted { run_id: String, stage: String },
    /// A stage attempt failed with a retryable error and will be retried.
    StageRetried {
        run_id: String,
        stage: String,
        attempt: u32,
        error: TaskError,
    },
    /// A stage finished successfully.
    StageCompleted {
        run_id: String,
        stage: String,
        elapsed_ms: u64,
    },
    /// A stage surfaced a failure to the transition graph.
    StageFailed {
        run_id: String,
        stage: String,
        error: TaskError,
    },
    /// The workflow deadline elapsed while a stage was in flight.
    DeadlineExceeded { run_id: String, stage: String },
    /// The execution reached a terminal stage.
    RunCompleted {
        run_id: String,
        verification_id: Option<String>,
        outcome: ExecutionOutcome,
        stored: bool,
    },
    /// The execution aborted on a configuration error.
    RunAborted { run_id: String, error: String },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &str {
        match self {
            WorkflowEvent::RunStarted { run_id }
            | WorkflowEvent::StageStarted { run_id, .. }
            | WorkflowEvent::StageRetried { run_id, .. }
            | WorkflowEvent::StageCompleted { run_id, .. }
            | WorkflowEvent::StageFailed { run_id, .. }
            | WorkflowEvent::DeadlineExceeded { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunAborted { run_id, .. } => run_id,
        }
    }

    /// Whether this event ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunCompleted { .. } | WorkflowEvent::RunAborted { .. }
        )
    }
}
