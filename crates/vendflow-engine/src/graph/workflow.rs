use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use vendflow_core::context::paths;
use vendflow_core::error::{Result, VendflowError};
use vendflow_core::types::{Turn, VerificationType};
use vendflow_core::Context;

use super::edge::{Edge, EdgeCondition, Target};
use super::stage::{Stage, StageId, StageKind};
use crate::retry::RetryPolicy;

/// Context paths present before the first stage runs.
const REQUEST_PATHS: &[&str] = &[
    "verificationContext.verificationType",
    "verificationContext.referenceImageUrl",
    "verificationContext.checkingImageUrl",
    "verificationContext.vendingMachineId",
    "verificationContext.notificationEnabled",
    "verificationContext.layoutId",
    "verificationContext.layoutPrefix",
    "verificationContext.previousVerificationId",
];

/// A validated set of stages and the transitions between them.
#[derive(Debug, Clone)]
pub struct Workflow {
    stages: BTreeMap<StageId, Stage>,
    edges: Vec<Edge>,
    entry: StageId,
}

impl Workflow {
    /// Build and validate a workflow.
    pub fn new(stages: Vec<Stage>, edges: Vec<Edge>, entry: StageId) -> Result<Self> {
        let mut map = BTreeMap::new();
        for stage in stages {
            let id = stage.id;
            if map.insert(id, stage).is_some() {
                return Err(VendflowError::InvalidWorkflow(format!(
                    "stage {} defined twice",
                    id
                )));
            }
        }
        let workflow = Self {
            stages: map,
            edges,
            entry,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// The vending machine verification workflow.
    ///
    /// Stages wrapping external calls retry with `retry`; notification is
    /// attempted once.
    pub fn verification(retry: &RetryPolicy) -> Result<Self> {
        use StageId::*;

        let mut stages = vec![
            Stage::task(Initialize, "initialize")
                .with_inputs([
                    "verificationContext.verificationType",
                    "verificationContext.referenceImageUrl",
                    "verificationContext.checkingImageUrl",
                    "verificationContext.vendingMachineId",
                ])
                .with_output(paths::VERIFICATION_CONTEXT),
            Stage::task(FetchHistoricalVerification, "fetch_historical_verification")
                .with_inputs([paths::VERIFICATION_CONTEXT])
                .with_output(paths::HISTORICAL_CONTEXT),
            Stage::task(FetchImages, "fetch_images")
                .with_inputs([paths::VERIFICATION_CONTEXT])
                .with_optional_inputs([paths::HISTORICAL_CONTEXT])
                .with_output(paths::IMAGES),
            Stage::task(PrepareSystemPrompt, "prepare_system_prompt")
                .with_inputs([paths::VERIFICATION_CONTEXT, paths::IMAGES])
                .with_optional_inputs([paths::HISTORICAL_CONTEXT])
                .with_output(paths::SYSTEM_PROMPT),
            Stage::local(InitializeConversationState).with_output(paths::CONVERSATION_STATE),
        ];

        for turn in [Turn::One, Turn::Two] {
            let mut prompt_inputs = vec![
                paths::VERIFICATION_CONTEXT,
                paths::IMAGES,
                paths::SYSTEM_PROMPT,
                paths::CONVERSATION_STATE,
            ];
            let mut process_inputs = vec![paths::VERIFICATION_CONTEXT, turn.response_key()];
            if turn == Turn::Two {
                prompt_inputs.push(Turn::One.analysis_key());
                process_inputs.push(Turn::One.analysis_key());
            }
            stages.extend([
                Stage::task(PrepareTurnPrompt(turn), "prepare_turn_prompt")
                    .with_inputs(prompt_inputs)
                    .with_optional_inputs([paths::HISTORICAL_CONTEXT])
                    .with_output(paths::CURRENT_PROMPT)
                    .replacing_output(),
                Stage::task(ExecuteTurn(turn), "invoke_bedrock")
                    .with_inputs([
                        paths::VERIFICATION_CONTEXT,
                        paths::SYSTEM_PROMPT,
                        paths::CURRENT_PROMPT,
                        paths::CONVERSATION_STATE,
                        paths::IMAGES,
                    ])
                    .with_output(turn.response_key()),
                Stage::task(
                    ProcessTurnResponse(turn),
                    format!("process_turn{}_response", turn.number()),
                )
                .with_inputs(process_inputs)
                .with_optional_inputs([paths::HISTORICAL_CONTEXT])
                .with_output(turn.analysis_key()),
                Stage::local(UpdateConversationState(turn))
                    .with_inputs([
                        paths::CONVERSATION_STATE,
                        turn.response_key(),
                        turn.analysis_key(),
                    ])
                    .with_optional_inputs([paths::CURRENT_PROMPT])
                    .with_output(paths::CONVERSATION_STATE),
                Stage::local(HandleBedrockError(turn))
                    .with_inputs([paths::ERROR])
                    .with_output(paths::ERROR_DETAILS),
                Stage::local(FinalizeWithError(turn))
                    .with_inputs([paths::VERIFICATION_CONTEXT])
                    .with_optional_inputs([
                        paths::ERROR_DETAILS,
                        paths::ERROR,
                        Turn::One.analysis_key(),
                    ])
                    .with_output(paths::FINAL_RESULTS),
            ]);
        }

        stages.extend([
            Stage::task(FinalizeResults, "finalize_results")
                .with_inputs([
                    paths::VERIFICATION_CONTEXT,
                    Turn::One.analysis_key(),
                    Turn::Two.analysis_key(),
                    paths::CONVERSATION_STATE,
                ])
                .with_optional_inputs([paths::HISTORICAL_CONTEXT])
                .with_output(paths::FINAL_RESULTS),
            Stage::task(StoreResults, "store_results")
                .with_inputs([paths::VERIFICATION_CONTEXT, paths::FINAL_RESULTS])
                .with_optional_inputs([
                    paths::CONVERSATION_STATE,
                    paths::HISTORICAL_CONTEXT,
                    paths::ERROR_DETAILS,
                    Turn::One.analysis_key(),
                    Turn::Two.analysis_key(),
                ])
                .with_output(paths::STORAGE_RESULT),
            Stage::task(Notify, "notify")
                .with_inputs([paths::VERIFICATION_CONTEXT, paths::FINAL_RESULTS])
                .with_optional_inputs([paths::STORAGE_RESULT])
                .with_output(paths::NOTIFICATION_RESULT)
                .with_retry(RetryPolicy::none()),
            Stage::local(WorkflowComplete)
                .with_inputs([paths::VERIFICATION_CONTEXT, paths::FINAL_RESULTS])
                .with_optional_inputs([paths::STORAGE_RESULT])
                .with_output(paths::SUMMARY),
            Stage::local(HandleInitializationError).with_output(paths::FAILURE),
            Stage::local(HandleHistoricalFetchError).with_output(paths::FAILURE),
            Stage::local(HandleFetchImagesError).with_output(paths::FAILURE),
        ]);

        for stage in stages.iter_mut() {
            if matches!(stage.kind, StageKind::Task { .. }) && stage.id != Notify {
                stage.retry = retry.clone();
            }
        }

        Self::new(stages, verification_edges(), Initialize)
    }

    pub fn entry(&self) -> StageId {
        self.entry
    }

    pub fn stage(&self, id: StageId) -> Result<&Stage> {
        self.stages
            .get(&id)
            .ok_or_else(|| VendflowError::StageNotFound(id.to_string()))
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    /// Follow the first matching outgoing edge of `current`.
    pub fn next(&self, current: StageId, succeeded: bool, ctx: &Context) -> Result<Target> {
        for edge in self.edges.iter().filter(|e| e.from == current) {
            if edge.condition.matches(succeeded, ctx)? {
                debug!(from = %current, condition = %edge.condition, "Taking transition");
                return Ok(edge.to);
            }
        }
        Err(VendflowError::InvalidWorkflow(format!(
            "no transition from {} ({})",
            current,
            if succeeded { "succeeded" } else { "failed" }
        )))
    }

    /// Where to go when `stage` is interrupted: by the workflow deadline,
    /// by cancellation, or by output the stage cannot use.
    pub fn recovery_route(&self, stage: StageId) -> StageId {
        if let Some(marker) = stage.early_failure_marker() {
            return marker;
        }
        match stage {
            StageId::Notify => StageId::WorkflowComplete,
            other => StageId::FinalizeWithError(other.recovery_turn()),
        }
    }

    /// Structural checks run once at build time.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(VendflowError::InvalidWorkflow(msg)) };

        if !self.stages.contains_key(&self.entry) {
            return invalid(format!("entry stage {} is not defined", self.entry));
        }

        for edge in &self.edges {
            if !self.stages.contains_key(&edge.from) {
                return invalid(format!("edge from undefined stage {}", edge.from));
            }
            if let Target::Stage(to) = edge.to {
                if !self.stages.contains_key(&to) {
                    return invalid(format!("edge {} -> {} targets an undefined stage", edge.from, to));
                }
            }
        }

        for stage in self.stages.values() {
            let outgoing: Vec<&Edge> = self.edges.iter().filter(|e| e.from == stage.id).collect();
            if outgoing.is_empty() {
                return invalid(format!("stage {} has no outgoing transition", stage.id));
            }
            if matches!(stage.kind, StageKind::Task { .. })
                && !outgoing
                    .iter()
                    .any(|e| e.condition == EdgeCondition::OnFailure)
            {
                return invalid(format!("task stage {} has no failure transition", stage.id));
            }
            if stage.id != StageId::Initialize
                && is_under(&stage.output_path, paths::VERIFICATION_CONTEXT)
            {
                return invalid(format!(
                    "stage {} writes to {}, which only Initialize may write",
                    stage.id,
                    paths::VERIFICATION_CONTEXT
                ));
            }
        }

        self.check_reachability()?;
        self.check_schema()
    }

    fn check_reachability(&self) -> Result<()> {
        let mut seen = HashSet::from([self.entry]);
        let mut frontier = vec![self.entry];
        while let Some(id) = frontier.pop() {
            let targets = self
                .edges
                .iter()
                .filter(|e| e.from == id)
                .filter_map(|e| match e.to {
                    Target::Stage(to) => Some(to),
                    Target::Terminal => None,
                })
                // Recovery routes are reachable without an explicit edge.
                .chain(id.honors_deadline().then(|| self.recovery_route(id)));
            for to in targets {
                if seen.insert(to) {
                    frontier.push(to);
                }
            }
        }
        match self.stages.keys().find(|id| !seen.contains(id)) {
            Some(orphan) => Err(VendflowError::InvalidWorkflow(format!(
                "stage {} is unreachable",
                orphan
            ))),
            None => Ok(()),
        }
    }

    /// Every required input must be produced by the request or some stage.
    fn check_schema(&self) -> Result<()> {
        let mut produced: Vec<&str> = REQUEST_PATHS.to_vec();
        produced.push(paths::ERROR);
        produced.extend(self.stages.values().map(|s| s.output_path.as_str()));

        for stage in self.stages.values() {
            for input in &stage.inputs {
                let known = produced
                    .iter()
                    .any(|p| is_under(input, p) || (!p.is_empty() && is_under(p, input)));
                if !known {
                    return Err(VendflowError::InvalidWorkflow(format!(
                        "stage {} reads {}, which nothing writes",
                        stage.id, input
                    )));
                }
            }
        }
        Ok(())
    }

    /// Human-readable listing of the stages and transitions.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stage in self.stages.values() {
            let kind = match &stage.kind {
                StageKind::Task { task } => format!("task {}", task),
                StageKind::Local => "local".to_string(),
            };
            out.push_str(&format!(
                "{} [{}] -> {}\n",
                stage.id,
                kind,
                if stage.output_path.is_empty() {
                    "<root>"
                } else {
                    &stage.output_path
                }
            ));
            for edge in self.edges.iter().filter(|e| e.from == stage.id) {
                let to = match edge.to {
                    Target::Stage(id) => id.to_string(),
                    Target::Terminal => "END".to_string(),
                };
                out.push_str(&format!("    {} => {}\n", edge.condition, to));
            }
        }
        out
    }
}

/// Whether `path` equals `root` or lies beneath it.
fn is_under(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn verification_edges() -> Vec<Edge> {
    use StageId::*;

    let mut edges = vec![
        Edge::when(
            Initialize,
            FetchHistoricalVerification,
            EdgeCondition::VerificationType(VerificationType::PreviousVsCurrent),
        ),
        Edge::when(
            Initialize,
            FetchImages,
            EdgeCondition::VerificationType(VerificationType::LayoutVsChecking),
        ),
        Edge::on_failure(Initialize, HandleInitializationError),
        Edge::on_success(FetchHistoricalVerification, FetchImages),
        Edge::on_failure(FetchHistoricalVerification, HandleHistoricalFetchError),
        Edge::on_success(FetchImages, PrepareSystemPrompt),
        Edge::on_failure(FetchImages, HandleFetchImagesError),
        Edge::on_success(PrepareSystemPrompt, InitializeConversationState),
        Edge::on_failure(PrepareSystemPrompt, FinalizeWithError(Turn::One)),
        Edge::always(InitializeConversationState, PrepareTurnPrompt(Turn::One)),
    ];

    for turn in [Turn::One, Turn::Two] {
        let after_turn = match turn {
            Turn::One => PrepareTurnPrompt(Turn::Two),
            Turn::Two => FinalizeResults,
        };
        edges.extend([
            Edge::on_success(PrepareTurnPrompt(turn), ExecuteTurn(turn)),
            Edge::on_failure(PrepareTurnPrompt(turn), FinalizeWithError(turn)),
            Edge::on_success(ExecuteTurn(turn), ProcessTurnResponse(turn)),
            Edge::on_failure(ExecuteTurn(turn), HandleBedrockError(turn)),
            Edge::on_success(ProcessTurnResponse(turn), UpdateConversationState(turn)),
            Edge::on_failure(ProcessTurnResponse(turn), FinalizeWithError(turn)),
            Edge::always(UpdateConversationState(turn), after_turn),
            Edge::always(HandleBedrockError(turn), FinalizeWithError(turn)),
            Edge::always(FinalizeWithError(turn), StoreResults),
        ]);
    }

    edges.extend([
        Edge::on_success(FinalizeResults, StoreResults),
        Edge::on_failure(FinalizeResults, FinalizeWithError(Turn::Two)),
        // A stored failure ends the execution; success continues to notification.
        Edge::terminal(StoreResults, EdgeCondition::RecoveryPath),
        Edge::when(StoreResults, Notify, EdgeCondition::NotificationEnabled(true)),
        Edge::always(StoreResults, WorkflowComplete),
        Edge::on_failure(StoreResults, WorkflowComplete),
        Edge::always(Notify, WorkflowComplete),
        Edge::on_failure(Notify, WorkflowComplete),
        Edge::terminal(WorkflowComplete, EdgeCondition::Always),
        Edge::terminal(HandleInitializationError, EdgeCondition::Always),
        Edge::terminal(HandleHistoricalFetchError, EdgeCondition::Always),
        Edge::terminal(HandleFetchImagesError, EdgeCondition::Always),
    ]);
    edges
}
