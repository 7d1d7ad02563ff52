use serde::Serialize;

use vendflow_core::context::paths;
use vendflow_core::error::Result;
use vendflow_core::types::VerificationType;
use vendflow_core::Context;

use super::stage::StageId;

/// Where an edge leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Stage(StageId),
    /// The execution ends after the source stage.
    Terminal,
}

/// An edge connecting two stages in the transition graph.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub from: StageId,
    pub to: Target,
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
///
/// `OnFailure` edges are only considered when the source stage failed; every
/// other condition is only considered when it succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    /// `verificationContext.verificationType` equals the given type.
    VerificationType(VerificationType),
    /// `verificationContext.notificationEnabled` equals the given flag.
    NotificationEnabled(bool),
    /// The context holds a FAILED result produced by a recovery stage.
    RecoveryPath,
}

impl Edge {
    pub fn always(from: StageId, to: StageId) -> Self {
        Self::new(from, Target::Stage(to), EdgeCondition::Always)
    }

    pub fn on_success(from: StageId, to: StageId) -> Self {
        Self::new(from, Target::Stage(to), EdgeCondition::OnSuccess)
    }

    pub fn on_failure(from: StageId, to: StageId) -> Self {
        Self::new(from, Target::Stage(to), EdgeCondition::OnFailure)
    }

    pub fn when(from: StageId, to: StageId, condition: EdgeCondition) -> Self {
        Self::new(from, Target::Stage(to), condition)
    }

    /// End the execution after `from` when `condition` holds.
    pub fn terminal(from: StageId, condition: EdgeCondition) -> Self {
        Self::new(from, Target::Terminal, condition)
    }

    fn new(from: StageId, to: Target, condition: EdgeCondition) -> Self {
        Self {
            from,
            to,
            condition,
        }
    }
}

impl EdgeCondition {
    /// Evaluate against the outcome of the source stage and the context.
    ///
    /// An unrecognized verification type is a configuration error, not a
    /// non-match.
    pub fn matches(&self, succeeded: bool, ctx: &Context) -> Result<bool> {
        if matches!(self, EdgeCondition::OnFailure) {
            return Ok(!succeeded);
        }
        if !succeeded {
            return Ok(false);
        }
        Ok(match self {
            EdgeCondition::Always | EdgeCondition::OnSuccess => true,
            EdgeCondition::OnFailure => false,
            EdgeCondition::VerificationType(expected) => {
                let raw = ctx.read(paths::VERIFICATION_TYPE)?;
                let raw = raw.as_str().unwrap_or_default();
                VerificationType::parse(raw)? == *expected
            }
            EdgeCondition::NotificationEnabled(expected) => {
                let enabled = ctx
                    .get(paths::NOTIFICATION_ENABLED)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                enabled == *expected
            }
            EdgeCondition::RecoveryPath => {
                ctx.contains(&format!("{}.error", paths::FINAL_RESULTS))
            }
        })
    }
}

impl std::fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeCondition::Always => f.write_str("always"),
            EdgeCondition::OnSuccess => f.write_str("on success"),
            EdgeCondition::OnFailure => f.write_str("on failure"),
            EdgeCondition::VerificationType(t) => write!(f, "verificationType == {}", t),
            EdgeCondition::NotificationEnabled(b) => write!(f, "notificationEnabled == {}", b),
            EdgeCondition::RecoveryPath => f.write_str("recovery path"),
        }
    }
}
