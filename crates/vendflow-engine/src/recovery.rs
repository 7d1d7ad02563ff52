//! Recovery stages: error classification, FAILED results, early-failure markers.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use vendflow_core::context::paths;
use vendflow_core::error::{Result, TaskError, TaskErrorKind};
use vendflow_core::types::{
    CaughtError, ErrorCategory, ErrorDescriptor, ErrorSeverity, FinalResult, Turn,
};
use vendflow_core::Context;

use crate::graph::StageId;

/// Turn a caught task failure into a structured descriptor.
pub fn classify(caught: &CaughtError, turn: Option<Turn>) -> ErrorDescriptor {
    let (category, severity) = match caught.error.kind {
        TaskErrorKind::Throttled => (ErrorCategory::Throttling, ErrorSeverity::Medium),
        TaskErrorKind::ValidationFailed => (ErrorCategory::Validation, ErrorSeverity::High),
        TaskErrorKind::Timeout => (ErrorCategory::Timeout, ErrorSeverity::Medium),
        TaskErrorKind::Unknown => (ErrorCategory::Unknown, ErrorSeverity::Critical),
    };
    ErrorDescriptor {
        stage: caught.stage.clone(),
        turn,
        category,
        retryable: caught.error.is_retryable(),
        severity,
        message: caught.error.message.clone(),
        timestamp: Utc::now(),
    }
}

fn caught_error(ctx: &Context) -> Option<CaughtError> {
    let value = ctx.get(paths::ERROR)?.clone();
    match serde_json::from_value(value) {
        Ok(caught) => Some(caught),
        Err(e) => {
            warn!(error = %e, "Unreadable error record in context");
            None
        }
    }
}

/// `HandleBedrockError`: classify the error caught from `ExecuteTurnN`.
pub fn handle_bedrock_error(ctx: &Context, turn: Turn) -> Result<Value> {
    let caught = caught_error(ctx).unwrap_or_else(|| CaughtError {
        stage: StageId::ExecuteTurn(turn).to_string(),
        error: TaskError::unknown("invoke_bedrock", "no error details recorded"),
    });
    Ok(serde_json::to_value(classify(&caught, Some(turn)))?)
}

/// `FinalizeWithError`: a FAILED result carrying the partial turn-1 analysis.
pub fn finalize_with_error(ctx: &Context, turn: Turn) -> Result<Value> {
    let descriptor = match ctx.get(paths::ERROR_DETAILS) {
        Some(details) => serde_json::from_value(details.clone())?,
        None => match caught_error(ctx) {
            Some(caught) => classify(&caught, Some(turn)),
            None => classify(
                &CaughtError {
                    stage: format!("turn {}", turn),
                    error: TaskError::unknown("workflow", "verification failed"),
                },
                Some(turn),
            ),
        },
    };
    let reference_analysis = ctx.get(Turn::One.analysis_key()).cloned();
    Ok(serde_json::to_value(FinalResult::failed(
        descriptor,
        reference_analysis,
    ))?)
}

/// Terminal marker for failures before data collection finished.
pub fn mark_early_failure(ctx: &Context, marker: StageId) -> Result<Value> {
    let reason = match marker {
        StageId::HandleInitializationError => "Failed to initialize verification process",
        StageId::HandleHistoricalFetchError => "Failed to retrieve historical verification data",
        _ => "Failed to fetch images or metadata",
    };
    Ok(json!({
        "status": "FAILED",
        "reason": reason,
        "stage": marker.to_string(),
        "error": ctx.get(paths::ERROR).cloned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vendflow_core::types::VerificationStatus;

    fn ctx_with_error(kind: TaskErrorKind) -> Context {
        let mut ctx = Context::new();
        ctx.merge_as(
            paths::ERROR,
            &CaughtError {
                stage: "ExecuteTurn2".into(),
                error: TaskError::new("invoke_bedrock", kind, "model unavailable"),
            },
        )
        .unwrap();
        ctx
    }

    #[test]
    fn test_classify_categories() {
        let caught = CaughtError {
            stage: "ExecuteTurn1".into(),
            error: TaskError::throttled("invoke_bedrock", "rate"),
        };
        let d = classify(&caught, Some(Turn::One));
        assert_eq!(d.category, ErrorCategory::Throttling);
        assert!(d.retryable);
        assert_eq!(d.turn, Some(Turn::One));

        let caught = CaughtError {
            stage: "FetchImages".into(),
            error: TaskError::validation("fetch_images", "bad"),
        };
        let d = classify(&caught, None);
        assert_eq!(d.category, ErrorCategory::Validation);
        assert!(!d.retryable);
        assert_eq!(d.severity, ErrorSeverity::High);
    }

    #[test]
    fn test_turn_two_failure_keeps_reference_analysis() {
        let mut ctx = ctx_with_error(TaskErrorKind::Timeout);
        ctx.merge("referenceAnalysis", json!({"rows": 6})).unwrap();
        let details = handle_bedrock_error(&ctx, Turn::Two).unwrap();
        ctx.merge(paths::ERROR_DETAILS, details).unwrap();

        let result: FinalResult =
            serde_json::from_value(finalize_with_error(&ctx, Turn::Two).unwrap()).unwrap();
        assert_eq!(result.verification_status, VerificationStatus::Failed);
        assert_eq!(result.reference_analysis, Some(json!({"rows": 6})));
        let error = result.error.unwrap();
        assert_eq!(error.category, ErrorCategory::Timeout);
        assert_eq!(error.stage, "ExecuteTurn2");
    }

    #[test]
    fn test_turn_one_failure_has_no_analysis() {
        let ctx = ctx_with_error(TaskErrorKind::Unknown);
        let result: FinalResult =
            serde_json::from_value(finalize_with_error(&ctx, Turn::One).unwrap()).unwrap();
        assert!(result.reference_analysis.is_none());
        assert_eq!(result.error.unwrap().category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_early_marker() {
        let ctx = ctx_with_error(TaskErrorKind::ValidationFailed);
        let marker = mark_early_failure(&ctx, StageId::HandleFetchImagesError).unwrap();
        assert_eq!(marker["status"], json!("FAILED"));
        assert_eq!(marker["reason"], json!("Failed to fetch images or metadata"));
        assert_eq!(marker["error"]["kind"], json!("VALIDATION_FAILED"));
    }
}
