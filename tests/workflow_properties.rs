use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use vendflow_core::config::WorkflowConfig;
use vendflow_core::error::TaskError;
use vendflow_core::types::{ErrorCategory, ExecutionOutcome, Turn, VerificationStatus};
use vendflow_core::EventBus;
use vendflow_engine::{RetryPolicy, RunLogger, StageId, Workflow, WorkflowExecutor};
use vendflow_store::SqliteResultStore;
use vendflow_test_utils::{layout_request, previous_request, RecordingSink, ScriptedTaskExecutor};

fn executor_with(
    tasks: Arc<ScriptedTaskExecutor>,
    sink: Arc<RecordingSink>,
    config: WorkflowConfig,
) -> WorkflowExecutor {
    let workflow = Workflow::verification(&RetryPolicy::immediate(3)).expect("workflow");
    WorkflowExecutor::new(workflow, tasks, sink, config)
}

fn executor(tasks: Arc<ScriptedTaskExecutor>, sink: Arc<RecordingSink>) -> WorkflowExecutor {
    executor_with(tasks, sink, WorkflowConfig::default())
}

#[tokio::test]
async fn test_layout_run_with_notification_visits_every_stage_in_order() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let request = layout_request().with_notification(true);

    let record = executor(tasks, sink.clone())
        .run_request(&request)
        .await
        .expect("run");

    use StageId::*;
    assert_eq!(
        record.stage_sequence(),
        vec![
            Initialize,
            FetchImages,
            PrepareSystemPrompt,
            InitializeConversationState,
            PrepareTurnPrompt(Turn::One),
            ExecuteTurn(Turn::One),
            ProcessTurnResponse(Turn::One),
            UpdateConversationState(Turn::One),
            PrepareTurnPrompt(Turn::Two),
            ExecuteTurn(Turn::Two),
            ProcessTurnResponse(Turn::Two),
            UpdateConversationState(Turn::Two),
            FinalizeResults,
            StoreResults,
            Notify,
            WorkflowComplete,
        ]
    );
    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    assert!(record.stored);

    let result = record.final_result.expect("final result");
    assert_eq!(result.verification_status, VerificationStatus::Incorrect);
    assert_eq!(result.discrepancies_count, 1);
    let id = record.verification_id.expect("verification id");
    assert_eq!(
        result.result_image_url.as_deref(),
        Some(format!("s3://results/{}.png", id).as_str())
    );
    assert_eq!(sink.notified(), vec![Some(id)]);
}

#[tokio::test]
async fn test_every_post_fetch_failure_persists_a_failed_result() {
    let failing_tasks = [
        "prepare_system_prompt",
        "prepare_turn_prompt",
        "invoke_bedrock",
        "process_turn1_response",
        "process_turn2_response",
        "finalize_results",
    ];

    for task in failing_tasks {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        tasks.fail_always(task, TaskError::validation(task, "rejected"));
        let sink = Arc::new(RecordingSink::new());

        let record = executor(tasks, sink.clone())
            .run_request(&layout_request().with_notification(true))
            .await
            .expect("run");

        assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial, "{}", task);
        assert!(record.stored, "{}", task);
        assert!(!record.visited(StageId::Notify), "{}", task);
        let stored = sink.stored();
        assert_eq!(stored.len(), 1, "{}", task);
        assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
        let error = stored[0].error.as_ref().expect("error descriptor");
        assert_eq!(error.category, ErrorCategory::Validation);
        assert_eq!(record.context.status(), Some("VERIFICATION_FAILED"));
    }
}

#[tokio::test]
async fn test_turn_two_sees_turn_one_analysis() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink)
        .run_request(&layout_request())
        .await
        .expect("run");

    let bedrock_turns: Vec<u64> = tasks
        .calls("invoke_bedrock")
        .iter()
        .map(|p| p["turnNumber"].as_u64().unwrap())
        .collect();
    assert_eq!(bedrock_turns, vec![1, 2]);

    let prompts = tasks.calls("prepare_turn_prompt");
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0]["includeImage"], json!("reference"));
    assert!(prompts[0].get("previousContext").is_none());
    assert_eq!(prompts[1]["includeImage"], json!("checking"));
    assert_eq!(
        prompts[1]["previousContext"],
        json!({ "machineStructure": { "rows": 6, "columnsPerRow": 10 } })
    );

    let state = record.context.conversation_state().expect("state");
    let turns: Vec<u32> = state.history.iter().map(|t| t.turn_id).collect();
    assert_eq!(turns, vec![1, 2]);
    assert!(state.is_complete());
}

#[tokio::test]
async fn test_branch_follows_verification_type() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let record = executor(tasks.clone(), sink)
        .run_request(&previous_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    assert_eq!(
        &record.stage_sequence()[..3],
        &[
            StageId::Initialize,
            StageId::FetchHistoricalVerification,
            StageId::FetchImages
        ]
    );
    assert_eq!(tasks.call_count("fetch_historical_verification"), 1);
    let images_payload = &tasks.calls("fetch_images")[0];
    assert_eq!(
        images_payload["historicalContext"]["previousVerificationId"],
        json!("verif-20250301120000-1a2b3c4d")
    );

    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let record = executor(tasks.clone(), sink)
        .run_request(&layout_request())
        .await
        .expect("run");
    assert!(!record.visited(StageId::FetchHistoricalVerification));
    assert_eq!(tasks.call_count("fetch_historical_verification"), 0);
}

#[tokio::test]
async fn test_historical_fetch_failure_ends_early() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.fail_always(
        "fetch_historical_verification",
        TaskError::validation("fetch_historical_verification", "no previous verification"),
    );
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink.clone())
        .run_request(&previous_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::FailedEarly);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("Failed to retrieve historical verification data")
    );
    assert_eq!(tasks.call_count("fetch_images"), 0);
    assert!(sink.stored().is_empty());
}

#[tokio::test]
async fn test_verification_id_is_stable_across_stages() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    // A task answering with its own id must not replace the assigned one.
    tasks.respond("initialize", json!({ "verificationId": "verif-hijacked" }));
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request())
        .await
        .expect("run");

    let id = record.verification_id.clone().expect("id");
    assert!(id.starts_with("verif-"));
    assert_ne!(id, "verif-hijacked");

    for (task, payload) in tasks.invocations() {
        if let Some(seen) = payload["verificationContext"]["verificationId"].as_str() {
            assert_eq!(seen, id, "{}", task);
        }
    }
    let stored_ctx = &sink.stored_contexts()[0];
    assert_eq!(stored_ctx.verification_id(), Some(id.as_str()));
}

#[tokio::test]
async fn test_verification_ids_unique_and_preassigned_kept() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let exec = executor(tasks, sink);

    let first = exec.run_request(&layout_request()).await.expect("run");
    let second = exec.run_request(&layout_request()).await.expect("run");
    assert_ne!(first.verification_id, second.verification_id);
    assert_ne!(first.run_id, second.run_id);

    let mut request = layout_request();
    request.verification_id = Some("verif-20250401090000-deadbeef".into());
    let resumed = exec.run_request(&request).await.expect("run");
    assert_eq!(
        resumed.verification_id.as_deref(),
        Some("verif-20250401090000-deadbeef")
    );
}

#[tokio::test]
async fn test_turn_two_failure_keeps_reference_analysis() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.fail_on_call(
        "invoke_bedrock",
        2,
        TaskError::unknown("invoke_bedrock", "model error"),
    );
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request().with_notification(true))
        .await
        .expect("run");

    assert!(record.visited(StageId::HandleBedrockError(Turn::Two)));
    assert!(record.visited(StageId::FinalizeWithError(Turn::Two)));
    assert!(!record.visited(StageId::ProcessTurnResponse(Turn::Two)));
    assert!(!record.visited(StageId::Notify));
    assert_eq!(tasks.call_count("notify"), 0);

    let stored = sink.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
    assert_eq!(
        stored[0].reference_analysis,
        Some(json!({ "machineStructure": { "rows": 6, "columnsPerRow": 10 } }))
    );
    let error = stored[0].error.as_ref().expect("error");
    assert_eq!(error.category, ErrorCategory::Unknown);
    assert_eq!(error.turn, Some(Turn::Two));
}

#[tokio::test]
async fn test_notification_gating() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request())
        .await
        .expect("run");
    assert!(!record.visited(StageId::Notify));
    assert_eq!(tasks.call_count("notify"), 0);
    assert!(sink.notified().is_empty());

    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request().with_notification(true))
        .await
        .expect("run");
    assert!(record.visited(StageId::Notify));
    assert_eq!(tasks.call_count("notify"), 1);
    assert_eq!(sink.notified().len(), 1);
}

#[tokio::test]
async fn test_notify_failure_still_completes() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.fail_always("notify", TaskError::throttled("notify", "slow down"));
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request().with_notification(true))
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    assert!(record.stored);
    // Notify is never retried.
    assert_eq!(tasks.call_count("notify"), 1);
    assert!(sink.notified().is_empty());
    assert_eq!(
        record.context.get_str("error.stage"),
        Some("Notify")
    );
}

#[tokio::test]
async fn test_throttled_task_retried_until_success() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.fail_times(
        "invoke_bedrock",
        2,
        TaskError::throttled("invoke_bedrock", "rate exceeded"),
    );
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink)
        .run_request(&layout_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    let turn1 = record
        .stage_result(StageId::ExecuteTurn(Turn::One))
        .expect("turn 1 result");
    assert!(turn1.succeeded);
    assert_eq!(turn1.attempts, 3);
    assert_eq!(tasks.call_count("invoke_bedrock"), 4);
}

#[tokio::test]
async fn test_validation_failure_not_retried() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.fail_on_call(
        "invoke_bedrock",
        1,
        TaskError::validation("invoke_bedrock", "malformed prompt"),
    );
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink)
        .run_request(&layout_request())
        .await
        .expect("run");

    let turn1 = record
        .stage_result(StageId::ExecuteTurn(Turn::One))
        .expect("turn 1 result");
    assert!(!turn1.succeeded);
    assert_eq!(turn1.attempts, 1);
    assert_eq!(tasks.call_count("invoke_bedrock"), 1);
    assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
}

#[tokio::test]
async fn test_workflow_deadline_routes_to_recovery() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.delay("prepare_turn_prompt", Duration::from_secs(5));
    let sink = Arc::new(RecordingSink::new());
    let config = WorkflowConfig {
        timeout_secs: 1,
        ..WorkflowConfig::default()
    };

    let record = executor_with(tasks.clone(), sink.clone(), config)
        .run_request(&layout_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
    assert!(record.visited(StageId::FinalizeWithError(Turn::One)));
    assert_eq!(tasks.call_count("invoke_bedrock"), 0);
    let prompt = record
        .stage_result(StageId::PrepareTurnPrompt(Turn::One))
        .expect("prompt stage");
    assert!(!prompt.succeeded);

    let stored = sink.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Timeout)
    );
}

#[tokio::test]
async fn test_failing_sink_reported_not_routed() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::failing());

    let record = executor(tasks, sink)
        .run_request(&layout_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    assert!(!record.stored);
    assert!(record.final_result.is_some());
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let exec = executor(tasks, sink.clone());

    let layout = layout_request();
    let previous = previous_request();
    let (a, b) = tokio::join!(exec.run_request(&layout), exec.run_request(&previous));
    let (a, b) = (a.expect("run a"), b.expect("run b"));

    assert_ne!(a.verification_id, b.verification_id);
    assert!(!a.visited(StageId::FetchHistoricalVerification));
    assert!(b.visited(StageId::FetchHistoricalVerification));
    assert_eq!(sink.stored().len(), 2);
}

#[tokio::test]
async fn test_sqlite_store_receives_result() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let store = Arc::new(SqliteResultStore::in_memory().expect("store"));
    let workflow = Workflow::verification(&RetryPolicy::immediate(3)).expect("workflow");
    let exec = WorkflowExecutor::new(workflow, tasks, store.clone(), WorkflowConfig::default());

    let record = exec
        .run_request(&layout_request().with_notification(true))
        .await
        .expect("run");
    let id = record.verification_id.expect("id");

    let loaded = store.load(&id).expect("load").expect("stored row");
    assert_eq!(loaded.vending_machine_id, "VM-3245");
    assert_eq!(loaded.verification_type, "LAYOUT_VS_CHECKING");
    assert_eq!(loaded.result.verification_status, VerificationStatus::Incorrect);
    assert_eq!(
        loaded.result.result_image_url,
        Some(format!("s3://results/{}.png", id))
    );
    assert_eq!(store.notifications(&id).expect("notifications").len(), 1);
}

#[tokio::test]
async fn test_run_log_written_per_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let logger = RunLogger::new(dir.path(), 2);

    let bus = Arc::new(EventBus::default());
    let rx = bus.subscribe();
    let handle = tokio::spawn(logger.run(rx, CancellationToken::new()));

    let tasks = Arc::new(ScriptedTaskExecutor::new());
    let sink = Arc::new(RecordingSink::new());
    let exec = executor(tasks, sink).with_event_bus(bus.clone());
    let record = exec.run_request(&layout_request()).await.expect("run");

    drop(exec);
    drop(bus);
    handle.await.expect("logger task");

    let log = std::fs::read_to_string(dir.path().join(format!("{}.jsonl", record.run_id)))
        .expect("log file");
    let lines: Vec<serde_json::Value> = log
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.first().unwrap()["event_type"], json!("run_started"));
    assert_eq!(lines.last().unwrap()["event_type"], json!("run_completed"));
    assert!(lines
        .iter()
        .any(|l| l["event_type"] == json!("stage_completed") && l["stage"] == json!("ExecuteTurn2")));
}

#[tokio::test]
async fn test_malformed_task_payload_persists_a_failed_result() {
    let cases = [
        ("invoke_bedrock", json!("plain text"), StageId::HandleBedrockError(Turn::One)),
        (
            "invoke_bedrock",
            json!({ "response": "ok", "timestamp": "yesterday" }),
            StageId::HandleBedrockError(Turn::One),
        ),
        (
            "finalize_results",
            json!({ "verificationStatus": "MAYBE" }),
            StageId::FinalizeWithError(Turn::Two),
        ),
    ];

    for (task, response, recovery) in cases {
        let tasks = Arc::new(ScriptedTaskExecutor::new());
        tasks.respond(task, response.clone());
        let sink = Arc::new(RecordingSink::new());

        let record = executor(tasks, sink.clone())
            .run_request(&layout_request())
            .await
            .expect("malformed payload must not abort the run");

        assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial, "{}", response);
        assert!(record.visited(recovery), "{}", response);
        assert!(record.stored, "{}", response);
        let stored = sink.stored();
        assert_eq!(stored.len(), 1, "{}", response);
        assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
        let error = stored[0].error.as_ref().expect("error descriptor");
        assert_eq!(error.category, ErrorCategory::Validation, "{}", response);
    }
}

#[tokio::test]
async fn test_turn_prompt_may_change_shape_between_turns() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.respond_on_call(
        "prepare_turn_prompt",
        1,
        json!({ "currentPrompt": "Describe the planogram.", "layoutHints": { "rows": 6 } }),
    );
    tasks.respond_on_call(
        "prepare_turn_prompt",
        2,
        json!("Compare the checking image against the planogram."),
    );
    let sink = Arc::new(RecordingSink::new());

    let record = executor(tasks.clone(), sink.clone())
        .run_request(&layout_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::Completed);
    assert_eq!(sink.stored().len(), 1);
    let bedrock = tasks.calls("invoke_bedrock");
    assert_eq!(
        bedrock[1]["currentPrompt"],
        json!("Compare the checking image against the planogram.")
    );
    let state = record.context.conversation_state().expect("state");
    assert_eq!(state.history[0].prompt, "Describe the planogram.");
    assert_eq!(
        state.history[1].prompt,
        "Compare the checking image against the planogram."
    );
}

#[tokio::test]
async fn test_turn_two_prompt_holds_only_turn_two_fields() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.respond_on_call(
        "prepare_turn_prompt",
        1,
        json!({ "currentPrompt": "Describe the planogram.", "layoutHints": { "rows": 6 } }),
    );
    tasks.respond_on_call(
        "prepare_turn_prompt",
        2,
        json!({ "currentPrompt": "Compare the shelves.", "turnNumber": 2 }),
    );
    let sink = Arc::new(RecordingSink::new());

    executor(tasks.clone(), sink)
        .run_request(&layout_request())
        .await
        .expect("run");

    let bedrock = tasks.calls("invoke_bedrock");
    assert_eq!(bedrock.len(), 2);
    assert_eq!(bedrock[0]["currentPrompt"]["layoutHints"], json!({ "rows": 6 }));
    assert_eq!(
        bedrock[1]["currentPrompt"],
        json!({ "currentPrompt": "Compare the shelves.", "turnNumber": 2 })
    );
}

#[tokio::test]
async fn test_deadline_during_turn_two_keeps_reference_analysis() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.delay("process_turn2_response", Duration::from_secs(5));
    let sink = Arc::new(RecordingSink::new());
    let config = WorkflowConfig {
        timeout_secs: 1,
        ..WorkflowConfig::default()
    };

    let record = executor_with(tasks, sink.clone(), config)
        .run_request(&layout_request())
        .await
        .expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
    assert!(record.visited(StageId::FinalizeWithError(Turn::Two)));
    assert!(!record.visited(StageId::UpdateConversationState(Turn::Two)));

    let stored = sink.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
    assert_eq!(
        stored[0].reference_analysis,
        Some(json!({ "machineStructure": { "rows": 6, "columnsPerRow": 10 } }))
    );
    let error = stored[0].error.as_ref().expect("error");
    assert_eq!(error.category, ErrorCategory::Timeout);
    assert_eq!(error.turn, Some(Turn::Two));
}

#[tokio::test]
async fn test_cancelled_run_persists_a_failed_result() {
    let tasks = Arc::new(ScriptedTaskExecutor::new());
    tasks.delay("prepare_turn_prompt", Duration::from_secs(30));
    let sink = Arc::new(RecordingSink::new());
    let cancel = CancellationToken::new();
    let exec = executor(tasks.clone(), sink.clone()).with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let record = exec.run_request(&layout_request()).await.expect("run");

    assert_eq!(record.outcome, ExecutionOutcome::FailedWithPartial);
    assert!(record.visited(StageId::FinalizeWithError(Turn::One)));
    assert_eq!(record.stage_sequence().last(), Some(&StageId::StoreResults));
    assert_eq!(tasks.call_count("invoke_bedrock"), 0);
    let prompt = record
        .stage_result(StageId::PrepareTurnPrompt(Turn::One))
        .expect("prompt stage");
    assert!(!prompt.succeeded);

    let stored = sink.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].verification_status, VerificationStatus::Failed);
}
