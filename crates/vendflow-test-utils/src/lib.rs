//! Shared test utilities for vendflow crates: a scriptable task executor,
//! a recording persistence sink, and request fixtures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use vendflow_core::error::{Result, TaskError, VendflowError};
use vendflow_core::traits::{PersistenceSink, TaskExecutor};
use vendflow_core::types::{FinalResult, VerificationRequest, VerificationType};
use vendflow_core::Context;

#[derive(Debug, Clone)]
enum Failure {
    /// Fail only the n-th call (1-based).
    OnCall(usize, TaskError),
    /// Fail the first n calls.
    FirstN(usize, TaskError),
    Always(TaskError),
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<(String, Value)>,
    responses: HashMap<String, Value>,
    call_responses: HashMap<(String, usize), Value>,
    failures: HashMap<String, Vec<Failure>>,
    delays: HashMap<String, Duration>,
}

/// Task executor answering every task with a plausible canned response.
///
/// Individual tasks can be overridden, delayed, or made to fail; every
/// invocation is recorded with its payload.
#[derive(Default)]
pub struct ScriptedTaskExecutor {
    state: Mutex<ScriptState>,
}

impl ScriptedTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `task` with `response`.
    pub fn respond(&self, task: &str, response: Value) {
        self.lock().responses.insert(task.to_string(), response);
    }

    /// Answer only the `n`-th call (1-based) of `task` with `response`.
    pub fn respond_on_call(&self, task: &str, n: usize, response: Value) {
        self.lock()
            .call_responses
            .insert((task.to_string(), n), response);
    }

    /// Fail the `n`-th call (1-based) of `task`.
    pub fn fail_on_call(&self, task: &str, n: usize, error: TaskError) {
        self.push_failure(task, Failure::OnCall(n, error));
    }

    /// Fail the first `n` calls of `task`, then answer normally.
    pub fn fail_times(&self, task: &str, n: usize, error: TaskError) {
        self.push_failure(task, Failure::FirstN(n, error));
    }

    pub fn fail_always(&self, task: &str, error: TaskError) {
        self.push_failure(task, Failure::Always(error));
    }

    /// Sleep before answering `task`.
    pub fn delay(&self, task: &str, delay: Duration) {
        self.lock().delays.insert(task.to_string(), delay);
    }

    /// Every invocation in order, as (task, payload).
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    /// Payloads `task` was invoked with.
    pub fn calls(&self, task: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|(t, _)| t == task)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, task: &str) -> usize {
        self.lock().calls.iter().filter(|(t, _)| t == task).count()
    }

    fn push_failure(&self, task: &str, failure: Failure) {
        self.lock()
            .failures
            .entry(task.to_string())
            .or_default()
            .push(failure);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }
}

impl TaskExecutor for ScriptedTaskExecutor {
    fn invoke(
        &self,
        task: &str,
        payload: Value,
    ) -> BoxFuture<'_, std::result::Result<Value, TaskError>> {
        let task = task.to_string();
        let (result, delay) = {
            let mut state = self.lock();
            state.calls.push((task.clone(), payload.clone()));
            let n = state.calls.iter().filter(|(t, _)| *t == task).count();

            let failure = state.failures.get(&task).and_then(|plans| {
                plans.iter().find_map(|plan| match plan {
                    Failure::OnCall(k, e) if *k == n => Some(e.clone()),
                    Failure::FirstN(k, e) if n <= *k => Some(e.clone()),
                    Failure::Always(e) => Some(e.clone()),
                    _ => None,
                })
            });
            let result = match failure {
                Some(e) => Err(e),
                None => match state
                    .call_responses
                    .get(&(task.clone(), n))
                    .or_else(|| state.responses.get(&task))
                {
                    Some(v) => Ok(v.clone()),
                    None => canned_response(&task, &payload),
                },
            };
            (result, state.delays.get(&task).copied())
        };

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

/// Default responses shaped like the real task services.
fn canned_response(task: &str, payload: &Value) -> std::result::Result<Value, TaskError> {
    let vc = &payload["verificationContext"];
    let turn = payload["turnNumber"].as_u64().unwrap_or(1);
    let response = match task {
        "initialize" => json!({}),
        "fetch_historical_verification" => json!({
            "previousVerificationId": vc["previousVerificationId"]
                .as_str()
                .unwrap_or("verif-20250101000000-00000000"),
            "previousVerificationStatus": "CORRECT",
            "summary": { "discrepanciesCount": 0 }
        }),
        "fetch_images" => json!({
            "reference": { "url": vc["referenceImageUrl"], "format": "png" },
            "checking": { "url": vc["checkingImageUrl"], "format": "png" }
        }),
        "prepare_system_prompt" => json!({
            "content": "You audit vending machine shelves against a reference.",
            "promptVersion": "1.0"
        }),
        "prepare_turn_prompt" => json!({
            "currentPrompt": format!("Analyze the {} image.", payload["includeImage"].as_str().unwrap_or("reference")),
            "turnNumber": turn
        }),
        "invoke_bedrock" => json!({
            "turnId": turn,
            "response": { "content": format!("analysis for turn {}", turn) },
            "latencyMs": 850,
            "tokenUsage": { "input": 1200, "output": 300, "total": 1500 }
        }),
        "process_turn1_response" => json!({
            "machineStructure": { "rows": 6, "columnsPerRow": 10 }
        }),
        "process_turn2_response" => json!({
            "observations": ["Row A slot 3 is empty"]
        }),
        "finalize_results" => json!({
            "verificationStatus": "INCORRECT",
            "discrepancies": [
                { "type": "MISSING_PRODUCT", "description": "Row A slot 3 is empty", "severity": "HIGH" }
            ],
            "confidenceScore": 0.92,
            "summary": "1 discrepancy found"
        }),
        "store_results" => json!({
            "resultImageUrl": format!(
                "s3://results/{}.png",
                vc["verificationId"].as_str().unwrap_or("unknown")
            )
        }),
        "notify" => json!({ "notificationSent": true }),
        other => return Err(TaskError::unknown(other, "no scripted response")),
    };
    Ok(response)
}

/// Persistence sink that keeps everything in memory.
#[derive(Default)]
pub struct RecordingSink {
    stored: Mutex<Vec<(FinalResult, Context)>>,
    notified: Mutex<Vec<Option<String>>>,
    fail_store: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `store` always fails.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail_store.store(true, Ordering::SeqCst);
        sink
    }

    pub fn stored(&self) -> Vec<FinalResult> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn stored_contexts(&self) -> Vec<Context> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Verification ids notifications were recorded for.
    pub fn notified(&self) -> Vec<Option<String>> {
        self.notified.lock().unwrap().clone()
    }
}

impl PersistenceSink for RecordingSink {
    fn store<'a>(
        &'a self,
        result: &'a FinalResult,
        context: &'a Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_store.load(Ordering::SeqCst) {
                return Err(VendflowError::Database("sink unavailable".into()));
            }
            self.stored
                .lock()
                .unwrap()
                .push((result.clone(), context.clone()));
            Ok(())
        })
    }

    fn notify<'a>(&'a self, context: &'a Context) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.notified
                .lock()
                .unwrap()
                .push(context.verification_id().map(String::from));
            Ok(())
        })
    }
}

/// A `LAYOUT_VS_CHECKING` request without notification.
pub fn layout_request() -> VerificationRequest {
    let mut request = VerificationRequest::new(
        VerificationType::LayoutVsChecking,
        "s3://vendflow-reference/layouts/23591-kk.png",
        "s3://vendflow-checking/2025/04/VM-3245/check.jpg",
        "VM-3245",
    );
    request.layout_id = Some(23591);
    request.layout_prefix = Some("kk".into());
    request
}

/// A `PREVIOUS_VS_CURRENT` request without notification.
pub fn previous_request() -> VerificationRequest {
    let mut request = VerificationRequest::new(
        VerificationType::PreviousVsCurrent,
        "s3://vendflow-checking/2025/03/VM-3245/check.jpg",
        "s3://vendflow-checking/2025/04/VM-3245/check.jpg",
        "VM-3245",
    );
    request.previous_verification_id = Some("verif-20250301120000-1a2b3c4d".into());
    request
}

/// Write `contents` to a `vendflow.toml` inside a fresh temp dir.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vendflow.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
