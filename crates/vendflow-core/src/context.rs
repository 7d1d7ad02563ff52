use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, VendflowError};
use crate::types::{ConversationState, VerificationContext, VerificationRequest, WorkflowStatus};

/// Well-known context paths.
pub mod paths {
    pub const VERIFICATION_CONTEXT: &str = "verificationContext";
    pub const VERIFICATION_ID: &str = "verificationContext.verificationId";
    pub const VERIFICATION_TYPE: &str = "verificationContext.verificationType";
    pub const NOTIFICATION_ENABLED: &str = "verificationContext.notificationEnabled";
    pub const HISTORICAL_CONTEXT: &str = "historicalContext";
    pub const IMAGES: &str = "images";
    pub const SYSTEM_PROMPT: &str = "systemPrompt";
    pub const CONVERSATION_STATE: &str = "conversationState";
    pub const CURRENT_PROMPT: &str = "currentPrompt";
    pub const FINAL_RESULTS: &str = "finalResults";
    pub const STORAGE_RESULT: &str = "storageResult";
    pub const NOTIFICATION_RESULT: &str = "notificationResult";
    pub const ERROR: &str = "error";
    pub const ERROR_DETAILS: &str = "errorDetails";
    pub const FAILURE: &str = "failure";
    pub const STATUS: &str = "status";
    pub const SUMMARY: &str = "summary";
}

/// The accumulating payload threaded through every stage of one execution.
///
/// A JSON object tree addressed by dotted paths
/// (`verificationContext.verificationId`). Writes are non-destructive:
/// merging an object into an existing object merges field by field, so a
/// path that was written once stays readable for the rest of the execution.
/// Only [`Context::replace`] overwrites a slot as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    data: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context with the caller's request under `verificationContext`.
    pub fn from_request(request: &VerificationRequest) -> Result<Self> {
        let mut ctx = Self::new();
        ctx.merge(paths::VERIFICATION_CONTEXT, serde_json::to_value(request)?)?;
        Ok(ctx)
    }

    /// Wrap an existing JSON document. The root must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            other => Err(VendflowError::ContextConflict {
                path: String::new(),
                message: format!("context root must be an object, got {}", type_name(&other)),
            }),
        }
    }

    /// Optional lookup.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = split(path);
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current)
    }

    /// Lookup that treats an absent path as a configuration error.
    pub fn read(&self, path: &str) -> Result<&Value> {
        self.get(path).ok_or_else(|| VendflowError::MissingField {
            path: path.to_string(),
        })
    }

    /// Typed read.
    pub fn read_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.read(path)?.clone();
        Ok(serde_json::from_value(value)?)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Write `value` at `path`, creating intermediate objects as needed.
    ///
    /// The empty path merges into the root. Objects are merged recursively;
    /// replacing an object with a non-object is rejected since it would drop
    /// previously written paths. A rejected merge leaves the context untouched.
    pub fn merge(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = split(path).collect();
        let mut data = self.data.clone();
        match segments.split_last() {
            None => match value {
                Value::Object(obj) => merge_maps(&mut data, obj, "")?,
                other => {
                    return Err(VendflowError::ContextConflict {
                        path: String::new(),
                        message: format!("cannot merge {} into the root", type_name(&other)),
                    })
                }
            },
            Some((last, parents)) => {
                let mut walked = String::new();
                let node = parent_mut(&mut data, parents, &mut walked)?;
                push_segment(&mut walked, last);
                match node.get_mut(*last) {
                    Some(existing) => merge_value(existing, value, &walked)?,
                    None => {
                        node.insert(last.to_string(), value);
                    }
                }
            }
        }
        self.data = data;
        Ok(())
    }

    /// Overwrite whatever `path` holds with `value`.
    ///
    /// Used for slots a stage owns outright, where a later write must not
    /// inherit fields from an earlier one.
    pub fn replace(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = split(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            self.data = Self::from_value(value)?.data;
            return Ok(());
        };
        let mut walked = String::new();
        let node = parent_mut(&mut self.data, parents, &mut walked)?;
        node.insert(last.to_string(), value);
        Ok(())
    }

    /// Convenience wrapper serializing `value` before merging it.
    pub fn merge_as<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        self.merge(path, serde_json::to_value(value)?)
    }

    /// Build a payload holding only the given paths (absent ones are skipped).
    pub fn project<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Value {
        let mut projected = Context::new();
        for path in paths {
            if let Some(value) = self.get(path) {
                // Values copied from a valid tree cannot conflict.
                let _ = projected.merge(path, value.clone());
            }
        }
        projected.into_value()
    }

    pub fn set_status(&mut self, status: WorkflowStatus) -> Result<()> {
        self.merge(paths::STATUS, Value::String(status.as_str().to_string()))
    }

    pub fn status(&self) -> Option<&str> {
        self.get_str(paths::STATUS)
    }

    pub fn verification_context(&self) -> Result<VerificationContext> {
        self.read_as(paths::VERIFICATION_CONTEXT)
    }

    pub fn verification_id(&self) -> Option<&str> {
        self.get_str(paths::VERIFICATION_ID)
    }

    pub fn conversation_state(&self) -> Result<ConversationState> {
        self.read_as(paths::CONVERSATION_STATE)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn push_segment(walked: &mut String, seg: &str) {
    if !walked.is_empty() {
        walked.push('.');
    }
    walked.push_str(seg);
}

/// Walk (and create) the objects above a leaf.
fn parent_mut<'a>(
    data: &'a mut Map<String, Value>,
    parents: &[&str],
    walked: &mut String,
) -> Result<&'a mut Map<String, Value>> {
    let mut node = data;
    for seg in parents {
        push_segment(walked, seg);
        let entry = node
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        node = match entry {
            Value::Object(obj) => obj,
            other => {
                return Err(VendflowError::ContextConflict {
                    path: walked.clone(),
                    message: format!("expected an object, found {}", type_name(other)),
                })
            }
        };
    }
    Ok(node)
}

fn merge_value(existing: &mut Value, new: Value, path: &str) -> Result<()> {
    match (existing, new) {
        (Value::Object(current), Value::Object(incoming)) => merge_maps(current, incoming, path),
        (Value::Object(_), other) => Err(VendflowError::ContextConflict {
            path: path.to_string(),
            message: format!("cannot replace an object with {}", type_name(&other)),
        }),
        (slot, other) => {
            *slot = other;
            Ok(())
        }
    }
}

fn merge_maps(
    current: &mut Map<String, Value>,
    incoming: Map<String, Value>,
    path: &str,
) -> Result<()> {
    for (key, value) in incoming {
        let mut child = path.to_string();
        push_segment(&mut child, &key);
        match current.get_mut(&key) {
            Some(existing) => merge_value(existing, value, &child)?,
            None => {
                current.insert(key, value);
            }
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
