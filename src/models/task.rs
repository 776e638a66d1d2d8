use serde::{Deserialize, Serialize};

use super::MailModel;

/// Task lifecycle. The listener creates tasks in `Local`; the processor
/// advances them and writes the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Local,
    Remote,
    Complete,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Local => "local",
            TaskStatus::Remote => "remote",
            TaskStatus::Complete => "complete",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// A user-initiated mutation with a local (optimistic) and remote
/// (authoritative) phase. The payload stays opaque JSON; handlers parse
/// what they need off `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    /// Handler discriminator, `__cls` on the wire.
    #[serde(rename = "__cls")]
    pub constructor_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "should_cancel", default)]
    pub should_cancel: bool,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Build a task from an inbound `task-queued` packet. The version is
    /// zeroed: whatever the client thinks it knows, the store decides.
    pub fn from_wire(mut value: serde_json::Value) -> Result<Task, serde_json::Error> {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("version".into(), 0.into());
            obj.entry("status").or_insert("local".into());
        }
        serde_json::from_value(value)
    }

    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone()))
    }
}

impl MailModel for Task {
    const TABLE: &'static str = "Task";

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn columns() -> &'static [&'static str] {
        &["status"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![self.status.as_str().to_string().into()]
    }
}
