use serde::{Deserialize, Serialize};

use super::MailModel;

/// A message grouping. Counts are denormalized and recomputed inside the
/// same transaction as any message write that touches the thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g_thr_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub unread: i64,
    #[serde(default)]
    pub starred: i64,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub first_message_timestamp: i64,
    #[serde(default)]
    pub last_message_timestamp: i64,
    /// Space-joined folder/label ids the thread's messages live in.
    #[serde(default)]
    pub categories: String,
    /// rowid of this thread's row in the ThreadSearch FTS table.
    #[serde(default)]
    pub search_row_id: i64,
}

impl Thread {
    pub fn new(id: String, account_id: String, subject: String, g_thr_id: Option<String>) -> Thread {
        Thread {
            id,
            account_id,
            version: 0,
            g_thr_id,
            subject,
            unread: 0,
            starred: 0,
            message_count: 0,
            first_message_timestamp: 0,
            last_message_timestamp: 0,
            categories: String::new(),
            search_row_id: 0,
        }
    }
}

impl MailModel for Thread {
    const TABLE: &'static str = "Thread";

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
        &[
            "gThrId",
            "subject",
            "unread",
            "starred",
            "lastMessageTimestamp",
        ]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![
            match &self.g_thr_id {
                Some(v) => v.clone().into(),
                None => rusqlite::types::Value::Null,
            },
            self.subject.clone().into(),
            self.unread.into(),
            self.starred.into(),
            self.last_message_timestamp.into(),
        ]
    }
}
