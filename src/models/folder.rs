use serde::{Deserialize, Serialize};

use super::MailModel;

/// Sync order within one cycle. Unknown roles sort last.
pub const ROLE_ORDER: [&str; 7] = ["inbox", "sent", "drafts", "all", "archive", "trash", "spam"];

pub fn role_rank(role: &str) -> usize {
    ROLE_ORDER
        .iter()
        .position(|r| *r == role)
        .unwrap_or(ROLE_ORDER.len())
}

/// Per-folder sync cursor, persisted inside the folder's `data` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uidvalidity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uidnext: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highestmodseq: Option<u64>,
    #[serde(
        default,
        rename = "fullScanHead",
        skip_serializing_if = "Option::is_none"
    )]
    pub full_scan_head: Option<u32>,
    #[serde(
        default,
        rename = "fullScanTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub full_scan_time: Option<i64>,
}

/// A selectable remote mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub local_status: LocalStatus,
}

impl Folder {
    pub fn new(id: String, account_id: String) -> Folder {
        Folder {
            id,
            account_id,
            version: 0,
            path: String::new(),
            role: String::new(),
            local_status: LocalStatus::default(),
        }
    }
}

impl MailModel for Folder {
    const TABLE: &'static str = "Folder";

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
        &["path", "role"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![self.path.clone().into(), self.role.clone().into()]
    }
}

/// A Gmail label. Same shape as a folder, but never scanned as one:
/// on Gmail the all-mail folder already covers its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub role: String,
}

impl Label {
    pub fn new(id: String, account_id: String) -> Label {
        Label {
            id,
            account_id,
            version: 0,
            path: String::new(),
            role: String::new(),
        }
    }
}

impl MailModel for Label {
    const TABLE: &'static str = "Label";

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
        &["path", "role"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![self.path.clone().into(), self.role.clone().into()]
    }
}

/// Derive the canonical role for a remote mailbox from its SPECIAL-USE
/// attributes, falling back to well-known path names.
pub fn role_for_folder(path: &str, attributes: &[String]) -> String {
    for attr in attributes {
        let a = attr.trim_start_matches('\\').to_ascii_lowercase();
        let role = match a.as_str() {
            "all" | "allmail" => "all",
            "sent" => "sent",
            "drafts" => "drafts",
            "trash" => "trash",
            "junk" => "spam",
            "archive" => "archive",
            "inbox" => "inbox",
            _ => continue,
        };
        return role.to_string();
    }

    let name = path
        .rsplit(['/', '.'])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase();
    match name.as_str() {
        "inbox" => "inbox",
        "sent" | "sent mail" | "sent messages" | "sent items" => "sent",
        "drafts" | "draft" => "drafts",
        "all mail" | "all" | "archive" => {
            if name == "archive" {
                "archive".into()
            } else {
                "all".into()
            }
        }
        "trash" | "deleted items" | "deleted messages" => "trash",
        "spam" | "junk" | "junk mail" => "spam",
        _ => "none",
    }
    .to_string()
}
