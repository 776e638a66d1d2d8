use serde::{Deserialize, Serialize};

use super::{digest_id, MailModel};
use crate::imap::RemoteMessage;

/// UIDs above this mark are unlink tombstones, never real server UIDs.
pub const UNLINK_WINDOW: u32 = 5;

pub fn unlinked_uid_for_phase(phase: u32) -> u32 {
    u32::MAX - phase
}

pub fn is_unlinked(remote_uid: u32) -> bool {
    remote_uid > u32::MAX - UNLINK_WINDOW
}

/// A mailbox participant as it appears in headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
}

/// The remotely-observable attributes a sync pass compares. Two messages
/// with equal attributes need no write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttributes {
    pub uid: u32,
    pub unread: bool,
    pub starred: bool,
    pub draft: bool,
    pub labels: Vec<String>,
}

impl MessageAttributes {
    pub fn from_remote(remote: &RemoteMessage) -> MessageAttributes {
        let mut labels = remote.gmail_labels.clone();
        labels.sort();
        MessageAttributes {
            uid: remote.uid,
            unread: !remote.flags.seen,
            starred: remote.flags.flagged,
            draft: remote.flags.draft,
            labels,
        }
    }
}

/// One IMAP message, pinned to exactly one folder by
/// `(folder_id, folder_imap_uid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub folder_id: String,
    #[serde(rename = "folderImapUID")]
    pub folder_imap_uid: u32,
    /// Mirrors `folder_imap_uid` for live messages; carries the unlink
    /// tombstone while a message is a deletion candidate. Invisible to
    /// the client, so tombstone writes never emit deltas.
    #[serde(rename = "remoteUID")]
    pub remote_uid: u32,

    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub header_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g_thr_id: Option<String>,

    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub from: Vec<EmailAddress>,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default)]
    pub references: Vec<String>,

    /// Unix seconds.
    pub date: i64,
    pub unread: bool,
    pub starred: bool,
    pub draft: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub files: Vec<serde_json::Value>,

    /// Monotonic per message; an update stamped older than this is stale.
    pub synced_at: i64,
}

impl Message {
    pub fn from_remote(
        account_id: &str,
        remote: &RemoteMessage,
        folder_id: &str,
        synced_at: i64,
    ) -> Message {
        let attrs = MessageAttributes::from_remote(remote);
        Message {
            id: id_for_message(account_id, remote),
            account_id: account_id.to_string(),
            version: 0,
            folder_id: folder_id.to_string(),
            folder_imap_uid: remote.uid,
            remote_uid: remote.uid,
            thread_id: String::new(),
            header_message_id: remote.header_message_id.clone().unwrap_or_default(),
            g_msg_id: remote.gmail_message_id.map(|v| v.to_string()),
            g_thr_id: remote.gmail_thread_id.map(|v| v.to_string()),
            subject: remote.subject.clone(),
            snippet: String::new(),
            from: remote.from.clone(),
            to: remote.to.clone(),
            cc: remote.cc.clone(),
            bcc: remote.bcc.clone(),
            references: remote.references.clone(),
            date: remote.date,
            unread: attrs.unread,
            starred: attrs.starred,
            draft: attrs.draft,
            labels: attrs.labels,
            files: Vec::new(),
            synced_at,
        }
    }

    pub fn attributes(&self) -> MessageAttributes {
        let mut labels = self.labels.clone();
        labels.sort();
        MessageAttributes {
            uid: self.remote_uid,
            unread: self.unread,
            starred: self.starred,
            draft: self.draft,
            labels,
        }
    }

    pub fn apply_attributes(&mut self, attrs: &MessageAttributes) {
        self.remote_uid = attrs.uid;
        self.folder_imap_uid = attrs.uid;
        self.unread = attrs.unread;
        self.starred = attrs.starred;
        self.draft = attrs.draft;
        self.labels = attrs.labels.clone();
    }

    pub fn is_sent_by(&self, email_address: &str) -> bool {
        let wanted = email_address.to_lowercase();
        self.from.iter().any(|a| a.email.to_lowercase() == wanted)
    }
}

/// Identity id for a message. Derived from immutable identity so the id
/// survives folder moves: re-observing a moved message in its new folder
/// collides on the id primary key and becomes an update.
pub fn id_for_message(account_id: &str, remote: &RemoteMessage) -> String {
    if let Some(gmid) = remote.gmail_message_id {
        return digest_id(&["gm", account_id, &gmid.to_string()]);
    }
    if let Some(hmid) = &remote.header_message_id {
        if !hmid.is_empty() {
            return digest_id(&[account_id, hmid]);
        }
    }
    // Headerless message: fall back to content-ish identity.
    let from = remote
        .from
        .first()
        .map(|a| a.email.as_str())
        .unwrap_or_default();
    digest_id(&[account_id, &remote.date.to_string(), &remote.subject, from])
}

impl MailModel for Message {
    const TABLE: &'static str = "Message";

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
            "headerMessageId",
            "subject",
            "date",
            "draft",
            "unread",
            "starred",
            "folderId",
            "folderImapUID",
            "remoteUID",
            "threadId",
            "labels",
            "syncedAt",
        ]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![
            self.header_message_id.clone().into(),
            self.subject.clone().into(),
            self.date.into(),
            (self.draft as i64).into(),
            (self.unread as i64).into(),
            (self.starred as i64).into(),
            self.folder_id.clone().into(),
            (self.folder_imap_uid as i64).into(),
            (self.remote_uid as i64).into(),
            self.thread_id.clone().into(),
            serde_json::to_string(&self.labels)
                .unwrap_or_else(|_| "[]".into())
                .into(),
            self.synced_at.into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::RemoteFlags;

    fn remote(uid: u32) -> RemoteMessage {
        RemoteMessage {
            uid,
            flags: RemoteFlags {
                seen: true,
                flagged: false,
                draft: false,
            },
            gmail_labels: vec![],
            gmail_thread_id: None,
            gmail_message_id: None,
            header_message_id: Some(format!("<m-{}@example.com>", uid)),
            references: vec![],
            subject: "hello".into(),
            from: vec![EmailAddress {
                name: None,
                email: "a@example.com".into(),
            }],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            date: 1_700_000_000,
        }
    }

    #[test]
    fn id_survives_folder_moves() {
        // Same message, different UID in a different folder: same id.
        let m1 = remote(42);
        let mut m2 = remote(42);
        m2.uid = 7;
        m2.header_message_id = m1.header_message_id.clone();
        assert_eq!(id_for_message("acct", &m1), id_for_message("acct", &m2));
    }

    #[test]
    fn gmail_message_id_wins_over_header() {
        let mut m1 = remote(1);
        m1.gmail_message_id = Some(99);
        let mut m2 = remote(2);
        m2.gmail_message_id = Some(99);
        m2.header_message_id = Some("<other@example.com>".into());
        assert_eq!(id_for_message("acct", &m1), id_for_message("acct", &m2));
    }

    #[test]
    fn unlink_tombstones() {
        assert!(is_unlinked(unlinked_uid_for_phase(1)));
        assert!(is_unlinked(unlinked_uid_for_phase(2)));
        assert!(!is_unlinked(42));
        assert_ne!(unlinked_uid_for_phase(1), unlinked_uid_for_phase(2));
    }

    #[test]
    fn attribute_comparison_ignores_label_order() {
        let mut r = remote(5);
        r.gmail_labels = vec!["b".into(), "a".into()];
        let attrs = MessageAttributes::from_remote(&r);

        let mut msg = Message::from_remote("acct", &r, "f1", 10);
        msg.labels = vec!["a".into(), "b".into()];
        assert_eq!(msg.attributes(), attrs);
    }
}
