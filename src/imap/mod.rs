//! IMAP collaborator interface.
//!
//! The sync workers and the task processor talk to the server exclusively
//! through [`MailApi`]; `ImapBackend` implements it over async-imap, and
//! the test suite substitutes an in-memory fake.

pub mod backend;
pub mod capability;
pub mod envelope;
#[cfg(test)]
pub(crate) mod fake;

pub use backend::ImapBackend;
pub use capability::Capabilities;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::message::EmailAddress;
use crate::sync::idle::Interrupt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFlags {
    pub seen: bool,
    pub flagged: bool,
    pub draft: bool,
}

/// Headers + flags + Gmail metadata for one message, as one FETCH returns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub uid: u32,
    pub flags: RemoteFlags,
    pub gmail_labels: Vec<String>,
    pub gmail_thread_id: Option<u64>,
    pub gmail_message_id: Option<u64>,
    /// None when the message has no usable (or an auto-generated) Message-Id.
    pub header_message_id: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    /// Unix seconds.
    pub date: i64,
}

#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub path: String,
    pub no_select: bool,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteFolderStatus {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: u64,
    pub message_count: u32,
}

/// Result of a CONDSTORE `CHANGEDSINCE` round-trip. `vanished` is `Some`
/// exactly when the server reports removals authoritatively (QRESYNC);
/// `None` means deletions must be detected by scanning.
#[derive(Debug, Clone, Default)]
pub struct CondstoreChanges {
    pub changed: Vec<RemoteMessage>,
    pub vanished: Option<Vec<u32>>,
}

/// The named interface to the IMAP wire library.
#[allow(async_fn_in_trait)]
pub trait MailApi: Send {
    /// Establish (or re-establish) the session. Idempotent when connected.
    async fn connect(&mut self) -> Result<(), SyncError>;

    /// Capabilities observed at login. Only meaningful after `connect`.
    fn capabilities(&self) -> Capabilities;

    async fn fetch_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError>;

    async fn folder_status(&mut self, path: &str) -> Result<RemoteFolderStatus, SyncError>;

    /// Headers + flags + labels for UIDs in `[lo, hi)`.
    async fn fetch_range(
        &mut self,
        path: &str,
        lo: u32,
        hi: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError>;

    /// Everything modified or added since `modseq`, plus vanished UIDs when
    /// the server can report them.
    async fn sync_since(
        &mut self,
        path: &str,
        modseq: u64,
    ) -> Result<CondstoreChanges, SyncError>;

    /// Raw RFC822 bytes of one message.
    async fn fetch_body(&mut self, path: &str, uid: u32) -> Result<Vec<u8>, SyncError>;

    /// Block in IDLE until the server notifies, the timeout lapses, or
    /// another thread fires the interrupt primitive.
    async fn idle(&mut self, path: &str, interrupt: &Interrupt) -> Result<(), SyncError>;

    // Mutations, used by the remote phase of tasks.

    async fn add_flags(&mut self, path: &str, uids: &[u32], flags: &str)
        -> Result<(), SyncError>;

    async fn remove_flags(
        &mut self,
        path: &str,
        uids: &[u32],
        flags: &str,
    ) -> Result<(), SyncError>;

    async fn move_messages(
        &mut self,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<(), SyncError>;

    async fn set_labels(
        &mut self,
        path: &str,
        uids: &[u32],
        add: bool,
        labels: &[String],
    ) -> Result<(), SyncError>;

    /// Mark `\Deleted` and expunge.
    async fn delete_messages(&mut self, path: &str, uids: &[u32]) -> Result<(), SyncError>;

    async fn append(&mut self, path: &str, raw: &[u8], flags: &str) -> Result<(), SyncError>;
}

/// Render a UID slice as an IMAP sequence-set.
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_set_renders_comma_list() {
        assert_eq!(uid_set(&[1, 5, 9]), "1,5,9");
        assert_eq!(uid_set(&[]), "");
    }
}
