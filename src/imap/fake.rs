//! In-memory [`MailApi`] used by the scenario tests.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    Capabilities, CondstoreChanges, MailApi, RemoteFolder, RemoteFolderStatus, RemoteMessage,
};
use crate::error::SyncError;
use crate::sync::idle::Interrupt;

pub(crate) struct FakeFolder {
    pub path: String,
    pub attributes: Vec<String>,
    pub no_select: bool,
    pub status: RemoteFolderStatus,
    pub messages: BTreeMap<u32, RemoteMessage>,
    /// What the next `sync_since` reports.
    pub changes: Vec<RemoteMessage>,
    pub vanished: Option<Vec<u32>>,
}

impl FakeFolder {
    pub fn new(path: &str, attributes: &[&str]) -> FakeFolder {
        FakeFolder {
            path: path.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            no_select: attributes.iter().any(|a| a.contains("NoSelect")),
            status: RemoteFolderStatus {
                uidvalidity: 1,
                uidnext: 1,
                highestmodseq: 1,
                message_count: 0,
            },
            messages: BTreeMap::new(),
            changes: Vec::new(),
            vanished: None,
        }
    }

    pub fn put(&mut self, msg: RemoteMessage) {
        let uid = msg.uid;
        self.messages.insert(uid, msg);
        self.status.message_count = self.messages.len() as u32;
        if uid >= self.status.uidnext {
            self.status.uidnext = uid + 1;
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pub caps: Capabilities,
    pub folders: Vec<FakeFolder>,
    pub status_log: Vec<String>,
    pub ops: Vec<String>,
    pub connect_failures: u32,
    /// Fail this many flag mutations with a retryable error.
    pub op_failures: u32,
}

impl FakeApi {
    pub fn new() -> FakeApi {
        FakeApi::default()
    }

    pub fn add_folder(&mut self, path: &str, attributes: &[&str]) -> &mut FakeFolder {
        self.folders.push(FakeFolder::new(path, attributes));
        self.folders.last_mut().unwrap()
    }

    pub fn folder_mut(&mut self, path: &str) -> &mut FakeFolder {
        self.folders
            .iter_mut()
            .find(|f| f.path == path)
            .expect("fake folder exists")
    }

    fn folder(&self, path: &str) -> Result<&FakeFolder, SyncError> {
        self.folders
            .iter()
            .find(|f| f.path == path)
            .ok_or_else(|| SyncError::Imap(format!("no such folder {}", path)))
    }
}

impl MailApi for FakeApi {
    async fn connect(&mut self) -> Result<(), SyncError> {
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(SyncError::Net("connection refused".into()));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn fetch_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError> {
        Ok(self
            .folders
            .iter()
            .map(|f| RemoteFolder {
                path: f.path.clone(),
                no_select: f.no_select,
                attributes: f.attributes.clone(),
            })
            .collect())
    }

    async fn folder_status(&mut self, path: &str) -> Result<RemoteFolderStatus, SyncError> {
        self.status_log.push(path.to_string());
        Ok(self.folder(path)?.status)
    }

    async fn fetch_range(
        &mut self,
        path: &str,
        lo: u32,
        hi: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        Ok(self
            .folder(path)?
            .messages
            .range(lo..hi)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn sync_since(
        &mut self,
        path: &str,
        _modseq: u64,
    ) -> Result<CondstoreChanges, SyncError> {
        let folder = self.folder(path)?;
        Ok(CondstoreChanges {
            changed: folder.changes.clone(),
            vanished: folder.vanished.clone(),
        })
    }

    async fn fetch_body(&mut self, path: &str, uid: u32) -> Result<Vec<u8>, SyncError> {
        let msg = self
            .folder(path)?
            .messages
            .get(&uid)
            .ok_or_else(|| SyncError::Imap(format!("no message {} in {}", uid, path)))?;
        let from = msg
            .from
            .first()
            .map(|a| a.email.clone())
            .unwrap_or_else(|| "nobody@example.com".into());
        Ok(format!(
            "From: {}\r\nSubject: {}\r\nContent-Type: text/plain\r\n\r\nbody of message {}\r\n",
            from, msg.subject, uid
        )
        .into_bytes())
    }

    async fn idle(&mut self, path: &str, interrupt: &Interrupt) -> Result<(), SyncError> {
        self.ops.push(format!("idle {}", path));
        interrupt.wait(Duration::from_millis(1)).await;
        Ok(())
    }

    async fn add_flags(
        &mut self,
        path: &str,
        uids: &[u32],
        flags: &str,
    ) -> Result<(), SyncError> {
        if self.op_failures > 0 {
            self.op_failures -= 1;
            return Err(SyncError::Net("connection reset".into()));
        }
        self.ops
            .push(format!("add_flags {} {} {}", path, super::uid_set(uids), flags));
        Ok(())
    }

    async fn remove_flags(
        &mut self,
        path: &str,
        uids: &[u32],
        flags: &str,
    ) -> Result<(), SyncError> {
        self.ops
            .push(format!("remove_flags {} {} {}", path, super::uid_set(uids), flags));
        Ok(())
    }

    async fn move_messages(
        &mut self,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<(), SyncError> {
        self.ops
            .push(format!("move {} -> {} {}", from, to, super::uid_set(uids)));
        Ok(())
    }

    async fn set_labels(
        &mut self,
        path: &str,
        uids: &[u32],
        add: bool,
        labels: &[String],
    ) -> Result<(), SyncError> {
        self.ops.push(format!(
            "labels {} {} {} {}",
            path,
            super::uid_set(uids),
            if add { "+" } else { "-" },
            labels.join(",")
        ));
        Ok(())
    }

    async fn delete_messages(&mut self, path: &str, uids: &[u32]) -> Result<(), SyncError> {
        self.ops
            .push(format!("delete {} {}", path, super::uid_set(uids)));
        Ok(())
    }

    async fn append(&mut self, path: &str, raw: &[u8], flags: &str) -> Result<(), SyncError> {
        self.ops
            .push(format!("append {} {} bytes {}", path, raw.len(), flags));
        Ok(())
    }
}
