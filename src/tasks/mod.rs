//! User-initiated mutations.
//!
//! Every task runs in two phases: `perform_local` applies the optimistic
//! effect inside one store transaction and advances `local -> remote`;
//! `perform_remote` applies the authoritative change against the server
//! and advances `remote -> complete`. Handlers are dispatched on the
//! task's `constructorName`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::imap::MailApi;
use crate::models::{Account, Folder, Message, Task, TaskStatus};
use crate::processor::MailProcessor;
use crate::smtp;
use crate::store::{Query, Store};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeUnreadPayload {
    message_ids: Vec<String>,
    unread: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeStarredPayload {
    message_ids: Vec<String>,
    starred: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeFolderPayload {
    message_ids: Vec<String>,
    folder_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeLabelsPayload {
    message_ids: Vec<String>,
    #[serde(default)]
    labels_to_add: Vec<String>,
    #[serde(default)]
    labels_to_remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageIdsPayload {
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftPayload {
    draft: smtp::Draft,
}

/// Where the affected messages lived when the local phase ran. The remote
/// phase works off this record, because the optimistic effect may already
/// have rebound or removed the local rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OriginGroup {
    path: String,
    uids: Vec<u32>,
}

pub struct TaskProcessor {
    account: Arc<Account>,
    processor: MailProcessor,
}

impl TaskProcessor {
    pub fn new(account: Arc<Account>, files_root: std::path::PathBuf) -> TaskProcessor {
        TaskProcessor {
            processor: MailProcessor::new(account.clone(), files_root),
            account,
        }
    }

    /// Run the optimistic local effect. On rejection the task completes
    /// immediately with `error` set and no local changes.
    pub fn perform_local(&self, store: &Store, task: &mut Task) -> Result<(), SyncError> {
        info!(task = %task.constructor_name, id = %task.id, "performing local phase");

        store.begin_transaction()?;
        match self.apply_local(store, task) {
            Ok(()) => {
                task.status = TaskStatus::Remote;
                store.save(task, true)?;
                store.commit_transaction()
            }
            Err(err) => {
                store.rollback_transaction();
                warn!(task = %task.id, "local phase rejected: {}", err);
                task.error = Some(err.to_string());
                task.status = TaskStatus::Complete;
                store.save(task, true)
            }
        }
    }

    /// Run the authoritative remote effect. Retryable failures leave the
    /// task in `remote` for the next foreground loop; anything else
    /// completes the task with `error` set, local effect preserved.
    pub async fn perform_remote<A: MailApi>(
        &self,
        store: &Store,
        api: &mut A,
        task: &mut Task,
    ) -> Result<(), SyncError> {
        if task.should_cancel {
            info!(task = %task.id, "task cancelled before remote phase");
            task.status = TaskStatus::Cancelled;
            return store.save(task, true);
        }

        info!(task = %task.constructor_name, id = %task.id, "performing remote phase");
        match self.apply_remote(store, api, task).await {
            Ok(()) => {
                task.status = TaskStatus::Complete;
                store.save(task, true)
            }
            Err(err) if err.is_retryable() => {
                warn!(task = %task.id, "remote phase will retry: {}", err);
                Err(err)
            }
            Err(err) => {
                warn!(task = %task.id, "remote phase failed: {}", err);
                task.error = Some(err.to_string());
                task.status = TaskStatus::Complete;
                store.save(task, true)
            }
        }
    }

    // ----- local handlers -------------------------------------------------

    fn apply_local(&self, store: &Store, task: &mut Task) -> Result<(), SyncError> {
        match task.constructor_name.as_str() {
            "ChangeUnreadTask" => {
                let p: ChangeUnreadPayload = task.payload().map_err(reject)?;
                self.mutate_messages(store, &p.message_ids, |msg| msg.unread = p.unread)
            }
            "ChangeStarredTask" => {
                let p: ChangeStarredPayload = task.payload().map_err(reject)?;
                self.mutate_messages(store, &p.message_ids, |msg| msg.starred = p.starred)
            }
            "ChangeLabelsTask" => {
                let p: ChangeLabelsPayload = task.payload().map_err(reject)?;
                self.mutate_messages(store, &p.message_ids, |msg| {
                    msg.labels.retain(|l| !p.labels_to_remove.contains(l));
                    for label in &p.labels_to_add {
                        if !msg.labels.contains(label) {
                            msg.labels.push(label.clone());
                        }
                    }
                })
            }
            "ChangeFolderTask" => {
                let p: ChangeFolderPayload = task.payload().map_err(reject)?;
                let target = store
                    .find_by_id::<Folder>(&p.folder_id)?
                    .ok_or_else(|| SyncError::TaskRejected(format!("no folder {}", p.folder_id)))?;
                self.record_origin(store, task, &p.message_ids)?;
                for id in &p.message_ids {
                    let mut msg = self.required_message(store, id)?;
                    let old_folder = msg.folder_id.clone();
                    msg.folder_id = target.id.clone();
                    // The new folder assigns a UID once the move syncs.
                    msg.folder_imap_uid = 0;
                    store.save(&mut msg, true)?;
                    self.processor.recompute_counts_for_message(store, &msg)?;
                    self.processor.recompute_category_counts(store, &old_folder)?;
                }
                Ok(())
            }
            "DestroyMessageTask" => {
                let p: MessageIdsPayload = task.payload().map_err(reject)?;
                self.record_origin(store, task, &p.message_ids)?;
                for id in &p.message_ids {
                    let msg = self.required_message(store, id)?;
                    store.remove(&msg)?;
                    if let Some(mut thread) = store.find_by_id(&msg.thread_id)? {
                        self.processor.recompute_thread(store, &mut thread)?;
                    }
                    self.processor.recompute_category_counts(store, &msg.folder_id)?;
                }
                Ok(())
            }
            "SendDraftTask" | "SyncbackDraftTask" => {
                let p: DraftPayload = task.payload().map_err(reject)?;
                if task.constructor_name == "SendDraftTask" && p.draft.to.is_empty() {
                    return Err(SyncError::TaskRejected("draft has no recipients".into()));
                }
                Ok(())
            }
            other => Err(SyncError::TaskRejected(format!("unknown task {}", other))),
        }
    }

    fn mutate_messages(
        &self,
        store: &Store,
        ids: &[String],
        f: impl Fn(&mut Message),
    ) -> Result<(), SyncError> {
        for id in ids {
            let mut msg = self.required_message(store, id)?;
            f(&mut msg);
            store.save(&mut msg, true)?;
            if let Some(mut thread) = store.find_by_id(&msg.thread_id)? {
                self.processor.recompute_thread(store, &mut thread)?;
            }
            self.processor.recompute_counts_for_message(store, &msg)?;
        }
        Ok(())
    }

    fn required_message(&self, store: &Store, id: &str) -> Result<Message, SyncError> {
        store
            .find_by_id::<Message>(id)?
            .ok_or_else(|| SyncError::TaskRejected(format!("no message {}", id)))
    }

    /// Snapshot `(folder path, uids)` for the remote phase before the local
    /// effect rewrites the rows.
    fn record_origin(
        &self,
        store: &Store,
        task: &mut Task,
        message_ids: &[String],
    ) -> Result<(), SyncError> {
        let groups = self.group_by_folder(store, message_ids)?;
        let origin: Vec<OriginGroup> = groups
            .into_iter()
            .map(|(path, uids)| OriginGroup { path, uids })
            .collect();
        task.data.insert(
            "origin".into(),
            serde_json::to_value(origin).map_err(SyncError::parse)?,
        );
        Ok(())
    }

    fn group_by_folder(
        &self,
        store: &Store,
        message_ids: &[String],
    ) -> Result<Vec<(String, Vec<u32>)>, SyncError> {
        let mut by_path: HashMap<String, Vec<u32>> = HashMap::new();
        for id in message_ids {
            let msg = self.required_message(store, id)?;
            let folder = store
                .find_by_id::<Folder>(&msg.folder_id)?
                .ok_or_else(|| SyncError::TaskRejected(format!("no folder {}", msg.folder_id)))?;
            by_path.entry(folder.path).or_default().push(msg.folder_imap_uid);
        }
        let mut groups: Vec<(String, Vec<u32>)> = by_path.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    fn recorded_origin(&self, task: &Task) -> Result<Vec<OriginGroup>, SyncError> {
        let origin = task
            .data
            .get("origin")
            .cloned()
            .ok_or_else(|| SyncError::Other("task has no recorded origin".into()))?;
        serde_json::from_value(origin).map_err(SyncError::parse)
    }

    // ----- remote handlers ------------------------------------------------

    async fn apply_remote<A: MailApi>(
        &self,
        store: &Store,
        api: &mut A,
        task: &mut Task,
    ) -> Result<(), SyncError> {
        api.connect().await?;

        match task.constructor_name.as_str() {
            "ChangeUnreadTask" => {
                let p: ChangeUnreadPayload = task.payload().map_err(reject)?;
                for (path, uids) in self.group_by_folder(store, &p.message_ids)? {
                    if p.unread {
                        api.remove_flags(&path, &uids, "\\Seen").await?;
                    } else {
                        api.add_flags(&path, &uids, "\\Seen").await?;
                    }
                }
                Ok(())
            }
            "ChangeStarredTask" => {
                let p: ChangeStarredPayload = task.payload().map_err(reject)?;
                for (path, uids) in self.group_by_folder(store, &p.message_ids)? {
                    if p.starred {
                        api.add_flags(&path, &uids, "\\Flagged").await?;
                    } else {
                        api.remove_flags(&path, &uids, "\\Flagged").await?;
                    }
                }
                Ok(())
            }
            "ChangeLabelsTask" => {
                let p: ChangeLabelsPayload = task.payload().map_err(reject)?;
                for (path, uids) in self.group_by_folder(store, &p.message_ids)? {
                    if !p.labels_to_add.is_empty() {
                        api.set_labels(&path, &uids, true, &p.labels_to_add).await?;
                    }
                    if !p.labels_to_remove.is_empty() {
                        api.set_labels(&path, &uids, false, &p.labels_to_remove)
                            .await?;
                    }
                }
                Ok(())
            }
            "ChangeFolderTask" => {
                let p: ChangeFolderPayload = task.payload().map_err(reject)?;
                let target = store
                    .find_by_id::<Folder>(&p.folder_id)?
                    .ok_or_else(|| SyncError::Other(format!("no folder {}", p.folder_id)))?;
                for group in self.recorded_origin(task)? {
                    api.move_messages(&group.path, &target.path, &group.uids)
                        .await?;
                }
                Ok(())
            }
            "DestroyMessageTask" => {
                for group in self.recorded_origin(task)? {
                    api.delete_messages(&group.path, &group.uids).await?;
                }
                Ok(())
            }
            "SendDraftTask" => {
                let p: DraftPayload = task.payload().map_err(reject)?;
                smtp::send(&self.account, &p.draft).await
            }
            "SyncbackDraftTask" => {
                let p: DraftPayload = task.payload().map_err(reject)?;
                let drafts = store
                    .find::<Folder>(&Query::new().equal("role", "drafts".to_string()))?
                    .ok_or_else(|| SyncError::Other("no drafts folder".into()))?;
                let mime = smtp::build_mime(&self.account, &p.draft)
                    .or_else(|_| {
                        // A draft may legitimately have no recipients yet.
                        let mut padded = p.draft.clone();
                        padded.to = vec![self.account.email_address.clone()];
                        smtp::build_mime(&self.account, &padded)
                    })?;
                api.append(&drafts.path, &mime.formatted(), "\\Draft").await
            }
            other => Err(SyncError::Other(format!("unknown task {}", other))),
        }
    }
}

fn reject(err: serde_json::Error) -> SyncError {
    SyncError::TaskRejected(format!("malformed payload: {}", err))
}
