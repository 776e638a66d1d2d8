//! The central reconciliation engine.
//!
//! Every method is re-entrant and idempotent: running twice with the same
//! input is a no-op on the second pass. All writes happen inside store
//! transactions; thread counters and per-category counts are recomputed in
//! the same transaction as the message write that moved them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use crate::body::ParsedBody;
use crate::error::SyncError;
use crate::imap::RemoteMessage;
use crate::models::message::{id_for_message, is_unlinked, unlinked_uid_for_phase};
use crate::models::{
    id_for_file, Account, Contact, File, Folder, Message, MessageAttributes, Thread,
};
use crate::store::{Query, Store};

/// Cap on the references consulted when matching a thread; a rogue client
/// can stuff arbitrarily long chains into the header.
const THREAD_MATCH_REFERENCES: usize = 50;
/// Cap on the references recorded for future reconciliation.
const THREAD_RECORD_REFERENCES: usize = 100;
/// Mass mail does not create contacts.
const CONTACT_RECIPIENT_CAP: usize = 25;
/// Deletion pass batch, per transaction.
const DELETE_CHUNK: usize = 100;

const SNIPPET_CHARS: usize = 400;
const SEARCH_BODY_CHARS: usize = 5000;

pub struct MailProcessor {
    account: Arc<Account>,
    files_root: PathBuf,
}

impl MailProcessor {
    pub fn new(account: Arc<Account>, files_root: PathBuf) -> MailProcessor {
        MailProcessor {
            account,
            files_root,
        }
    }

    // ----- message upsert -------------------------------------------------

    /// Attempt an insert; on a unique-constraint violation fetch the
    /// existing row and update it instead. No other error is suppressed.
    ///
    /// This sidesteps the race where the background deep scan and the
    /// foreground CONDSTORE loop discover the same message concurrently,
    /// without a cross-folder lock. It is also how a folder move is
    /// detected: the moved message's id collides and becomes an update.
    pub fn insert_fallback_to_update(
        &self,
        store: &Store,
        remote: &RemoteMessage,
        folder: &Folder,
        sync_ts: i64,
    ) -> Result<Message, SyncError> {
        match self.insert_message(store, remote, folder, sync_ts) {
            Ok(msg) => Ok(msg),
            Err(err) if err.is_constraint_violation() => {
                let id = id_for_message(&self.account.id, remote);
                let mut local = store
                    .find_by_id::<Message>(&id)?
                    .ok_or(err)?;
                self.update_message(store, &mut local, remote, folder, sync_ts)?;
                Ok(local)
            }
            Err(err) => Err(err),
        }
    }

    fn insert_message(
        &self,
        store: &Store,
        remote: &RemoteMessage,
        folder: &Folder,
        sync_ts: i64,
    ) -> Result<Message, SyncError> {
        let mut msg = Message::from_remote(&self.account.id, remote, &folder.id, sync_ts);

        store.transaction(|| {
            let mut thread = match self.find_thread_for(store, &msg)? {
                Some(thread) => thread,
                None => Thread::new(
                    msg.id.clone(),
                    self.account.id.clone(),
                    msg.subject.clone(),
                    msg.g_thr_id.clone(),
                ),
            };
            msg.thread_id = thread.id.clone();

            // The insert itself goes first so a constraint violation aborts
            // before any thread bookkeeping lands.
            store.save(&mut msg, true)?;

            self.append_to_thread_search(store, &mut thread, Some(&msg), None)?;
            self.recompute_thread(store, &mut thread)?;
            self.upsert_thread_references(store, &thread.id, &msg)?;
            self.upsert_contacts(store, &msg)?;
            self.recompute_counts_for_message(store, &msg)?;
            Ok(())
        })?;

        Ok(msg)
    }

    /// Apply remote attributes to a local message. Skips the write when a
    /// newer sync already ran, or when nothing observable changed. A move
    /// across folders is expressed here as an update, never insert+delete.
    pub fn update_message(
        &self,
        store: &Store,
        local: &mut Message,
        remote: &RemoteMessage,
        folder: &Folder,
        sync_ts: i64,
    ) -> Result<(), SyncError> {
        if local.synced_at > sync_ts {
            warn!(
                id = %local.id,
                "ignoring stale sync data ({} < {})",
                sync_ts,
                local.synced_at
            );
            return Ok(());
        }

        let updated = MessageAttributes::from_remote(remote);
        let folder_changed = local.folder_id != folder.id;
        if !folder_changed && local.attributes() == updated {
            return Ok(());
        }

        let old_folder = local.folder_id.clone();
        store.transaction(|| {
            local.apply_attributes(&updated);
            local.folder_id = folder.id.clone();
            local.synced_at = sync_ts;
            store.save(local, true)?;

            if let Some(mut thread) = store.find_by_id::<Thread>(&local.thread_id)? {
                self.recompute_thread(store, &mut thread)?;
            }
            self.recompute_counts_for_message(store, local)?;
            if folder_changed {
                self.recompute_category_counts(store, &old_folder)?;
            }
            Ok(())
        })
    }

    // ----- thread reconciliation ------------------------------------------

    fn find_thread_for(&self, store: &Store, msg: &Message) -> Result<Option<Thread>, SyncError> {
        if let Some(gthr) = &msg.g_thr_id {
            return store.find::<Thread>(&Query::new().equal("gThrId", gthr.clone()));
        }

        if msg.header_message_id.is_empty() {
            // Auto-generated ids carry no threading information.
            return Ok(None);
        }

        let mut ids: Vec<String> = vec![msg.header_message_id.clone()];
        ids.extend(
            msg.references
                .iter()
                .take(THREAD_MATCH_REFERENCES)
                .cloned(),
        );

        let marks: Vec<String> = (2..ids.len() + 2).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT Thread.data FROM Thread
             INNER JOIN ThreadReference ON ThreadReference.threadId = Thread.id
             WHERE ThreadReference.accountId = ?1
               AND ThreadReference.headerMessageId IN ({}) LIMIT 1",
            marks.join(",")
        );

        let data: Option<String> = store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<rusqlite::types::Value> =
                vec![self.account.id.clone().into()];
            values.extend(ids.iter().map(|id| id.clone().into()));
            stmt.query_row(rusqlite::params_from_iter(values.iter()), |row| row.get(0))
                .optional()
        })?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data).map_err(SyncError::parse)?)),
            None => Ok(None),
        }
    }

    /// Map the message's own Message-Id and its references into the thread,
    /// so future arrivals reconcile. Every parameter is bound explicitly on
    /// each iteration.
    fn upsert_thread_references(
        &self,
        store: &Store,
        thread_id: &str,
        msg: &Message,
    ) -> Result<(), SyncError> {
        store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO ThreadReference (threadId, accountId, headerMessageId)
                 VALUES (?1, ?2, ?3)",
            )?;
            if !msg.header_message_id.is_empty() {
                stmt.execute(params![thread_id, self.account.id, msg.header_message_id])?;
            }
            for reference in msg.references.iter().take(THREAD_RECORD_REFERENCES) {
                if reference.is_empty() {
                    continue;
                }
                stmt.execute(params![thread_id, self.account.id, reference])?;
            }
            Ok(())
        })
    }

    /// Recompute a thread's denormalized counters from its messages. A
    /// thread whose last message is gone is deleted, along with its
    /// references and search row.
    pub(crate) fn recompute_thread(
        &self,
        store: &Store,
        thread: &mut Thread,
    ) -> Result<(), SyncError> {
        let (count, unread, starred, first, last): (i64, i64, i64, i64, i64) = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(unread), 0), COALESCE(SUM(starred), 0),
                            COALESCE(MIN(date), 0), COALESCE(MAX(date), 0)
                     FROM Message WHERE threadId = ?1",
                    params![thread.id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
            })?;

        if count == 0 {
            if thread.version > 0 {
                store.with_conn(|conn| {
                    conn.execute(
                        "DELETE FROM ThreadReference WHERE threadId = ?1",
                        params![thread.id],
                    )?;
                    if thread.search_row_id != 0 {
                        conn.execute(
                            "DELETE FROM ThreadSearch WHERE rowid = ?1",
                            params![thread.search_row_id],
                        )?;
                    }
                    Ok(())
                })?;
                store.remove(thread)?;
            }
            return Ok(());
        }

        let categories: Vec<String> = store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT folderId FROM Message WHERE threadId = ?1 ORDER BY folderId",
            )?;
            let rows = stmt
                .query_map(params![thread.id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        thread.message_count = count;
        thread.unread = unread;
        thread.starred = starred;
        thread.first_message_timestamp = first;
        thread.last_message_timestamp = last;
        thread.categories = categories.join(" ");
        store.save(thread, true)
    }

    // ----- two-phase unlink -----------------------------------------------

    /// Tombstone messages that vanished from their folder this cycle. The
    /// client cannot see `remoteUID`, so these saves emit no deltas.
    pub fn unlink_messages(
        &self,
        store: &Store,
        messages: Vec<Message>,
        phase: u32,
    ) -> Result<(), SyncError> {
        if messages.is_empty() {
            return Ok(());
        }
        info!("unlinking {} messages no longer present (phase {})", messages.len(), phase);
        store.transaction(|| {
            for mut msg in messages {
                if is_unlinked(msg.remote_uid) {
                    // Already unlinked in a previous cycle; the delete pass
                    // will take it momentarily.
                    continue;
                }
                msg.remote_uid = unlinked_uid_for_phase(phase);
                store.save(&mut msg, false)?;
            }
            Ok(())
        })
    }

    /// Delete every message still tombstoned with `phase`. Runs in chunks
    /// of 100 per transaction so a mass deletion never blocks the database.
    pub fn delete_messages_still_unlinked_from_phase(
        &self,
        store: &Store,
        phase: u32,
    ) -> Result<(), SyncError> {
        let tombstone = unlinked_uid_for_phase(phase) as i64;
        loop {
            let batch_len = store.transaction(|| {
                let batch = store.find_all::<Message>(
                    &Query::new()
                        .equal("accountId", self.account.id.clone())
                        .equal("remoteUID", tombstone)
                        .limit(DELETE_CHUNK as u32),
                )?;

                let mut thread_ids = Vec::new();
                let mut folder_ids = Vec::new();
                for msg in &batch {
                    info!("removing \"{}\" ({})", msg.subject, msg.id);
                    store.with_conn(|conn| {
                        conn.execute("DELETE FROM MessageBody WHERE id = ?1", params![msg.id])?;
                        Ok(())
                    })?;
                    store.remove(msg)?;
                    if !thread_ids.contains(&msg.thread_id) {
                        thread_ids.push(msg.thread_id.clone());
                    }
                    if !folder_ids.contains(&msg.folder_id) {
                        folder_ids.push(msg.folder_id.clone());
                    }
                }

                for thread_id in &thread_ids {
                    if let Some(mut thread) = store.find_by_id::<Thread>(thread_id)? {
                        self.recompute_thread(store, &mut thread)?;
                    }
                }
                for folder_id in &folder_ids {
                    self.recompute_category_counts(store, folder_id)?;
                }
                Ok(batch.len())
            })?;

            if batch_len < DELETE_CHUNK {
                return Ok(());
            }
        }
    }

    // ----- body retrieval -------------------------------------------------

    /// Side-effects of a fetched body, in one transaction: body row
    /// (REPLACE), attachment rows + bytes on disk, search-index append,
    /// snippet and file list on the message.
    pub fn retrieved_message_body(
        &self,
        store: &Store,
        msg: &mut Message,
        parsed: ParsedBody,
    ) -> Result<(), SyncError> {
        let mut files: Vec<File> = Vec::new();
        for part in &parsed.files {
            if files.iter().any(|f| f.part_id == part.part_id) {
                info!("attachment {} is duplicate, skipping", part.part_id);
                continue;
            }
            let file = File {
                id: id_for_file(&msg.id, &part.part_id),
                account_id: self.account.id.clone(),
                version: 0,
                message_id: msg.id.clone(),
                part_id: part.part_id.clone(),
                filename: part.filename.clone(),
                content_type: part.content_type.clone(),
                content_id: part.content_id.clone(),
                size: part.data.len(),
            };
            // Bytes land on disk before the transaction; a crash in between
            // leaves an orphan file, never a dangling row.
            let path = file.disk_path(&self.files_root);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &part.data)?;
            files.push(file);
        }

        let snippet: String = parsed
            .text
            .chars()
            .take(SNIPPET_CHARS)
            .collect::<String>()
            .trim()
            .to_string();
        let search_text: String = parsed.text.chars().take(SEARCH_BODY_CHARS).collect();

        store.transaction(|| {
            store.with_conn(|conn| {
                conn.execute(
                    "REPLACE INTO MessageBody (id, value, fetchedAt) VALUES (?1, ?2, datetime('now'))",
                    params![msg.id, parsed.html],
                )?;
                Ok(())
            })?;

            for file in &mut files {
                // A re-fetch is benign: the rows are already there.
                match store.save(file, true) {
                    Ok(()) => {}
                    Err(err) if err.is_constraint_violation() => {
                        warn!("file {} already exists, keeping existing row", file.id);
                    }
                    Err(err) => return Err(err),
                }
            }

            if let Some(mut thread) = store.find_by_id::<Thread>(&msg.thread_id)? {
                self.append_to_thread_search(store, &mut thread, Some(msg), Some(&search_text))?;
                store.save(&mut thread, false)?;
            }

            msg.snippet = snippet.clone();
            msg.files = files
                .iter()
                .map(|f| serde_json::to_value(f).unwrap_or_default())
                .collect();
            store.save(msg, true)?;
            Ok(())
        })
    }

    // ----- search index ---------------------------------------------------

    fn append_to_thread_search(
        &self,
        store: &Store,
        thread: &mut Thread,
        msg: Option<&Message>,
        body_text: Option<&str>,
    ) -> Result<(), SyncError> {
        let existing: Option<(String, String, String)> = if thread.search_row_id != 0 {
            store.with_conn(|conn| {
                conn.query_row(
                    "SELECT to_, from_, body FROM ThreadSearch WHERE rowid = ?1",
                    params![thread.search_row_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })?
        } else {
            None
        };

        let (mut to, mut from, mut body) =
            existing.unwrap_or_else(|| (String::new(), String::new(), thread.subject.clone()));

        if let Some(msg) = msg {
            for addr in msg.to.iter().chain(&msg.cc).chain(&msg.bcc) {
                to.push(' ');
                to.push_str(&addr.email);
                if let Some(name) = &addr.name {
                    to.push(' ');
                    to.push_str(name);
                }
            }
            for addr in &msg.from {
                from.push(' ');
                from.push_str(&addr.email);
                if let Some(name) = &addr.name {
                    from.push(' ');
                    from.push_str(name);
                }
            }
        }
        if let Some(text) = body_text {
            body.push(' ');
            body.push_str(text);
        }

        let categories = thread.categories.clone();
        if thread.search_row_id != 0 {
            store.with_conn(|conn| {
                conn.execute(
                    "UPDATE ThreadSearch SET to_ = ?1, from_ = ?2, body = ?3, categories = ?4
                     WHERE rowid = ?5",
                    params![to, from, body, categories, thread.search_row_id],
                )?;
                Ok(())
            })
        } else {
            let row_id = store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO ThreadSearch (content_id, to_, from_, body, categories)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![thread.id, to, from, body, categories],
                )?;
                Ok(conn.last_insert_rowid())
            })?;
            thread.search_row_id = row_id;
            Ok(())
        }
    }

    // ----- contacts -------------------------------------------------------

    fn upsert_contacts(&self, store: &Store, msg: &Message) -> Result<(), SyncError> {
        let mut by_email: HashMap<String, Option<String>> = HashMap::new();
        for addr in msg.to.iter().chain(&msg.cc).chain(&msg.from) {
            let email = addr.email.trim().to_lowercase();
            if email.is_empty() || !email.contains('@') {
                continue;
            }
            by_email.entry(email).or_insert_with(|| addr.name.clone());
        }

        if by_email.len() > CONTACT_RECIPIENT_CAP {
            return Ok(());
        }

        let emails: Vec<String> = by_email.keys().cloned().collect();
        let existing =
            store.find_all::<Contact>(&Query::new().any("email", emails.clone()))?;
        let increment = msg.is_sent_by(&self.account.email_address);

        for mut contact in existing {
            if increment {
                contact.refs += 1;
                store.save(&mut contact, false)?;
            }
            by_email.remove(&contact.email);
        }

        for (email, name) in by_email {
            let mut contact = Contact::new(&self.account.id, &email, name);
            if increment {
                contact.refs = 1;
            }
            store.save(&mut contact, false)?;
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO ContactSearch (content_id, content) VALUES (?1, ?2)",
                    params![contact.id, contact.search_content()],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    // ----- denormalized counts --------------------------------------------

    pub(crate) fn recompute_counts_for_message(
        &self,
        store: &Store,
        msg: &Message,
    ) -> Result<(), SyncError> {
        self.recompute_category_counts(store, &msg.folder_id)?;
        for label in &msg.labels {
            let label_id: Option<String> = store.with_conn(|conn| {
                conn.query_row(
                    "SELECT id FROM Label WHERE path = ?1",
                    params![label],
                    |row| row.get(0),
                )
                .optional()
            })?;
            if let Some(label_id) = label_id {
                self.recompute_label_counts(store, &label_id, label)?;
            }
        }
        Ok(())
    }

    pub fn recompute_category_counts(
        &self,
        store: &Store,
        category_id: &str,
    ) -> Result<(), SyncError> {
        store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO ThreadCounts (categoryId, unread, total) VALUES (?1, 0, 0)",
                params![category_id],
            )?;
            conn.execute(
                "UPDATE ThreadCounts SET
                    total = (SELECT COUNT(DISTINCT threadId) FROM Message
                             WHERE folderId = ?1 AND threadId != ''),
                    unread = (SELECT COUNT(DISTINCT threadId) FROM Message
                              WHERE folderId = ?1 AND threadId != '' AND unread = 1)
                 WHERE categoryId = ?1",
                params![category_id],
            )?;
            Ok(())
        })
    }

    fn recompute_label_counts(
        &self,
        store: &Store,
        label_id: &str,
        label_path: &str,
    ) -> Result<(), SyncError> {
        // Labels live as a JSON array in the labels column; membership is a
        // substring match on the quoted name.
        let pattern = format!("%{}%", serde_json::to_string(label_path).unwrap_or_default());
        store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO ThreadCounts (categoryId, unread, total) VALUES (?1, 0, 0)",
                params![label_id],
            )?;
            conn.execute(
                "UPDATE ThreadCounts SET
                    total = (SELECT COUNT(DISTINCT threadId) FROM Message
                             WHERE labels LIKE ?2 AND threadId != ''),
                    unread = (SELECT COUNT(DISTINCT threadId) FROM Message
                              WHERE labels LIKE ?2 AND threadId != '' AND unread = 1)
                 WHERE categoryId = ?1",
                params![label_id, pattern],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::RemoteFlags;
    use crate::models::account::AccountSettings;
    use crate::store::Delta;

    fn account() -> Arc<Account> {
        Arc::new(Account {
            id: "acct".into(),
            version: 0,
            email_address: "me@example.com".into(),
            settings: AccountSettings::default(),
        })
    }

    fn setup() -> (Store, MailProcessor, flume::Receiver<Delta>) {
        let store = Store::in_memory().unwrap();
        let (tx, rx) = flume::unbounded();
        store.add_observer(tx);
        let root = std::env::temp_dir().join(format!("mailsync-test-{}", std::process::id()));
        let processor = MailProcessor::new(account(), root);
        (store, processor, rx)
    }

    fn folder(store: &Store, id: &str, role: &str) -> Folder {
        let mut f = Folder::new(id.into(), "acct".into());
        f.path = format!("Folders/{}", id);
        f.role = role.into();
        store.save(&mut f, false).unwrap();
        f
    }

    fn remote(uid: u32, message_id: &str) -> RemoteMessage {
        RemoteMessage {
            uid,
            flags: RemoteFlags {
                seen: false,
                flagged: false,
                draft: false,
            },
            header_message_id: Some(message_id.to_string()),
            subject: format!("subject {}", uid),
            from: vec![crate::models::message::EmailAddress {
                name: Some("Alice".into()),
                email: "alice@example.com".into(),
            }],
            to: vec![crate::models::message::EmailAddress {
                name: None,
                email: "me@example.com".into(),
            }],
            date: 1_700_000_000 + uid as i64,
            ..Default::default()
        }
    }

    #[test]
    fn insert_creates_message_thread_and_references() {
        let (store, processor, rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");

        let msg = processor
            .insert_fallback_to_update(&store, &remote(1, "m1@x"), &inbox, 100)
            .unwrap();
        assert!(!msg.thread_id.is_empty());

        let thread: Thread = store.find_by_id(&msg.thread_id).unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
        assert_eq!(thread.unread, 1);

        let classes: Vec<&str> = rx.try_iter().map(|d| d.object_class).collect();
        assert!(classes.contains(&"Message"));
        assert!(classes.contains(&"Thread"));
    }

    #[test]
    fn reinserting_unchanged_message_is_a_noop() {
        let (store, processor, rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");
        let r = remote(1, "m1@x");

        processor
            .insert_fallback_to_update(&store, &r, &inbox, 100)
            .unwrap();
        rx.try_iter().count();

        // Same message discovered again by the other worker.
        processor
            .insert_fallback_to_update(&store, &r, &inbox, 101)
            .unwrap();
        assert_eq!(rx.try_iter().count(), 0, "second pass must emit nothing");
        assert_eq!(store.count::<Message>(&Query::new()).unwrap(), 1);
    }

    #[test]
    fn stale_sync_timestamp_is_ignored() {
        let (store, processor, _rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");
        let mut r = remote(1, "m1@x");

        processor
            .insert_fallback_to_update(&store, &r, &inbox, 200)
            .unwrap();

        // An older scan reports the message as read; it must not win.
        r.flags.seen = true;
        processor
            .insert_fallback_to_update(&store, &r, &inbox, 150)
            .unwrap();

        let id = id_for_message("acct", &r);
        let msg: Message = store.find_by_id(&id).unwrap().unwrap();
        assert!(msg.unread);
        assert_eq!(msg.synced_at, 200);
    }

    #[test]
    fn messages_sharing_references_converge_to_one_thread() {
        let (store, processor, _rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");

        let m1 = processor
            .insert_fallback_to_update(&store, &remote(1, "root@x"), &inbox, 100)
            .unwrap();

        let mut reply = remote(2, "reply@x");
        reply.references = vec!["root@x".into()];
        let m2 = processor
            .insert_fallback_to_update(&store, &reply, &inbox, 100)
            .unwrap();
        assert_eq!(m1.thread_id, m2.thread_id);

        // Third message referencing only the reply still converges.
        let mut third = remote(3, "third@x");
        third.references = vec!["reply@x".into()];
        let m3 = processor
            .insert_fallback_to_update(&store, &third, &inbox, 100)
            .unwrap();
        assert_eq!(m1.thread_id, m3.thread_id);

        let thread: Thread = store.find_by_id(&m1.thread_id).unwrap().unwrap();
        assert_eq!(thread.message_count, 3);
    }

    #[test]
    fn gmail_thread_id_wins_over_fresh_thread() {
        let (store, processor, _rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");

        let mut a = remote(1, "a@x");
        a.gmail_message_id = Some(11);
        a.gmail_thread_id = Some(777);
        let mut b = remote(2, "b@x");
        b.gmail_message_id = Some(12);
        b.gmail_thread_id = Some(777);

        let m1 = processor
            .insert_fallback_to_update(&store, &a, &inbox, 100)
            .unwrap();
        let m2 = processor
            .insert_fallback_to_update(&store, &b, &inbox, 100)
            .unwrap();
        assert_eq!(m1.thread_id, m2.thread_id);
    }

    #[test]
    fn move_is_detected_as_update_and_restores_uid() {
        let (store, processor, _rx) = setup();
        let folder_a = folder(&store, "fa", "inbox");
        let folder_b = folder(&store, "fb", "archive");

        let r = remote(42, "moved@x");
        let msg = processor
            .insert_fallback_to_update(&store, &r, &folder_a, 100)
            .unwrap();

        // Deep scan of A saw it missing: unlink, phase 1.
        processor
            .unlink_messages(&store, vec![msg.clone()], 1)
            .unwrap();
        let tomb: Message = store.find_by_id(&msg.id).unwrap().unwrap();
        assert!(is_unlinked(tomb.remote_uid));

        // Deep scan of B re-observes it under a new UID: the id collides,
        // insert falls back to update, the real UID is restored.
        let mut in_b = r.clone();
        in_b.uid = 7;
        let updated = processor
            .insert_fallback_to_update(&store, &in_b, &folder_b, 101)
            .unwrap();
        assert_eq!(updated.id, msg.id);

        let stored: Message = store.find_by_id(&msg.id).unwrap().unwrap();
        assert_eq!(stored.folder_id, "fb");
        assert_eq!(stored.remote_uid, 7);
        assert_eq!(stored.folder_imap_uid, 7);

        // Phase 1's delete pass finds nothing to reap.
        processor
            .delete_messages_still_unlinked_from_phase(&store, 1)
            .unwrap();
        assert!(store.find_by_id::<Message>(&msg.id).unwrap().is_some());
    }

    #[test]
    fn two_phase_unlink_deletes_after_second_cycle() {
        let (store, processor, rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");

        let msg = processor
            .insert_fallback_to_update(&store, &remote(5, "gone@x"), &inbox, 100)
            .unwrap();
        rx.try_iter().count();

        processor.unlink_messages(&store, vec![msg.clone()], 1).unwrap();
        // Tombstone writes are invisible to the client.
        assert_eq!(rx.try_iter().count(), 0);

        // End of cycle: flip to phase 2, delete pass for phase 2 finds
        // nothing (message tombstoned at phase 1).
        processor
            .delete_messages_still_unlinked_from_phase(&store, 2)
            .unwrap();
        assert!(store.find_by_id::<Message>(&msg.id).unwrap().is_some());

        // Next cycle ends: phase flips back to 1 and reaps it.
        processor
            .delete_messages_still_unlinked_from_phase(&store, 1)
            .unwrap();
        assert!(store.find_by_id::<Message>(&msg.id).unwrap().is_none());

        // The thread died with its last message.
        assert!(store.find_by_id::<Thread>(&msg.thread_id).unwrap().is_none());
        let classes: Vec<&str> = rx.try_iter().map(|d| d.object_class).collect();
        assert!(classes.contains(&"Message"));
        assert!(classes.contains(&"Thread"));
    }

    #[test]
    fn body_retrieval_writes_everything_in_one_pass() {
        let (store, processor, _rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");
        let mut msg = processor
            .insert_fallback_to_update(&store, &remote(9, "body@x"), &inbox, 100)
            .unwrap();

        let parsed = ParsedBody {
            html: "<p>Hello there, this is the body.</p>".into(),
            text: "Hello there, this is the body.".into(),
            files: vec![crate::body::ParsedFile {
                part_id: "1.2".into(),
                filename: "notes.txt".into(),
                content_type: "text/plain".into(),
                content_id: None,
                data: b"attached".to_vec(),
            }],
        };

        processor
            .retrieved_message_body(&store, &mut msg, parsed.clone())
            .unwrap();
        assert!(msg.snippet.starts_with("Hello there"));
        assert_eq!(msg.files.len(), 1);

        let body: Option<String> = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM MessageBody WHERE id = ?1",
                    params![msg.id],
                    |row| row.get(0),
                )
                .optional()
            })
            .unwrap();
        assert_eq!(body.unwrap(), "<p>Hello there, this is the body.</p>");

        // Re-fetch is benign.
        processor
            .retrieved_message_body(&store, &mut msg, parsed)
            .unwrap();
        assert_eq!(store.count::<File>(&Query::new()).unwrap(), 1);
    }

    #[test]
    fn sent_mail_increments_contact_refs() {
        let (store, processor, _rx) = setup();
        let sent = folder(&store, "sent", "sent");

        let mut outgoing = remote(1, "sent@x");
        outgoing.from = vec![crate::models::message::EmailAddress {
            name: None,
            email: "me@example.com".into(),
        }];
        outgoing.to = vec![crate::models::message::EmailAddress {
            name: Some("Bob".into()),
            email: "bob@example.com".into(),
        }];

        processor
            .insert_fallback_to_update(&store, &outgoing, &sent, 100)
            .unwrap();

        let contacts = store
            .find_all::<Contact>(&Query::new().equal("email", "bob@example.com".to_string()))
            .unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].refs, 1);

        // Receiving mail from bob does not bump the refcount.
        let mut incoming = remote(2, "in@x");
        incoming.from = vec![crate::models::message::EmailAddress {
            name: Some("Bob".into()),
            email: "bob@example.com".into(),
        }];
        let inbox = folder(&store, "inbox", "inbox");
        processor
            .insert_fallback_to_update(&store, &incoming, &inbox, 100)
            .unwrap();

        let contacts = store
            .find_all::<Contact>(&Query::new().equal("email", "bob@example.com".to_string()))
            .unwrap();
        assert_eq!(contacts[0].refs, 1);
    }

    #[test]
    fn mass_mail_creates_no_contacts() {
        let (store, processor, _rx) = setup();
        let inbox = folder(&store, "inbox", "inbox");

        let mut blast = remote(1, "blast@x");
        blast.to = (0..30)
            .map(|i| crate::models::message::EmailAddress {
                name: None,
                email: format!("user{}@example.com", i),
            })
            .collect();

        processor
            .insert_fallback_to_update(&store, &blast, &inbox, 100)
            .unwrap();
        assert_eq!(store.count::<Contact>(&Query::new()).unwrap(), 0);
    }
}
