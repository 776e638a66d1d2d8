//! Transactional persistence and change-delta fan-out.
//!
//! Each worker thread owns its own `Store` over a shared connection pool;
//! cross-thread serialization is the database's job (WAL + busy timeout).
//! Deltas are buffered while a transaction is open and emitted only after
//! the outermost commit, so observers never see state that rolls back.

pub mod delta;
pub mod query;
pub mod schema;

pub use delta::{Delta, Observers};
pub use query::Query;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;

use crate::error::SyncError;
use crate::models::{MailModel, Message, MessageAttributes};

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open the shared pool for an on-disk database and run migrations.
pub fn open_pool(path: &Path) -> Result<DbPool, SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manager = SqliteConnectionManager::file(path)
        // busy_timeout is per-connection; every pool member needs it.
        .with_init(|conn| conn.busy_timeout(std::time::Duration::from_secs(10)));
    let pool = r2d2::Pool::builder().max_size(6).build(manager)?;
    schema::migrate(&pool.get()?)?;
    Ok(pool)
}

pub struct Store {
    pool: DbPool,
    observers: Observers,
    tx_conn: RefCell<Option<DbConnection>>,
    tx_depth: Cell<u32>,
    pending: RefCell<Vec<Delta>>,
}

impl Store {
    pub fn new(pool: DbPool, observers: Observers) -> Store {
        Store {
            pool,
            observers,
            tx_conn: RefCell::new(None),
            tx_depth: Cell::new(0),
            pending: RefCell::new(Vec::new()),
        }
    }

    /// In-memory store for tests. Pool size 1: a second connection would
    /// see a different empty database.
    pub fn in_memory() -> Result<Store, SyncError> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        schema::migrate(&pool.get()?)?;
        Ok(Store::new(pool, Observers::new()))
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    pub fn observers(&self) -> Observers {
        self.observers.clone()
    }

    pub fn add_observer(&self, sink: flume::Sender<Delta>) {
        self.observers.add_observer(sink);
    }

    /// Run `f` against the pinned transaction connection, or a transient
    /// pooled one outside a transaction.
    pub fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, rusqlite::Error>,
    ) -> Result<R, SyncError> {
        let pinned = self.tx_conn.borrow();
        match pinned.as_ref() {
            Some(conn) => Ok(f(conn)?),
            None => {
                drop(pinned);
                let conn = self.pool.get()?;
                Ok(f(&conn)?)
            }
        }
    }

    // ----- transactions ---------------------------------------------------

    /// Nestable via refcount; only the outermost call opens/commits.
    pub fn begin_transaction(&self) -> Result<(), SyncError> {
        if self.tx_depth.get() == 0 {
            let conn = self.pool.get()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            *self.tx_conn.borrow_mut() = Some(conn);
        }
        self.tx_depth.set(self.tx_depth.get() + 1);
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<(), SyncError> {
        let depth = self.tx_depth.get();
        debug_assert!(depth > 0, "commit without begin");
        if depth == 1 {
            {
                let conn = self.tx_conn.borrow();
                conn.as_ref()
                    .expect("transaction connection")
                    .execute_batch("COMMIT")?;
            }
            *self.tx_conn.borrow_mut() = None;
            self.tx_depth.set(0);
            for delta in self.pending.borrow_mut().drain(..) {
                self.observers.emit(delta);
            }
        } else {
            self.tx_depth.set(depth - 1);
        }
        Ok(())
    }

    /// Abort the whole transaction stack. Buffered deltas are dropped; the
    /// UI never hears about work that didn't commit.
    pub fn rollback_transaction(&self) {
        if self.tx_depth.get() == 0 {
            return;
        }
        if let Some(conn) = self.tx_conn.borrow_mut().take() {
            let _ = conn.execute_batch("ROLLBACK");
        }
        self.tx_depth.set(0);
        self.pending.borrow_mut().clear();
    }

    pub fn transaction<R>(
        &self,
        f: impl FnOnce() -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        self.begin_transaction()?;
        match f() {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback_transaction();
                Err(err)
            }
        }
    }

    fn queue_delta(&self, delta: Delta) {
        if self.tx_depth.get() > 0 {
            self.pending.borrow_mut().push(delta);
        } else {
            self.observers.emit(delta);
        }
    }

    // ----- persistence ----------------------------------------------------

    /// Insert-or-update. A model at version 0 is inserted (and raises the
    /// table's constraints); anything newer is updated in place.
    pub fn save<T: MailModel>(&self, model: &mut T, emit: bool) -> Result<(), SyncError> {
        let previous = model.version();
        model.set_version(previous + 1);

        let result = if model.version() == 1 {
            self.insert(model)
        } else {
            self.update(model)
        };
        if let Err(err) = result {
            model.set_version(previous);
            return Err(err);
        }

        if emit {
            let delta = Delta::persist(model).map_err(SyncError::parse)?;
            self.queue_delta(delta);
        }
        Ok(())
    }

    fn insert<T: MailModel>(&self, model: &T) -> Result<(), SyncError> {
        let columns = T::columns();
        let mut names = vec!["id", "accountId", "version", "data"];
        names.extend_from_slice(columns);
        let marks: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::TABLE,
            names.join(", "),
            marks.join(", ")
        );

        let data = serde_json::to_string(model).map_err(SyncError::parse)?;
        let mut values: Vec<rusqlite::types::Value> = vec![
            model.id().to_string().into(),
            model.account_id().to_string().into(),
            model.version().into(),
            data.into(),
        ];
        values.extend(model.extra_values());

        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    fn update<T: MailModel>(&self, model: &T) -> Result<(), SyncError> {
        let columns = T::columns();
        let mut sets = vec![
            "accountId = ?2".to_string(),
            "version = ?3".to_string(),
            "data = ?4".to_string(),
        ];
        for (i, col) in columns.iter().enumerate() {
            sets.push(format!("{} = ?{}", col, i + 5));
        }
        let sql = format!("UPDATE {} SET {} WHERE id = ?1", T::TABLE, sets.join(", "));

        let data = serde_json::to_string(model).map_err(SyncError::parse)?;
        let mut values: Vec<rusqlite::types::Value> = vec![
            model.id().to_string().into(),
            model.account_id().to_string().into(),
            model.version().into(),
            data.into(),
        ];
        values.extend(model.extra_values());

        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    pub fn remove<T: MailModel>(&self, model: &T) -> Result<(), SyncError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE);
        self.with_conn(|conn| {
            conn.execute(&sql, params![model.id()])?;
            Ok(())
        })?;
        let delta = Delta::unpersist(model).map_err(SyncError::parse)?;
        self.queue_delta(delta);
        Ok(())
    }

    // ----- queries --------------------------------------------------------

    pub fn find<T: MailModel>(&self, query: &Query) -> Result<Option<T>, SyncError> {
        let (sql, values) = query.clone().limit(1).to_sql(T::TABLE, "data");
        let row: Option<String> = self.with_conn(|conn| {
            conn.query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
                row.get(0)
            })
            .optional()
        })?;
        match row {
            Some(data) => Ok(Some(serde_json::from_str(&data).map_err(SyncError::parse)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_id<T: MailModel>(&self, id: &str) -> Result<Option<T>, SyncError> {
        self.find(&Query::new().equal("id", id.to_string()))
    }

    pub fn find_all<T: MailModel>(&self, query: &Query) -> Result<Vec<T>, SyncError> {
        let (sql, values) = query.to_sql(T::TABLE, "data");
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|data| serde_json::from_str(&data).map_err(SyncError::parse))
            .collect()
    }

    pub fn find_all_map<T: MailModel>(
        &self,
        query: &Query,
    ) -> Result<HashMap<String, T>, SyncError> {
        Ok(self
            .find_all::<T>(query)?
            .into_iter()
            .map(|m| (m.id().to_string(), m))
            .collect())
    }

    pub fn count<T: MailModel>(&self, query: &Query) -> Result<i64, SyncError> {
        let (sql, values) = query.to_sql(T::TABLE, "COUNT(*)");
        self.with_conn(|conn| {
            conn.query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
                row.get(0)
            })
        })
    }

    // ----- sync-specific lookups -----------------------------------------

    /// Local `(uid -> attributes)` map for a folder's UID range, read off
    /// the indexed columns so a deep scan never hydrates full documents.
    pub fn message_attributes_in_range(
        &self,
        folder_id: &str,
        lo: u32,
        hi: u32,
    ) -> Result<HashMap<u32, MessageAttributes>, SyncError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT folderImapUID, remoteUID, unread, starred, draft, labels
                 FROM Message WHERE folderId = ?1 AND folderImapUID >= ?2 AND folderImapUID < ?3",
            )?;
            let mut map = HashMap::new();
            let mut rows = stmt.query(params![folder_id, lo as i64, hi as i64])?;
            while let Some(row) = rows.next()? {
                let uid: i64 = row.get(0)?;
                let labels: String = row.get(5)?;
                let mut labels: Vec<String> = serde_json::from_str(&labels).unwrap_or_default();
                labels.sort();
                map.insert(
                    uid as u32,
                    MessageAttributes {
                        uid: row.get::<_, i64>(1)? as u32,
                        unread: row.get::<_, i64>(2)? != 0,
                        starred: row.get::<_, i64>(3)? != 0,
                        draft: row.get::<_, i64>(4)? != 0,
                        labels,
                    },
                );
            }
            Ok(map)
        })
    }

    /// The UID `depth` messages down from `before` in a folder, for the
    /// shallow-scan window. Collapses to 1 near the start of the mailbox.
    pub fn message_uid_at_depth(
        &self,
        folder_id: &str,
        depth: u32,
        before: u32,
    ) -> Result<u32, SyncError> {
        let uid: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT folderImapUID FROM Message
                 WHERE folderId = ?1 AND folderImapUID < ?2
                 ORDER BY folderImapUID DESC LIMIT 1 OFFSET ?3",
                params![folder_id, before as i64, depth as i64],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(uid.map(|v| v as u32).unwrap_or(1))
    }

    /// Recent (or draft) messages in a folder still missing a body.
    pub fn messages_needing_bodies(
        &self,
        folder_id: &str,
        newer_than: i64,
        limit: u32,
    ) -> Result<Vec<Message>, SyncError> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT Message.data FROM Message
                 LEFT JOIN MessageBody ON MessageBody.id = Message.id
                 WHERE Message.folderId = ?1
                   AND (Message.date > ?2 OR Message.draft = 1)
                   AND MessageBody.value IS NULL
                 ORDER BY Message.date DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![folder_id, newer_than, limit], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|data| serde_json::from_str(&data).map_err(SyncError::parse))
            .collect()
    }
}
