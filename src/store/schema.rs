//! Schema for the per-account database.
//!
//! Every entity table carries `(id, accountId, version, data)` plus indexed
//! side columns. `migrate` is idempotent and doubles as the `--mode migrate`
//! entry point.

use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 10000;
        PRAGMA foreign_keys = OFF;

        CREATE TABLE IF NOT EXISTS Account (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            emailAddress TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS Folder (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            path TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS Label (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            path TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS Message (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            headerMessageId TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            date INTEGER NOT NULL DEFAULT 0,
            draft INTEGER NOT NULL DEFAULT 0,
            unread INTEGER NOT NULL DEFAULT 0,
            starred INTEGER NOT NULL DEFAULT 0,
            folderId TEXT NOT NULL,
            folderImapUID INTEGER NOT NULL,
            remoteUID INTEGER NOT NULL,
            threadId TEXT NOT NULL DEFAULT '',
            labels TEXT NOT NULL DEFAULT '[]',
            syncedAt INTEGER NOT NULL DEFAULT 0
        );

        -- Live messages are unique per folder slot. Tombstoned rows
        -- (remoteUID near u32::MAX) and locally-moved rows awaiting a
        -- fresh UID (folderImapUID = 0) are exempt.
        CREATE UNIQUE INDEX IF NOT EXISTS MessageFolderUID
            ON Message (folderId, folderImapUID)
            WHERE remoteUID < 4294967291 AND folderImapUID > 0;
        CREATE INDEX IF NOT EXISTS MessageThreadId ON Message (threadId);
        CREATE INDEX IF NOT EXISTS MessageHeaderMessageId ON Message (headerMessageId);
        CREATE INDEX IF NOT EXISTS MessageFolderDate ON Message (folderId, date DESC);
        CREATE INDEX IF NOT EXISTS MessageRemoteUID ON Message (remoteUID);

        CREATE TABLE IF NOT EXISTS MessageBody (
            id TEXT PRIMARY KEY,
            value TEXT,
            fetchedAt TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS File (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            messageId TEXT NOT NULL,
            partId TEXT NOT NULL,
            filename TEXT NOT NULL DEFAULT '',
            UNIQUE (messageId, partId)
        );

        CREATE TABLE IF NOT EXISTS Thread (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            gThrId TEXT,
            subject TEXT NOT NULL DEFAULT '',
            unread INTEGER NOT NULL DEFAULT 0,
            starred INTEGER NOT NULL DEFAULT 0,
            lastMessageTimestamp INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS ThreadGThrId ON Thread (gThrId);

        CREATE TABLE IF NOT EXISTS ThreadReference (
            threadId TEXT NOT NULL,
            accountId TEXT NOT NULL,
            headerMessageId TEXT NOT NULL,
            PRIMARY KEY (threadId, headerMessageId)
        );

        CREATE INDEX IF NOT EXISTS ThreadReferenceLookup
            ON ThreadReference (accountId, headerMessageId);

        CREATE TABLE IF NOT EXISTS ThreadCounts (
            categoryId TEXT PRIMARY KEY,
            unread INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS ThreadSearch
            USING fts5(content_id UNINDEXED, to_, from_, body, categories);

        CREATE TABLE IF NOT EXISTS Contact (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            email TEXT NOT NULL,
            refs INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS ContactEmail ON Contact (accountId, email);

        CREATE VIRTUAL TABLE IF NOT EXISTS ContactSearch
            USING fts5(content_id UNINDEXED, content);

        CREATE TABLE IF NOT EXISTS Task (
            id TEXT PRIMARY KEY,
            accountId TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS TaskStatus ON Task (status);
        "#,
    )
}
