//! Mail synchronization worker.
//!
//! A long-lived child process of a desktop mail client. It maintains a
//! local, queryable replica of one remote IMAP mailbox and executes
//! client-initiated mutations against the server, speaking line-delimited
//! JSON with its parent over stdin/stdout.
//!
//! ## Module organization
//!
//! - `models/`: persisted entities and their table mappings
//! - `store/`: transactional persistence, queries, delta fan-out
//! - `imap/`: the IMAP collaborator interface and its async-imap backend
//! - `body`: MIME parsing into html/text/attachments
//! - `processor`: idempotent message reconciliation (threading, two-phase
//!   unlink, body side-effects)
//! - `sync/`: the background and foreground workers and the engine
//! - `tasks/`: the local/remote task state machine
//! - `channel`: the parent-process wire protocol
//! - `smtp`: message submission

pub mod body;
pub mod channel;
pub mod config;
pub mod error;
pub mod imap;
pub mod models;
pub mod processor;
pub mod smtp;
pub mod store;
pub mod sync;
pub mod tasks;

pub use error::SyncError;
