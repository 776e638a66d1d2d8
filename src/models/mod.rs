//! Persisted entities.
//!
//! Every entity is stored as a full JSON document in its table's `data`
//! column, alongside a handful of indexed "side" columns used by queries.
//! The `MailModel` trait is the per-entity capability set the store needs:
//! table name, extra column list, bind procedure, and serde-based hydration.

pub mod account;
pub mod contact;
pub mod file;
pub mod folder;
pub mod message;
pub mod task;
pub mod thread;

pub use account::Account;
pub use contact::Contact;
pub use file::File;
pub use folder::{Folder, Label, LocalStatus};
pub use message::{Message, MessageAttributes};
pub use task::{Task, TaskStatus};
pub use thread::Thread;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Capability set every stored entity declares.
///
/// Rows always carry `(id, accountId, version, data)`; `columns()` names the
/// extra indexed columns and `extra_values()` produces their bind values in
/// the same order.
pub trait MailModel: Serialize + DeserializeOwned {
    const TABLE: &'static str;

    fn id(&self) -> &str;
    fn account_id(&self) -> &str;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);

    /// Indexed columns beyond the common four.
    fn columns() -> &'static [&'static str];

    /// Bind values for `columns()`, in order.
    fn extra_values(&self) -> Vec<rusqlite::types::Value>;
}

/// Deterministic entity id: hex sha256 over the identity parts, truncated.
/// 40 hex chars keeps ids stable, collision-safe and readable in logs.
pub fn digest_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x1f");
        }
        hasher.update(part.as_bytes());
    }
    let mut out = hex::encode(hasher.finalize());
    out.truncate(40);
    out
}

pub fn id_for_folder(account_id: &str, path: &str) -> String {
    digest_id(&[account_id, path])
}

pub fn id_for_contact(account_id: &str, email: &str) -> String {
    digest_id(&[account_id, &email.trim().to_lowercase()])
}

pub fn id_for_file(message_id: &str, part_id: &str) -> String {
    digest_id(&[message_id, part_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_truncated() {
        let a = digest_id(&["acct", "INBOX"]);
        let b = digest_id(&["acct", "INBOX"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn digest_separates_parts() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(digest_id(&["ab", "c"]), digest_id(&["a", "bc"]));
    }

    #[test]
    fn contact_id_normalizes_email() {
        assert_eq!(
            id_for_contact("a1", " Bob@Example.COM "),
            id_for_contact("a1", "bob@example.com")
        );
    }
}
