use serde::{Deserialize, Serialize};

use super::MailModel;

/// An address the account has exchanged mail with. `refs` counts how many
/// times the user themselves sent to it, which drives autocomplete ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub refs: i64,
}

impl Contact {
    pub fn new(account_id: &str, email: &str, name: Option<String>) -> Contact {
        Contact {
            id: super::id_for_contact(account_id, email),
            account_id: account_id.to_string(),
            version: 0,
            email: email.trim().to_lowercase(),
            name,
            refs: 0,
        }
    }

    /// What the ContactSearch FTS row indexes.
    pub fn search_content(&self) -> String {
        match &self.name {
            Some(name) => format!("{} {}", name, self.email),
            None => self.email.clone(),
        }
    }
}

impl MailModel for Contact {
    const TABLE: &'static str = "Contact";

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
        &["email", "refs"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![self.email.clone().into(), self.refs.into()]
    }
}
