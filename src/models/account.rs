use serde::{Deserialize, Serialize};

use super::MailModel;

/// Connection security requested for a server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Security {
    #[serde(rename = "SSL / TLS", alias = "SSL/TLS", alias = "tls")]
    #[default]
    Tls,
    #[serde(rename = "STARTTLS", alias = "starttls")]
    StartTls,
    #[serde(rename = "none")]
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct AccountSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    #[serde(default)]
    pub imap_password: String,
    #[serde(default)]
    pub imap_security: Security,
    #[serde(default)]
    pub imap_allow_insecure_ssl: bool,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub smtp_security: Security,
    #[serde(default)]
    pub smtp_allow_insecure_ssl: bool,

    /// Opaque OAuth refresh token; when present it stands in for passwords.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// One account per worker process. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub version: i64,
    pub email_address: String,
    pub settings: AccountSettings,
}

impl Account {
    /// Parse the account JSON handed over by the parent process.
    pub fn from_json(raw: &str) -> Result<Account, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Must hold before sync begins: endpoints and some credential present.
    pub fn valid(&self) -> bool {
        let s = &self.settings;
        let has_imap_cred = !s.imap_password.is_empty() || s.refresh_token.is_some();
        let has_smtp_cred = !s.smtp_password.is_empty() || s.refresh_token.is_some();
        !self.id.is_empty()
            && !self.email_address.is_empty()
            && !s.imap_host.is_empty()
            && s.imap_port != 0
            && !s.imap_username.is_empty()
            && has_imap_cred
            && !s.smtp_host.is_empty()
            && s.smtp_port != 0
            && has_smtp_cred
    }
}

impl MailModel for Account {
    const TABLE: &'static str = "Account";

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn columns() -> &'static [&'static str] {
        &["emailAddress"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![self.email_address.clone().into()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Account {
        serde_json::from_value(serde_json::json!({
            "id": "acct-1",
            "emailAddress": "user@example.com",
            "settings": {
                "imap_host": "imap.example.com",
                "imap_port": 993,
                "imap_username": "user@example.com",
                "imap_password": "hunter2",
                "smtp_host": "smtp.example.com",
                "smtp_port": 587,
                "smtp_username": "user@example.com",
                "smtp_password": "hunter2",
                "smtp_security": "STARTTLS"
            }
        }))
        .expect("account json")
    }

    #[test]
    fn parses_and_validates() {
        let account = sample();
        assert!(account.valid());
        assert_eq!(account.settings.imap_security, Security::Tls);
        assert_eq!(account.settings.smtp_security, Security::StartTls);
    }

    #[test]
    fn refresh_token_substitutes_for_passwords() {
        let mut account = sample();
        account.settings.imap_password.clear();
        account.settings.smtp_password.clear();
        assert!(!account.valid());
        account.settings.refresh_token = Some("tok".into());
        assert!(account.valid());
    }

    #[test]
    fn missing_endpoint_is_invalid() {
        let mut account = sample();
        account.settings.imap_host.clear();
        assert!(!account.valid());
    }
}
