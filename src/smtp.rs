//! SMTP submission. A transport is opened per task that needs one and
//! dropped when it completes; nothing is shared with the sync sessions.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::account::{Account, Security};

/// An outgoing message as the client composes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Rendered HTML body.
    #[serde(default)]
    pub body: String,
}

impl Draft {
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

fn transport(account: &Account) -> Result<AsyncSmtpTransport<Tokio1Executor>, SyncError> {
    let settings = &account.settings;
    let builder = match settings.smtp_security {
        Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host),
        Security::StartTls => {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
        }
        Security::Plain => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
            &settings.smtp_host,
        )),
    }
    .map_err(|e| SyncError::Net(format!("SMTP transport setup failed: {}", e)))?;

    Ok(builder
        .port(settings.smtp_port)
        .credentials(Credentials::new(
            settings.smtp_username.clone(),
            settings.smtp_password.clone(),
        ))
        .build())
}

pub fn build_mime(account: &Account, draft: &Draft) -> Result<Message, SyncError> {
    if draft.to.is_empty() {
        return Err(SyncError::TaskRejected("draft has no recipients".into()));
    }

    let from: Mailbox = account
        .email_address
        .parse()
        .map_err(|e| SyncError::TaskRejected(format!("bad from address: {}", e)))?;

    let mut builder = Message::builder().from(from).subject(draft.subject.clone());
    for (field, addrs) in [("to", &draft.to), ("cc", &draft.cc), ("bcc", &draft.bcc)] {
        for addr in addrs.iter() {
            let mailbox: Mailbox = addr
                .parse()
                .map_err(|e| SyncError::TaskRejected(format!("bad {} address {}: {}", field, addr, e)))?;
            builder = match field {
                "to" => builder.to(mailbox),
                "cc" => builder.cc(mailbox),
                _ => builder.bcc(mailbox),
            };
        }
    }

    builder
        .header(ContentType::TEXT_HTML)
        .body(draft.body.clone())
        .map_err(|e| SyncError::TaskRejected(format!("could not build message: {}", e)))
}

/// Submit a draft. Transient SMTP failures come back retryable; permanent
/// rejections complete the task with an error.
pub async fn send(account: &Account, draft: &Draft) -> Result<(), SyncError> {
    let email = build_mime(account, draft)?;
    let mailer = transport(account)?;
    mailer.send(email).await.map_err(|e| {
        if e.is_permanent() {
            SyncError::Other(format!("SMTP rejected the message: {}", e))
        } else {
            SyncError::Net(format!("SMTP send failed: {}", e))
        }
    })?;
    Ok(())
}

/// `--mode test` SMTP probe: connect and authenticate, then tear down.
/// The transport drops (and with it the connection) on every exit path.
pub async fn test_auth(account: &Account) -> Result<(), SyncError> {
    let mailer = transport(account)?;
    let ok = mailer
        .test_connection()
        .await
        .map_err(|e| SyncError::Auth(format!("SMTP connection failed: {}", e)))?;
    if !ok {
        return Err(SyncError::Auth("SMTP server rejected the connection".into()));
    }
    Ok(())
}
