//! async-imap implementation of [`MailApi`].
//!
//! An IMAP session is generic over its stream type; ours is TLS-encrypted
//! TCP. Each worker owns exactly one backend, and therefore one session.

use async_imap::imap_proto::{MailboxDatum, Response, Status as ImapStatus};
use async_imap::types::{Fetch, NameAttribute};
use async_imap::Session;
use async_native_tls::TlsStream;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use std::sync::Arc;

use super::capability::Capabilities;
use super::envelope;
use super::{uid_set, CondstoreChanges, MailApi, RemoteFolder, RemoteFolderStatus, RemoteMessage};
use crate::error::SyncError;
use crate::models::account::{Account, Security};
use crate::sync::idle::{Interrupt, IDLE_TIMEOUT};

pub type ImapSession = Session<TlsStream<TcpStream>>;

pub struct ImapBackend {
    account: Arc<Account>,
    session: Option<ImapSession>,
    capabilities: Capabilities,
    selected: Option<String>,
}

impl ImapBackend {
    pub fn new(account: Arc<Account>) -> ImapBackend {
        ImapBackend {
            account,
            session: None,
            capabilities: Capabilities::default(),
            selected: None,
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession, SyncError> {
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::Net("IMAP session not connected".into()))
    }

    async fn select(&mut self, path: &str) -> Result<(), SyncError> {
        if self.selected.as_deref() == Some(path) {
            return Ok(());
        }
        self.session()?
            .select(path)
            .await
            .map_err(|e| SyncError::Imap(format!("SELECT {} failed: {}", path, e)))?;
        self.selected = Some(path.to_string());
        Ok(())
    }

    /// Headers-only fetch for a UID set, with a second pass that merges in
    /// the References header (the envelope only carries In-Reply-To).
    async fn fetch_headers(
        &mut self,
        path: &str,
        uid_query: &str,
        modifier: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        self.select(path).await?;
        let session = self.session()?;

        let query = format!("(UID FLAGS ENVELOPE){}", modifier);
        let fetches: Vec<Fetch> = session
            .uid_fetch(uid_query, &query)
            .await
            .map_err(|e| SyncError::Imap(format!("FETCH failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("FETCH collect failed: {}", e)))?;

        let mut messages: Vec<RemoteMessage> = fetches
            .iter()
            .filter_map(envelope::remote_message_from_fetch)
            .collect();

        if !messages.is_empty() {
            let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
            let refs_fetches: Vec<Fetch> = session
                .uid_fetch(
                    uid_set(&uids),
                    "(UID BODY.PEEK[HEADER.FIELDS (References)])",
                )
                .await
                .map_err(|e| SyncError::Imap(format!("FETCH references failed: {}", e)))?
                .try_collect()
                .await
                .map_err(|e| SyncError::Imap(format!("FETCH references collect failed: {}", e)))?;

            for fetch in &refs_fetches {
                if let (Some(uid), Some(header)) = (fetch.uid, fetch.header()) {
                    let text = String::from_utf8_lossy(header);
                    let value = text
                        .splitn(2, ':')
                        .nth(1)
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    envelope::merge_references(&mut messages, uid, &value);
                }
            }
        }

        Ok(messages)
    }
}

impl MailApi for ImapBackend {
    async fn connect(&mut self) -> Result<(), SyncError> {
        if self.session.is_some() {
            return Ok(());
        }

        let settings = &self.account.settings;
        if settings.imap_security != Security::Tls {
            return Err(SyncError::AccountInvalid(
                "only implicit TLS IMAP connections are supported".into(),
            ));
        }

        info!(host = %settings.imap_host, port = settings.imap_port, "connecting to IMAP server");

        let tcp = TcpStream::connect((settings.imap_host.as_str(), settings.imap_port))
            .await
            .map_err(|e| SyncError::Net(format!("TCP connection failed: {}", e)))?;

        let mut tls = async_native_tls::TlsConnector::new();
        if settings.imap_allow_insecure_ssl {
            tls = tls
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let tls_stream = tls
            .connect(settings.imap_host.as_str(), tcp)
            .await
            .map_err(|e| SyncError::Net(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&settings.imap_username, &settings.imap_password)
            .await
            .map_err(|(e, _)| SyncError::Auth(format!("IMAP login failed: {}", e)))?;

        let caps = session
            .capabilities()
            .await
            .map_err(|e| SyncError::Imap(format!("CAPABILITY failed: {}", e)))?;
        let raw: Vec<String> = ["CONDSTORE", "QRESYNC", "ENABLE", "IDLE", "X-GM-EXT-1"]
            .iter()
            .filter(|c| caps.has_str(c))
            .map(|c| c.to_string())
            .collect();
        self.capabilities = Capabilities::detect(&raw);
        debug!(caps = ?self.capabilities, "detected server capabilities");

        if self.capabilities.qresync {
            // QRESYNC must be enabled before VANISHED responses arrive.
            session
                .run_command_and_check_ok("ENABLE QRESYNC")
                .await
                .map_err(|e| SyncError::Imap(format!("ENABLE QRESYNC failed: {}", e)))?;
        }

        self.session = Some(session);
        self.selected = None;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn fetch_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError> {
        let session = self.session()?;
        let names: Vec<_> = session
            .list(None, Some("*"))
            .await
            .map_err(|e| SyncError::Imap(format!("LIST failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("LIST collect failed: {}", e)))?;

        Ok(names
            .iter()
            .map(|name| {
                let attributes: Vec<String> = name
                    .attributes()
                    .iter()
                    .map(|attr| match attr {
                        // Extensions already carry their leading backslash.
                        NameAttribute::Extension(s) => s.to_string(),
                        other => format!("\\{:?}", other),
                    })
                    .collect();
                RemoteFolder {
                    path: name.name().to_string(),
                    no_select: attributes.iter().any(|a| a.contains("NoSelect")),
                    attributes,
                }
            })
            .collect())
    }

    async fn folder_status(&mut self, path: &str) -> Result<RemoteFolderStatus, SyncError> {
        let session = self.session()?;
        let response = session
            .run_command_and_read_response(format!(
                "STATUS \"{}\" (MESSAGES UIDNEXT UIDVALIDITY HIGHESTMODSEQ)",
                path
            ))
            .await
            .map_err(|e| SyncError::Imap(format!("STATUS {} failed: {}", path, e)))?;
        parse_status_response(&String::from_utf8_lossy(&response))
            .ok_or_else(|| SyncError::Imap(format!("unparseable STATUS response for {}", path)))
    }

    async fn fetch_range(
        &mut self,
        path: &str,
        lo: u32,
        hi: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        if hi <= lo {
            return Ok(Vec::new());
        }
        self.fetch_headers(path, &format!("{}:{}", lo, hi - 1), "")
            .await
    }

    async fn sync_since(
        &mut self,
        path: &str,
        modseq: u64,
    ) -> Result<CondstoreChanges, SyncError> {
        let changed = self
            .fetch_headers(path, "1:*", &format!(" (CHANGEDSINCE {})", modseq))
            .await?;

        // VANISHED is only reported once QRESYNC is enabled; a plain
        // CONDSTORE server leaves deletion detection to the caller.
        let vanished = if self.capabilities.qresync {
            let session = self.session()?;
            let response = session
                .run_command_and_read_response(format!(
                    "UID FETCH 1:* (UID) (CHANGEDSINCE {} VANISHED)",
                    modseq
                ))
                .await
                .map_err(|e| SyncError::Imap(format!("VANISHED fetch failed: {}", e)))?;
            Some(parse_vanished(&String::from_utf8_lossy(&response)))
        } else {
            None
        };

        Ok(CondstoreChanges { changed, vanished })
    }

    async fn fetch_body(&mut self, path: &str, uid: u32) -> Result<Vec<u8>, SyncError> {
        self.select(path).await?;
        let session = self.session()?;
        let fetches: Vec<Fetch> = session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(|e| SyncError::Imap(format!("body FETCH failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("body FETCH collect failed: {}", e)))?;

        fetches
            .iter()
            .find_map(|f| f.body().map(|b| b.to_vec()))
            .ok_or_else(|| SyncError::Imap(format!("no body returned for UID {}", uid)))
    }

    async fn idle(&mut self, path: &str, interrupt: &Interrupt) -> Result<(), SyncError> {
        self.select(path).await?;
        let session = self
            .session
            .take()
            .ok_or_else(|| SyncError::Net("IMAP session not connected".into()))?;

        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            self.selected = None;
            return Err(SyncError::Imap(format!("IDLE init failed: {}", e)));
        }

        let (idle_wait, stop_source) = idle.wait_with_timeout(IDLE_TIMEOUT);
        interrupt.register_stop(Box::new(move || drop(stop_source)));

        let outcome = idle_wait.await;
        interrupt.clear_stop();
        if let Err(e) = &outcome {
            warn!("IDLE wait ended with error: {}", e);
        }

        match idle.done().await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.selected = None;
                Err(SyncError::Imap(format!("IDLE done failed: {}", e)))
            }
        }
    }

    async fn add_flags(
        &mut self,
        path: &str,
        uids: &[u32],
        flags: &str,
    ) -> Result<(), SyncError> {
        self.select(path).await?;
        let session = self.session()?;
        let _: Vec<Fetch> = session
            .uid_store(uid_set(uids), format!("+FLAGS ({})", flags))
            .await
            .map_err(|e| SyncError::Imap(format!("STORE +FLAGS failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("STORE collect failed: {}", e)))?;
        Ok(())
    }

    async fn remove_flags(
        &mut self,
        path: &str,
        uids: &[u32],
        flags: &str,
    ) -> Result<(), SyncError> {
        self.select(path).await?;
        let session = self.session()?;
        let _: Vec<Fetch> = session
            .uid_store(uid_set(uids), format!("-FLAGS ({})", flags))
            .await
            .map_err(|e| SyncError::Imap(format!("STORE -FLAGS failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("STORE collect failed: {}", e)))?;
        Ok(())
    }

    async fn move_messages(
        &mut self,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<(), SyncError> {
        self.select(from).await?;
        let session = self.session()?;
        session
            .uid_mv(uid_set(uids), to)
            .await
            .map_err(|e| SyncError::Imap(format!("MOVE to {} failed: {}", to, e)))
    }

    async fn set_labels(
        &mut self,
        path: &str,
        uids: &[u32],
        add: bool,
        labels: &[String],
    ) -> Result<(), SyncError> {
        self.select(path).await?;
        let sign = if add { '+' } else { '-' };
        let rendered: Vec<String> = labels.iter().map(|l| format!("\"{}\"", l)).collect();
        let session = self.session()?;
        session
            .run_command_and_check_ok(format!(
                "UID STORE {} {}X-GM-LABELS ({})",
                uid_set(uids),
                sign,
                rendered.join(" ")
            ))
            .await
            .map_err(|e| SyncError::Imap(format!("X-GM-LABELS store failed: {}", e)))?;
        Ok(())
    }

    async fn delete_messages(&mut self, path: &str, uids: &[u32]) -> Result<(), SyncError> {
        self.add_flags(path, uids, "\\Deleted").await?;
        let session = self.session()?;
        let _: Vec<_> = session
            .expunge()
            .await
            .map_err(|e| SyncError::Imap(format!("EXPUNGE failed: {}", e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Imap(format!("EXPUNGE collect failed: {}", e)))?;
        Ok(())
    }

    async fn append(&mut self, path: &str, raw: &[u8], _flags: &str) -> Result<(), SyncError> {
        let session = self.session()?;
        session
            .append(path, raw)
            .await
            .map_err(|e| SyncError::Imap(format!("APPEND to {} failed: {}", path, e)))
    }
}

/// Parse `* STATUS "path" (MESSAGES 231 UIDNEXT 44292 UIDVALIDITY 857529045
/// HIGHESTMODSEQ 122)`.
fn parse_status_response(text: &str) -> Option<RemoteFolderStatus> {
    let line = text.lines().find(|l| l.contains("STATUS"))?;
    let inner = line.split('(').nth(1)?.split(')').next()?;
    let mut status = RemoteFolderStatus::default();
    let mut tokens = inner.split_whitespace();
    while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
        match key.to_ascii_uppercase().as_str() {
            "MESSAGES" => status.message_count = value.parse().ok()?,
            "UIDNEXT" => status.uidnext = value.parse().ok()?,
            "UIDVALIDITY" => status.uidvalidity = value.parse().ok()?,
            "HIGHESTMODSEQ" => status.highestmodseq = value.parse().ok()?,
            _ => {}
        }
    }
    Some(status)
}

/// Parse VANISHED responses out of a raw QRESYNC fetch:
/// `* VANISHED (EARLIER) 300:303,405`.
fn parse_vanished(text: &str) -> Vec<u32> {
    let mut uids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with("* VANISHED") {
            continue;
        }
        let set = line
            .rsplit(|c: char| c.is_whitespace() || c == ')')
            .next()
            .unwrap_or("");
        for part in set.split(',') {
            if let Some((lo, hi)) = part.split_once(':') {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    uids.extend(lo..=hi);
                }
            } else if let Ok(uid) = part.parse::<u32>() {
                uids.push(uid);
            }
        }
    }
    uids.sort_unstable();
    uids.dedup();
    uids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_parses_all_fields() {
        let status = parse_status_response(
            "* STATUS \"INBOX\" (MESSAGES 231 UIDNEXT 44292 UIDVALIDITY 857529045 HIGHESTMODSEQ 122)\r\nA1 OK STATUS completed\r\n",
        )
        .unwrap();
        assert_eq!(status.message_count, 231);
        assert_eq!(status.uidnext, 44292);
        assert_eq!(status.uidvalidity, 857529045);
        assert_eq!(status.highestmodseq, 122);
    }

    #[test]
    fn status_response_rejects_garbage() {
        assert!(parse_status_response("A1 NO no such folder\r\n").is_none());
    }

    #[test]
    fn vanished_ranges_expand() {
        let uids = parse_vanished(
            "* VANISHED (EARLIER) 300:303,405\r\n* 5 FETCH (UID 99)\r\nA2 OK done\r\n",
        );
        assert_eq!(uids, vec![300, 301, 302, 303, 405]);
    }

    #[test]
    fn vanished_absent_is_empty() {
        assert!(parse_vanished("A2 OK done\r\n").is_empty());
    }
}
