//! FETCH response parsing: async-imap `Fetch` items into [`RemoteMessage`].

use async_imap::types::{Fetch, Flag};

use super::{RemoteFlags, RemoteMessage};
use crate::models::message::EmailAddress;

pub fn remote_message_from_fetch(fetch: &Fetch) -> Option<RemoteMessage> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let mut flags = RemoteFlags::default();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => flags.seen = true,
            Flag::Flagged => flags.flagged = true,
            Flag::Draft => flags.draft = true,
            _ => {}
        }
    }

    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_rfc2047(&String::from_utf8_lossy(s)))
        .unwrap_or_default();

    let header_message_id = envelope
        .message_id
        .as_ref()
        .map(|id| strip_angle_brackets(&String::from_utf8_lossy(id)))
        .filter(|s| !s.is_empty());

    let date = envelope
        .date
        .as_ref()
        .and_then(|d| mailparse::dateparse(&String::from_utf8_lossy(d)).ok())
        .unwrap_or(0);

    let mut references = Vec::new();
    if let Some(irt) = envelope.in_reply_to.as_ref() {
        let id = strip_angle_brackets(&String::from_utf8_lossy(irt));
        if !id.is_empty() {
            references.push(id);
        }
    }

    Some(RemoteMessage {
        uid,
        flags,
        gmail_labels: Vec::new(),
        gmail_thread_id: None,
        gmail_message_id: None,
        header_message_id,
        references,
        subject,
        from: extract_addresses(&envelope.from),
        to: extract_addresses(&envelope.to),
        cc: extract_addresses(&envelope.cc),
        bcc: extract_addresses(&envelope.bcc),
        date,
    })
}

/// Merge a `BODY.PEEK[HEADER.FIELDS (References)]` pass into messages that
/// were already parsed from the envelope fetch.
pub fn merge_references(messages: &mut [RemoteMessage], uid: u32, header_text: &str) {
    let refs = parse_references_value(header_text);
    if let Some(msg) = messages.iter_mut().find(|m| m.uid == uid) {
        for r in refs {
            if !msg.references.contains(&r) {
                msg.references.push(r);
            }
        }
    }
}

pub fn parse_references_value(header_text: &str) -> Vec<String> {
    // Unfold continuation lines before scanning for message ids.
    let unfolded = header_text.lines().fold(String::new(), |mut acc, line| {
        if !acc.is_empty() {
            acc.push(' ');
        }
        acc.push_str(line.trim());
        acc
    });

    unfolded
        .split_whitespace()
        .filter(|s| s.starts_with('<') && s.ends_with('>'))
        .map(|s| s[1..s.len() - 1].to_string())
        .collect()
}

fn strip_angle_brackets(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

fn extract_addresses(
    addrs: &Option<Vec<async_imap::imap_proto::Address<'_>>>,
) -> Vec<EmailAddress> {
    addrs
        .as_ref()
        .map(|list| {
            list.iter()
                .filter_map(|addr| {
                    let mailbox = addr
                        .mailbox
                        .as_ref()
                        .map(|m| String::from_utf8_lossy(m).to_string())?;
                    let host = addr
                        .host
                        .as_ref()
                        .map(|h| String::from_utf8_lossy(h).to_string())?;
                    let name = addr
                        .name
                        .as_ref()
                        .map(|n| decode_rfc2047(&String::from_utf8_lossy(n)));
                    Some(EmailAddress {
                        name,
                        email: format!("{}@{}", mailbox, host).to_lowercase(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_parsed_from_folded_header() {
        let header = "References: <a@example.com>\r\n <b@example.com>\r\n\t<c@example.com>";
        let refs = parse_references_value(
            header.trim_start_matches("References:").trim_start(),
        );
        assert_eq!(refs, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[test]
    fn references_ignore_non_bracketed_tokens() {
        let refs = parse_references_value("garbage <x@y.z> more");
        assert_eq!(refs, vec!["x@y.z"]);
    }

    #[test]
    fn angle_brackets_stripped() {
        assert_eq!(strip_angle_brackets(" <id@host> "), "id@host");
        assert_eq!(strip_angle_brackets("id@host"), "id@host");
    }

    #[test]
    fn rfc2047_subjects_decoded() {
        let decoded = decode_rfc2047("=?UTF-8?B?SGVsbG8gV29ybGQ=?=");
        assert_eq!(decoded, "Hello World");
    }
}
