//! MIME collaborator: raw RFC822 bytes in, rendered HTML + flattened text
//! + attachment parts out.

use mailparse::{MailHeaderMap, ParsedMail};

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedBody {
    pub html: String,
    pub text: String,
    pub files: Vec<ParsedFile>,
}

pub fn parse(raw: &[u8]) -> Result<ParsedBody, SyncError> {
    let mail = mailparse::parse_mail(raw).map_err(SyncError::parse)?;

    let mut html: Option<String> = None;
    let mut plain: Option<String> = None;
    let mut files = Vec::new();
    walk(&mail, "1", &mut html, &mut plain, &mut files);

    let html = match (html, &plain) {
        (Some(h), _) => h,
        (None, Some(p)) => format!("<pre>{}</pre>", escape_html(p)),
        (None, None) => String::new(),
    };

    // The HTML may reference "cid:filename" for parts that never got a
    // Content-ID; the client filters attachments on cids, so fill them in.
    for file in &mut files {
        if file.content_id.is_none() && html.contains(&format!("cid:{}", file.filename)) {
            file.content_id = Some(file.filename.clone());
        }
    }

    let text = match plain {
        Some(p) if html.is_empty() => p,
        _ => html2text::from_read(html.as_bytes(), 80).unwrap_or_default(),
    };

    Ok(ParsedBody { html, text, files })
}

fn walk(
    part: &ParsedMail,
    part_id: &str,
    html: &mut Option<String>,
    plain: &mut Option<String>,
    files: &mut Vec<ParsedFile>,
) {
    if !part.subparts.is_empty() {
        for (i, sub) in part.subparts.iter().enumerate() {
            let child_id = if part.ctype.mimetype.eq_ignore_ascii_case("message/rfc822") {
                part_id.to_string()
            } else {
                format!("{}.{}", part_id, i + 1)
            };
            walk(sub, &child_id, html, plain, files);
        }
        return;
    }

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition.params.get("filename").cloned().or_else(|| {
        part.ctype.params.get("name").cloned()
    });

    let is_attachment = matches!(
        disposition.disposition,
        mailparse::DispositionType::Attachment
    ) || (filename.is_some() && !mimetype.starts_with("text/"));

    if is_attachment {
        let content_id = part
            .get_headers()
            .get_first_value("Content-ID")
            .map(|v| v.trim_matches(|c| c == '<' || c == '>').to_string());
        files.push(ParsedFile {
            part_id: part_id.to_string(),
            filename: filename.unwrap_or_else(|| format!("part-{}", part_id)),
            content_type: mimetype,
            content_id,
            data: part.get_body_raw().unwrap_or_default(),
        });
        return;
    }

    match mimetype.as_str() {
        "text/html" => {
            if html.is_none() {
                *html = part.get_body().ok();
            }
        }
        _ if mimetype.starts_with("text/") => {
            if plain.is_none() {
                *plain = part.get_body().ok();
            }
        }
        _ => {}
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
