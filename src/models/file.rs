use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::MailModel;

/// Attachment metadata. Bytes live on disk under a content-addressed path;
/// the row carries what the client needs to list and open them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    pub message_id: String,
    pub part_id: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default)]
    pub size: usize,
}

impl File {
    /// Content-addressed location: two levels of id fan-out, then the id
    /// itself, then the (sanitized) filename.
    pub fn disk_path(&self, files_root: &Path) -> PathBuf {
        let safe: String = self
            .filename
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        let name = if safe.is_empty() {
            "attachment".to_string()
        } else {
            safe
        };
        files_root
            .join(&self.id[0..2])
            .join(&self.id[2..4])
            .join(&self.id)
            .join(name)
    }
}

impl MailModel for File {
    const TABLE: &'static str = "File";

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
        &["messageId", "partId", "filename"]
    }

    fn extra_values(&self) -> Vec<rusqlite::types::Value> {
        vec![
            self.message_id.clone().into(),
            self.part_id.clone().into(),
            self.filename.clone().into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::id_for_file;

    #[test]
    fn disk_path_is_fanned_out_and_sanitized() {
        let file = File {
            id: id_for_file("msg-1", "1.2"),
            account_id: "acct".into(),
            version: 0,
            message_id: "msg-1".into(),
            part_id: "1.2".into(),
            filename: "re/port:2019.pdf".into(),
            content_type: "application/pdf".into(),
            content_id: None,
            size: 10,
        };
        let path = file.disk_path(Path::new("/data/files"));
        let s = path.to_string_lossy();
        assert!(s.starts_with("/data/files/"));
        assert!(s.ends_with("re_port_2019.pdf"));
        assert!(s.contains(&file.id));
    }
}
