//! IMAP server capability detection.
//!
//! The advertised capability set decides the sync strategy per folder:
//! QRESYNC gives authoritative vanished-UID reporting, CONDSTORE gives a
//! folder-wide mutation cursor, and bare servers fall back to UID-range
//! scanning.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub condstore: bool,
    pub qresync: bool,
    pub idle: bool,
    /// X-GM-EXT-1: Gmail labels, thread ids and message ids are available,
    /// and non-canonical folders should be treated as labels.
    pub gmail: bool,
}

impl Capabilities {
    /// Detect from raw capability strings (greeting, CAPABILITY response,
    /// or an OK `[CAPABILITY ...]` code).
    pub fn detect(capabilities: &[String]) -> Capabilities {
        let caps: Vec<String> = capabilities.iter().map(|c| c.to_uppercase()).collect();
        let has = |name: &str| caps.iter().any(|c| c == name);

        let has_condstore = has("CONDSTORE");
        // QRESYNC requires CONDSTORE and ENABLE.
        let qresync = has("QRESYNC") && has_condstore && has("ENABLE");

        Capabilities {
            condstore: has_condstore,
            qresync,
            idle: has("IDLE"),
            gmail: has("X-GM-EXT-1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn detect_qresync() {
        let info = Capabilities::detect(&caps(&[
            "IMAP4rev1", "QRESYNC", "CONDSTORE", "ENABLE", "IDLE",
        ]));
        assert!(info.qresync);
        assert!(info.condstore);
        assert!(info.idle);
        assert!(!info.gmail);
    }

    #[test]
    fn qresync_requires_enable() {
        let info = Capabilities::detect(&caps(&["QRESYNC", "CONDSTORE"]));
        assert!(!info.qresync);
        assert!(info.condstore);
    }

    #[test]
    fn detect_gmail() {
        let info = Capabilities::detect(&caps(&["IMAP4rev1", "CONDSTORE", "X-GM-EXT-1", "IDLE"]));
        assert!(info.gmail);
        assert!(info.condstore);
        assert!(!info.qresync);
    }

    #[test]
    fn detect_bare() {
        let info = Capabilities::detect(&caps(&["IMAP4rev1", "IDLE"]));
        assert!(!info.condstore);
        assert!(!info.qresync);
    }
}
