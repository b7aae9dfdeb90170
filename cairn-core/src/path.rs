use crate::{CairnError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([0-9a-zA-Z_-]+)/([0-9a-zA-Z_-]+)/([SM])/([0-9a-fA-F]{1,64})$")
        .expect("storage path pattern is valid")
});

/// A parsed `/<group>/<instance>/<S|M>/<content hash>` storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePath {
    pub group: String,
    pub instance: String,
    pub multipart: bool,
    pub md5: String,
}

impl StoragePath {
    /// Parse a user supplied path. Surrounding whitespace and a missing leading
    /// slash are tolerated; anything else off-pattern is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let normalized = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };

        let captures = PATH_PATTERN
            .captures(&normalized)
            .ok_or_else(|| CairnError::InvalidPath(raw.to_string()))?;

        Ok(Self {
            group: captures[1].to_string(),
            instance: captures[2].to_string(),
            multipart: &captures[3] == "M",
            md5: captures[4].to_ascii_lowercase(),
        })
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}",
            format_storage_path(&self.group, &self.instance, self.multipart, &self.md5)
        )
    }
}

/// The path form handed back to uploaders, without a leading slash.
pub fn format_storage_path(group: &str, instance: &str, multipart: bool, md5: &str) -> String {
    let kind = if multipart { "M" } else { "S" };
    format!("{}/{}/{}/{}", group, instance, kind, md5)
}

/// Content hash named by either a storage path or a bare hex digest.
pub fn content_key(path_or_md5: &str) -> Option<String> {
    if let Ok(path) = StoragePath::parse(path_or_md5) {
        return Some(path.md5);
    }
    let candidate = path_or_md5.trim().to_ascii_lowercase();
    if candidate.is_empty() || !candidate.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_normalizes_leading_slash() {
        let path = StoragePath::parse(&format!("  groupA/inst1/S/{}  ", HASH)).unwrap();
        assert_eq!(path.group, "groupA");
        assert_eq!(path.instance, "inst1");
        assert!(!path.multipart);
        assert_eq!(path.to_string(), format!("/groupA/inst1/S/{}", HASH));
    }

    #[test]
    fn test_parse_multipart() {
        let path = StoragePath::parse(&format!("/g1/i-2/M/{}", HASH.to_uppercase())).unwrap();
        assert!(path.multipart);
        assert_eq!(path.md5, HASH);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "",
            "/groupA/inst1/S",
            "/groupA/inst1/X/0123456789abcdef0123456789abcdef",
            "/groupA/inst1/S/xyz",
            "/groupA/../S/0123456789abcdef0123456789abcdef",
            "/groupA/inst1/S/0123456789abcdef0123456789abcdef/extra",
        ] {
            assert!(
                matches!(StoragePath::parse(raw), Err(CairnError::InvalidPath(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_content_key() {
        assert_eq!(content_key(&format!("/g/i/S/{}", HASH)).as_deref(), Some(HASH));
        assert_eq!(content_key(" ABCDEF ").as_deref(), Some("abcdef"));
        assert_eq!(content_key("not-a-hash"), None);
        assert_eq!(content_key(""), None);
    }
}
