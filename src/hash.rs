//! Content hashing for change detection
//!
//! Hashes are persisted as pod labels and in the group status, so they must be
//! stable across processes and toolchains: truncated SHA-256 over a canonical
//! serialization, never `DefaultHasher`.

use std::fmt::Write;

use aws_lc_rs::digest;

use crate::crd::MemberTemplate;
use crate::Error;

/// Compute a 16-hex-char truncated SHA-256 digest of the input
pub fn deterministic_hash(input: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Canonical form of configuration text
///
/// Line endings are normalized, trailing whitespace is trimmed per line, and
/// trailing blank lines are dropped, so purely cosmetic edits do not roll the group.
pub fn canonical_config(config: &str) -> String {
    let mut lines: Vec<&str> = config
        .lines()
        .map(|l| l.trim_end_matches([' ', '\t', '\r']))
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Hash of the effective configuration content
pub fn config_hash(config: &str) -> String {
    deterministic_hash(canonical_config(config).as_bytes())
}

/// Revision hash of a member template
///
/// Configuration is folded in through its canonical hash, so a cosmetic config
/// edit yields the same revision.
pub fn revision_hash(template: &MemberTemplate) -> Result<String, Error> {
    let mut canonical = template.clone();
    canonical.config = config_hash(&template.config);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(deterministic_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(version: &str, config: &str) -> MemberTemplate {
        serde_json::from_value(serde_json::json!({
            "image": "registry.local/member",
            "version": version,
            "config": config,
        }))
        .unwrap()
    }

    #[test]
    fn hash_is_sixteen_hex_chars_and_stable() {
        let h = deterministic_hash(b"hello");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, deterministic_hash(b"hello"));
        assert_ne!(h, deterministic_hash(b"hello!"));
    }

    #[test]
    fn cosmetic_config_edits_keep_the_hash() {
        let a = "[log]\nlevel = \"info\"\n";
        let b = "[log]  \r\nlevel = \"info\"\t\n\n\n";
        assert_eq!(config_hash(a), config_hash(b));
        assert_ne!(config_hash(a), config_hash("[log]\nlevel = \"debug\"\n"));
    }

    #[test]
    fn revision_tracks_template_content() {
        let base = revision_hash(&template("v8.1.0", "a = 1")).unwrap();
        assert_eq!(base, revision_hash(&template("v8.1.0", "a = 1  \n")).unwrap());
        assert_ne!(base, revision_hash(&template("v8.1.1", "a = 1")).unwrap());
        assert_ne!(base, revision_hash(&template("v8.1.0", "a = 2")).unwrap());
    }
}
