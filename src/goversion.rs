//! Go compiler version resolution and detection.

use memchr::memmem;
use serde::Serialize;

use crate::error::{Error, Result};

/// A resolved Go compiler release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoVersion {
    /// Version string as embedded by the toolchain, e.g. `go1.18.3`.
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GoVersion {
    /// True if this release is `go<major>.<minor>` or newer.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for GoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves a version string such as `go1.18` or `go1.7.2` to a release.
///
/// Returns `None` for anything that does not parse as a Go release string,
/// including pre-release suffixes it cannot attribute (`go1.21rc2` resolves,
/// trailing garbage does not).
pub fn resolve_go_version(version: &str) -> Option<GoVersion> {
    let rest = version.strip_prefix("go")?;
    let mut parts = rest.splitn(3, '.');

    let major: u32 = parts.next()?.parse().ok()?;
    if major != 1 {
        return None;
    }

    // The minor component may carry a beta/rc suffix: "1.21rc2".
    let minor_part = parts.next()?;
    let digits: String = minor_part.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let suffix = &minor_part[digits.len()..];
    if !suffix.is_empty() && !suffix.starts_with("beta") && !suffix.starts_with("rc") {
        return None;
    }
    let minor: u32 = digits.parse().ok()?;

    let patch: u32 = match parts.next() {
        Some(p) => {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() || digits.len() != p.len() {
                return None;
            }
            digits.parse().ok()?
        }
        None => 0,
    };

    Some(GoVersion {
        name: version.to_string(),
        major,
        minor,
        patch,
    })
}

/// Extracts a plausible `go1.…` version marker from a blob of read-only data.
///
/// Used as the last-resort detection strategy when neither build info nor the
/// `runtime.buildVersion` symbol is available.
pub fn scan_for_version(data: &[u8]) -> Result<GoVersion> {
    let finder = memmem::Finder::new(b"go1.");
    for start in finder.find_iter(data) {
        let tail = &data[start..];
        let end = tail
            .iter()
            .take(32)
            .position(|&b| !(b.is_ascii_digit() || b == b'.' || b.is_ascii_lowercase()))
            .unwrap_or(tail.len().min(32));
        if let Ok(candidate) = std::str::from_utf8(&tail[..end]) {
            if let Some(v) = resolve_go_version(candidate) {
                tracing::debug!("version marker {} found at data offset {:#x}", v, start);
                return Ok(v);
            }
        }
    }
    Err(Error::UnknownGoVersion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_release_strings() {
        let v = resolve_go_version("go1.18.3").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 18, 3));

        let v = resolve_go_version("go1.7").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 7, 0));

        let v = resolve_go_version("go1.21rc2").unwrap();
        assert_eq!((v.major, v.minor), (1, 21));
    }

    #[test]
    fn reject_invalid_strings() {
        assert!(resolve_go_version("1.18").is_none());
        assert!(resolve_go_version("go2.0").is_none());
        assert!(resolve_go_version("gofmt").is_none());
        assert!(resolve_go_version("go1.x").is_none());
        assert!(resolve_go_version("go1.18.x").is_none());
        assert!(resolve_go_version("").is_none());
    }

    #[test]
    fn version_ordering() {
        let v = resolve_go_version("go1.16.5").unwrap();
        assert!(v.at_least(1, 16));
        assert!(v.at_least(1, 12));
        assert!(!v.at_least(1, 18));
    }

    #[test]
    fn scan_finds_marker() {
        let mut blob = vec![0u8; 64];
        blob.extend_from_slice(b"go1.20.4");
        blob.push(0);
        blob.extend_from_slice(&[0xffu8; 16]);
        let v = scan_for_version(&blob).unwrap();
        assert_eq!(v.name, "go1.20.4");
    }

    #[test]
    fn scan_skips_false_positives() {
        // "go1." followed by junk must not resolve, but a later real marker
        // must still be found.
        let mut blob = Vec::new();
        blob.extend_from_slice(b"go1.\xff\xff");
        blob.extend_from_slice(b"lorem go1.16 ipsum");
        let v = scan_for_version(&blob).unwrap();
        assert_eq!(v.name, "go1.16");
    }

    #[test]
    fn scan_without_marker() {
        assert_eq!(scan_for_version(b"no version here"), Err(Error::UnknownGoVersion));
    }
}
