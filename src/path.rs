//! Remote path handling
//!
//! Remote paths are absolute, `/`-separated and normalized before they are
//! used as cache keys.

use crate::error::{Result, TransferError};

pub const ROOT: &str = "/";

/// Normalize a remote path: leading `/`, no empty or `.` segments, no
/// trailing slash.
///
/// Rejects `..` segments.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(TransferError::InvalidArgument(format!(
                    "parent directory traversal not allowed: {path}"
                )))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent of a normalized path; `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(i) => Some(path[..i].to_string()),
        None => Some(ROOT.to_string()),
    }
}

/// Last segment of a normalized path
pub fn file_name(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Split `name` into stem and extension; dotfiles have no extension
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(i) => (&name[..i], Some(&name[i + 1..])),
    }
}

/// `report.pdf` → `report (n).pdf`
pub fn numbered_name(name: &str, n: u32) -> String {
    match split_extension(name) {
        (stem, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
        (stem, None) => format!("{} ({})", stem, n),
    }
}

/// `report.pdf` → `report_<timestamp>.pdf`
pub fn timestamped_name(name: &str, timestamp: i64) -> String {
    match split_extension(name) {
        (stem, Some(ext)) => format!("{}_{}.{}", stem, timestamp, ext),
        (stem, None) => format!("{}_{}", stem, timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_path("").unwrap(), "/");
        assert_eq!(normalize_path("a//b/./c/").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("/docs").unwrap(), "/docs");
        assert!(normalize_path("/a/../etc").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent_path("/a").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(file_name("/a/b.txt"), Some("b.txt"));
        assert_eq!(file_name("/"), None);
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }

    #[test]
    fn test_collision_names() {
        assert_eq!(numbered_name("report.pdf", 2), "report (2).pdf");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name(".env", 1), ".env (1)");
        assert_eq!(timestamped_name("a.tar.gz", 1700000000), "a.tar_1700000000.gz");
    }
}
