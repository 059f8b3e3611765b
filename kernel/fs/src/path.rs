//! Path canonicalization and mount matching.
//!
//! Incoming paths are either rooted (`/mnt/ram/data`) or carry an
//! environment-style prefix (`ram:/data`, rewritten to `/ram/data`).
//! Canonicalization collapses duplicate separators and resolves `.` and
//! `..`; `..` never escapes the root.

use alloc::string::String;
use alloc::vec::Vec;

/// Splits a path into its non-empty components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonicalizes a path: environment prefix rewriting, separator
/// collapsing, `.`/`..` resolution. Returns `None` for paths that are
/// neither rooted nor prefixed.
#[must_use]
pub fn canonicalize(path: &str) -> Option<String> {
    let rooted: String;
    let path = if path.starts_with('/') {
        path
    } else if let Some((prefix, rest)) = path.split_once(":/") {
        if prefix.is_empty() || prefix.contains('/') {
            return None;
        }
        rooted = alloc::format!("/{prefix}/{rest}");
        &rooted
    } else {
        return None;
    };

    let mut stack: Vec<&str> = Vec::new();
    for component in components(path) {
        match component {
            "." => {}
            ".." => {
                let _ = stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut result = String::from("/");
    result.push_str(&stack.join("/"));
    Some(result)
}

/// Finds the longest mount point that is a path prefix of `path`.
///
/// `/dev` matches `/dev/null` but not `/device`; a root mount `/` matches
/// everything.
pub fn longest_prefix_match<'a>(
    path: &str,
    mount_points: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for mount in mount_points {
        let matches = mount == "/"
            || path == mount
            || (path.starts_with(mount) && path.as_bytes().get(mount.len()) == Some(&b'/'));
        if matches && best.is_none_or(|b| mount.len() > b.len()) {
            best = Some(mount);
        }
    }
    best
}

/// Strips the mount prefix, returning the mount-relative remainder
/// (without a leading slash; empty for the mount root itself).
#[must_use]
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else if path.len() <= mount.len() {
        ""
    } else {
        &path[mount.len() + 1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty() {
        let parts: Vec<_> = components("/usr//bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
    }

    #[test]
    fn canonicalize_rooted() {
        assert_eq!(canonicalize("/a/b/c").unwrap(), "/a/b/c");
        assert_eq!(canonicalize("/a//b///c").unwrap(), "/a/b/c");
    }

    #[test]
    fn canonicalize_dots() {
        assert_eq!(canonicalize("/a/./b").unwrap(), "/a/b");
        assert_eq!(canonicalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(canonicalize("/../..").unwrap(), "/");
        assert_eq!(canonicalize("/a/b/..").unwrap(), "/a");
    }

    #[test]
    fn canonicalize_environment_prefix() {
        assert_eq!(canonicalize("ram:/data").unwrap(), "/ram/data");
        assert_eq!(canonicalize("sys:/modules/../fonts").unwrap(), "/sys/fonts");
    }

    #[test]
    fn canonicalize_rejects_relative() {
        assert!(canonicalize("a/b").is_none());
        assert!(canonicalize("").is_none());
        assert!(canonicalize(":/x").is_none());
    }

    #[test]
    fn longest_prefix_prefers_deepest_mount() {
        let mounts = ["/", "/mnt", "/mnt/ram"];
        assert_eq!(
            longest_prefix_match("/mnt/ram/data", mounts.iter().copied()),
            Some("/mnt/ram")
        );
        assert_eq!(
            longest_prefix_match("/mnt/disk/x", mounts.iter().copied()),
            Some("/mnt")
        );
        assert_eq!(
            longest_prefix_match("/etc/passwd", mounts.iter().copied()),
            Some("/")
        );
    }

    #[test]
    fn prefix_match_is_component_aligned() {
        let mounts = ["/dev"];
        assert_eq!(
            longest_prefix_match("/dev/null", mounts.iter().copied()),
            Some("/dev")
        );
        assert_eq!(longest_prefix_match("/device", mounts.iter().copied()), None);
    }

    #[test]
    fn strip_prefix_variants() {
        assert_eq!(strip_mount_prefix("/mnt/ram/data", "/mnt/ram"), "data");
        assert_eq!(strip_mount_prefix("/mnt/ram", "/mnt/ram"), "");
        assert_eq!(strip_mount_prefix("/etc/passwd", "/"), "etc/passwd");
    }
}
