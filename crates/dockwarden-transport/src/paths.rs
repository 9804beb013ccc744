//! Host path translation.
//!
//! Compose files are sometimes registered with drive-letter paths
//! (`C:\stacks\web\compose.yml`) while the engine host sees the same tree
//! under `/mnt/<drive>/`.

/// Returns true if `path` starts with a drive letter (`C:\` or `C:/`).
#[must_use]
pub fn is_foreign_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/')
}

/// Translate a drive-letter path to its POSIX mount form.
///
/// Returns `None` for paths that are not drive-letter paths.
#[must_use]
pub fn translate_foreign_path(path: &str) -> Option<String> {
    if !is_foreign_path(path) {
        return None;
    }
    let drive = path[..1].to_ascii_lowercase();
    let rest = path[3..].replace('\\', "/");
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        Some(format!("/mnt/{drive}"))
    } else {
        Some(format!("/mnt/{drive}/{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_drive_letters() {
        assert!(is_foreign_path(r"C:\stacks\web"));
        assert!(is_foreign_path("d:/data"));
        assert!(!is_foreign_path("/srv/stacks"));
        assert!(!is_foreign_path("C:"));
        assert!(!is_foreign_path("relative/path"));
    }

    #[test]
    fn translates_to_mount_paths() {
        assert_eq!(
            translate_foreign_path(r"C:\stacks\web\compose.yml").as_deref(),
            Some("/mnt/c/stacks/web/compose.yml")
        );
        assert_eq!(translate_foreign_path("D:/").as_deref(), Some("/mnt/d"));
        assert_eq!(translate_foreign_path("/srv/x"), None);
    }
}
