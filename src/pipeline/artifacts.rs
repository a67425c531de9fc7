//! Artifact discovery for completed platform builds

use std::fs;
use std::path::{Path, PathBuf};

/// Artifact extensions produced per target platform family, lowercase
#[must_use]
pub fn platform_extensions(platform: &str) -> &'static [&'static str] {
    match platform {
        "win32" | "windows" => &[".exe", ".msi", ".nsis"],
        "darwin" | "macos" => &[".dmg", ".pkg", ".app"],
        "linux" => &[".appimage", ".deb", ".rpm"],
        _ => &[],
    }
}

/// Walk `root` collecting files that look like finished artifacts for
/// `platform`
///
/// The walk is an explicit, bounded tree traversal; unreadable or missing
/// directories yield an empty result rather than an error. A matching file
/// must be non-empty: a zero-length file is still being written by the
/// build tool.
#[must_use]
pub fn find_platform_artifacts(root: &Path, platform: &str) -> Vec<PathBuf> {
    let wanted = platform_extensions(platform);
    if wanted.is_empty() {
        return Vec::new();
    }

    let mut results = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let lower = name.to_lowercase();
            if wanted.iter().any(|ext| lower.ends_with(ext))
                && fs::metadata(&path).is_ok_and(|m| m.len() > 0)
            {
                results.push(path);
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_table_covers_known_platforms() {
        assert!(platform_extensions("win32").contains(&".exe"));
        assert!(platform_extensions("darwin").contains(&".dmg"));
        assert!(platform_extensions("linux").contains(&".appimage"));
        assert!(platform_extensions("freebsd").is_empty());
    }

    #[test]
    fn finds_nested_artifacts_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("linux-unpacked");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("App-1.0.AppImage"), b"binary").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not an artifact").unwrap();

        let found = find_platform_artifacts(dir.path(), "linux");
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("linux-unpacked/App-1.0.AppImage"));
    }

    #[test]
    fn empty_files_are_not_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("partial.deb"), b"").unwrap();
        assert!(find_platform_artifacts(dir.path(), "linux").is_empty());
    }

    #[test]
    fn missing_root_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let found = find_platform_artifacts(&dir.path().join("dist"), "linux");
        assert!(found.is_empty());
    }

    #[test]
    fn wrong_platform_does_not_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.exe"), b"pe").unwrap();
        assert!(find_platform_artifacts(dir.path(), "linux").is_empty());
    }
}
