//! Shared test utilities

use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Whether the git CLI is available; tests needing it skip otherwise
#[must_use]
pub fn git_available() -> bool {
    which::which("git").is_ok()
}

/// Initialize a git repository with one commit on `main` containing the
/// given files
///
/// Returns false (caller should skip) when any git invocation fails.
#[must_use]
pub fn init_git_repo(dir: &Path, files: &[(&str, &[u8])]) -> bool {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create repo subdir");
        }
        std::fs::write(&path, content).expect("write repo file");
    }

    let steps: &[&[&str]] = &[
        &["init", "-b", "main"],
        &["config", "user.email", "fleet@test.local"],
        &["config", "user.name", "Fleet Test"],
        &["add", "."],
        &["commit", "-m", "initial"],
    ];
    for args in steps {
        let ok = Command::new("git")
            .args(*args)
            .current_dir(dir)
            .output()
            .is_ok_and(|out| out.status.success());
        if !ok {
            return false;
        }
    }
    true
}

/// Poll `check` until it returns true or the deadline lapses
pub async fn wait_for<F>(mut check: F, deadline: Duration) -> bool
where
    F: AsyncFnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
