//! Build pipeline executor
//!
//! Runs clone -> checkout -> install -> per-platform build -> artifact
//! discovery -> packaging for one task. Stages are strictly sequential and
//! platforms share one working tree, so a platform build must finish (or
//! fail) before the next starts. The per-task scratch workspace is removed
//! whatever the outcome.

pub mod artifacts;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, mpsc};
use uuid::Uuid;

use crate::config::{Config, GitConfig};
use crate::tasks::{TaskConfig, TaskResult};
use crate::{Error, Result};

/// Default dependency-install command
pub const DEFAULT_INSTALL_SCRIPT: &str = "npm install";

/// Default build command
pub const DEFAULT_BUILD_SCRIPT: &str = "npm run build";

/// Environment variable carrying the target platform into the build
pub const PLATFORM_ENV: &str = "FORGE_PLATFORM";

/// Interval between artifact-discovery polls
const DISCOVERY_POLL: Duration = Duration::from_secs(1);

/// One progress report: advisory percentage plus a log line
pub type Progress = (u8, String);

/// Executes the packaging pipeline for tasks, one child process at a time
/// per task
pub struct PackExecutor {
    workspace_root: PathBuf,
    git: GitConfig,
    artifact_timeout: Duration,
    /// Cancellation tokens for currently running tasks
    running: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

impl PackExecutor {
    /// Create an executor rooted at the configured workspace directory
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            git: config.git.clone(),
            artifact_timeout: Duration::from_secs(config.artifact_timeout_secs.max(1)),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Execute the full pipeline for one task
    ///
    /// Progress is advisory: a percentage and log line per phase transition
    /// and per chunk of subprocess output. The scratch directory for the
    /// task is removed on completion and on failure alike.
    ///
    /// # Errors
    ///
    /// Any failing stage is terminal for the task; the error message carries
    /// the stage and cause. There are no retries.
    pub async fn execute(
        &self,
        task_id: Uuid,
        config: &TaskConfig,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Result<Vec<TaskResult>> {
        let work_dir = self.workspace_root.join(task_id.to_string());
        let cancel = Arc::new(Notify::new());
        self.running
            .lock()
            .await
            .insert(task_id, Arc::clone(&cancel));

        let outcome = self.run_stages(&work_dir, config, &cancel, progress).await;

        self.running.lock().await.remove(&task_id);
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, dir = %work_dir.display(), "failed to clean scratch workspace");
            }
        }
        outcome
    }

    /// Signal the running child of `task_id` to terminate
    ///
    /// In-flight pipeline state is abandoned, not rolled back; the scratch
    /// directory is still removed by the pipeline's cleanup path. Returns
    /// whether the task was actually running.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.running.lock().await.remove(&task_id) {
            token.notify_one();
            true
        } else {
            false
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    async fn run_stages(
        &self,
        work_dir: &Path,
        config: &TaskConfig,
        cancel: &Notify,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Result<Vec<TaskResult>> {
        if config.platforms.is_empty() {
            return Err(Error::Pipeline("no target platforms".to_string()));
        }

        tokio::fs::create_dir_all(work_dir).await?;
        report(progress, 5, "workspace ready");

        report(progress, 10, "cloning repository...");
        self.clone_repository(&config.repo_url, work_dir, cancel, progress)
            .await?;
        report(progress, 20, "repository cloned");

        report(progress, 25, format!("checking out {}", config.branch));
        checkout_branch(work_dir, &config.branch, cancel, progress).await?;
        report(progress, 30, "branch checked out");

        report(progress, 35, "installing dependencies...");
        install_dependencies(work_dir, config.install_script.as_deref(), cancel, progress).await?;
        report(progress, 60, "dependencies installed");

        let mut results = Vec::new();
        let total = config.platforms.len() as f64;
        for (index, platform) in config.platforms.iter().enumerate() {
            let base = 35.0f64.mul_add(index as f64 / total, 60.0);
            report(progress, base as u8, format!("building for {platform}..."));
            let result = self
                .build_for_platform(work_dir, platform, config, cancel, progress)
                .await?;
            results.push(result);
            report(
                progress,
                (base + 35.0 / total) as u8,
                format!("{platform} build finished"),
            );
        }

        report(progress, 95, "copying build results...");
        let results = copy_results(results, &config.output_dir).await?;
        report(progress, 100, "packaging complete");
        Ok(results)
    }

    async fn clone_repository(
        &self,
        repo_url: &str,
        work_dir: &Path,
        cancel: &Notify,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Result<()> {
        let url = self.git.authenticated_url(repo_url);
        let mut command = Command::new(git_binary()?);
        command.arg("clone").arg(&url).arg(work_dir);
        run_command(command, "clone", 15, 15, cancel, progress).await
    }

    async fn build_for_platform(
        &self,
        work_dir: &Path,
        platform: &str,
        config: &TaskConfig,
        cancel: &Notify,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Result<TaskResult> {
        let started = Instant::now();

        let script = config.build_script.as_deref().unwrap_or(DEFAULT_BUILD_SCRIPT);
        let mut command = script_command(script)?;
        command.current_dir(work_dir).env(PLATFORM_ENV, platform);
        if let Some(env) = &config.env {
            command.envs(env);
        }
        run_command(
            command,
            &format!("build[{platform}]"),
            65,
            70,
            cancel,
            progress,
        )
        .await?;

        let artifact = self.find_build_output(work_dir, platform, cancel).await?;
        let size = tokio::fs::metadata(&artifact).await?.len();
        Ok(TaskResult {
            output_path: artifact,
            platform: platform.to_string(),
            size,
            build_time: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Poll the build output tree until a qualifying artifact appears or the
    /// timeout lapses
    ///
    /// The build tool's process exit does not guarantee its output file has
    /// finished flushing to disk.
    async fn find_build_output(
        &self,
        work_dir: &Path,
        platform: &str,
        cancel: &Notify,
    ) -> Result<PathBuf> {
        let root = work_dir.join("dist");
        let attempts = self.artifact_timeout.as_secs().max(1);
        for _ in 0..attempts {
            if let Some(found) = artifacts::find_platform_artifacts(&root, platform)
                .into_iter()
                .next()
            {
                return Ok(found);
            }
            tokio::select! {
                () = tokio::time::sleep(DISCOVERY_POLL) => {}
                () = cancel.notified() => {
                    return Err(Error::Pipeline("artifact discovery cancelled".to_string()));
                }
            }
        }
        Err(Error::Pipeline(format!(
            "no {platform} build output found within {}s",
            self.artifact_timeout.as_secs()
        )))
    }
}

async fn checkout_branch(
    work_dir: &Path,
    branch: &str,
    cancel: &Notify,
    progress: &mpsc::UnboundedSender<Progress>,
) -> Result<()> {
    let mut command = Command::new(git_binary()?);
    command.arg("checkout").arg(branch).current_dir(work_dir);
    run_command(command, "checkout", 27, 27, cancel, progress).await
}

async fn install_dependencies(
    work_dir: &Path,
    script: Option<&str>,
    cancel: &Notify,
    progress: &mpsc::UnboundedSender<Progress>,
) -> Result<()> {
    let script = script.unwrap_or(DEFAULT_INSTALL_SCRIPT);
    let mut command = script_command(script)?;
    command.current_dir(work_dir);
    run_command(command, "install", 40, 45, cancel, progress).await
}

/// Copy each artifact into the output directory under a platform+timestamp
/// name, rewriting result paths to the final location
async fn copy_results(
    mut results: Vec<TaskResult>,
    output_dir: &Path,
) -> Result<Vec<TaskResult>> {
    tokio::fs::create_dir_all(output_dir).await?;
    for result in &mut results {
        let ext = result
            .output_path
            .extension()
            .and_then(|e| e.to_str())
            .map_or_else(String::new, |e| format!(".{e}"));
        let file_name = format!(
            "build_{}_{}{ext}",
            result.platform,
            Utc::now().timestamp_millis()
        );
        let target = output_dir.join(file_name);
        tokio::fs::copy(&result.output_path, &target).await?;
        result.output_path = target;
    }
    Ok(results)
}

/// Split a whitespace-separated script into a command
fn script_command(script: &str) -> Result<Command> {
    let mut parts = script.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Pipeline("empty script".to_string()))?;
    let mut command = Command::new(program);
    command.args(parts);
    Ok(command)
}

fn git_binary() -> Result<PathBuf> {
    which::which("git").map_err(|e| Error::Pipeline(format!("git not found: {e}")))
}

/// Spawn a child process, forward its output lines as progress logs, and
/// wait for exit
///
/// A cancellation signal terminates the child and aborts the stage; a
/// non-zero exit code is a terminal failure.
async fn run_command(
    mut command: Command,
    label: &str,
    stdout_percent: u8,
    stderr_percent: u8,
    cancel: &Notify,
    progress: &mpsc::UnboundedSender<Progress>,
) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::Pipeline(format!("{label}: failed to spawn: {e}")))?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, label.to_string(), stdout_percent, progress.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, label.to_string(), stderr_percent, progress.clone());
    }

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| Error::Pipeline(format!("{label}: wait failed: {e}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::Pipeline(format!(
                    "{label} exited with code {}",
                    status.code().unwrap_or(-1)
                )))
            }
        }
        () = cancel.notified() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, label, "failed to signal child process");
            }
            let _ = child.wait().await;
            Err(Error::Pipeline(format!("{label} cancelled")))
        }
    }
}

fn forward_lines<R>(
    stream: R,
    label: String,
    percent: u8,
    progress: mpsc::UnboundedSender<Progress>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                let _ = progress.send((percent, format!("{label}: {trimmed}")));
            }
        }
    });
}

fn report(progress: &mpsc::UnboundedSender<Progress>, percent: u8, log: impl Into<String>) {
    let _ = progress.send((percent, log.into()));
}
