//! Task orchestration
//!
//! Owns the task table, decides whether a submission runs locally or fans
//! out to workers, reacts to pipeline and messaging events, and drives the
//! post-build artifact upload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use crate::events::{EventBus, FleetEvent};
use crate::net::{NetEvent, NetworkManager};
use crate::pipeline::PackExecutor;
use crate::protocol::{Envelope, PackTaskData, TaskSnapshot};
use crate::transfer::archive;

use super::types::{Task, TaskConfig, TaskProgress, TaskStatus};

/// The task orchestrator for one fleet node
pub struct TaskManager {
    tasks: RwLock<HashMap<Uuid, Task>>,
    executor: Arc<PackExecutor>,
    net: Arc<NetworkManager>,
    events: EventBus,
    /// Coordinator deployment mode: also execute submitted tasks locally
    run_local: bool,
    /// Tasks this node is executing itself; remote snapshots for these are
    /// ignored so a worker's view cannot clobber the local run
    local_runs: Mutex<HashSet<Uuid>>,
}

impl TaskManager {
    /// Create the orchestrator
    #[must_use]
    pub fn new(
        executor: Arc<PackExecutor>,
        net: Arc<NetworkManager>,
        events: EventBus,
        run_local: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            executor,
            net,
            events,
            run_local,
            local_runs: Mutex::new(HashSet::new()),
        })
    }

    /// Consume messaging-layer events until the channel closes
    pub async fn run(self: Arc<Self>, mut net_rx: mpsc::UnboundedReceiver<NetEvent>) {
        while let Some(event) = net_rx.recv().await {
            match event {
                NetEvent::PackTask(data) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.execute_pack_task(data.task_id, data.config).await;
                    });
                }
                NetEvent::TaskStatus(snapshot) => self.apply_remote_status(snapshot).await,
            }
        }
    }

    /// Record a new task and, as coordinator, fan it out to workers
    ///
    /// Workers never self-initiate: on a worker the record simply waits for
    /// the coordinator's `pack-task` dispatch.
    pub async fn create_pack_task(self: &Arc<Self>, config: TaskConfig) -> Uuid {
        let task_id = Uuid::new_v4();
        let task = Task::new(task_id, config.clone());
        self.tasks.write().await.insert(task_id, task.clone());
        self.events.publish(FleetEvent::TaskCreated { task });

        if self.net.is_server_mode() {
            let workers = self
                .net
                .broadcast_to_all(&Envelope::PackTask {
                    data: PackTaskData {
                        task_id,
                        config: config.clone(),
                    },
                })
                .await;
            tracing::info!(%task_id, workers, "pack task broadcast to workers");

            if self.run_local {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.execute_pack_task(task_id, config).await;
                });
            }
        }

        task_id
    }

    /// Execute the pipeline for a task
    ///
    /// Worker entry point for `pack-task` dispatches; also the
    /// coordinator's local run. The record is created on the fly when the
    /// task arrived over the wire.
    pub async fn execute_pack_task(self: &Arc<Self>, task_id: Uuid, mut config: TaskConfig) {
        if !self.net.is_server_mode() {
            // workers deliver results to the coordinator instead of keeping
            // them locally
            config.copy_local = Some(false);
        }
        self.local_runs.lock().await.insert(task_id);

        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .entry(task_id)
                .or_insert_with(|| Task::new(task_id, config.clone()));
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };
        self.events.publish(FleetEvent::TaskStarted { task });
        self.send_status(task_id).await;
        tracing::info!(%task_id, repo = %config.repo_url, platforms = ?config.platforms, "task started");

        // progress flows over a channel so pipeline reports drain without
        // blocking the executor
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let consumer = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((percent, log)) = progress_rx.recv().await {
                    manager.update_task_progress(task_id, percent, log).await;
                }
            })
        };

        let outcome = self.executor.execute(task_id, &config, &progress_tx).await;
        drop(progress_tx);
        let _ = consumer.await;

        match outcome {
            Ok(results) => {
                let finished = self
                    .finish_task(task_id, |task| {
                        task.status = TaskStatus::Completed;
                        task.progress = 100;
                        task.result = Some(results);
                    })
                    .await;
                if let Some(task) = finished {
                    tracing::info!(%task_id, artifacts = task.result.as_ref().map_or(0, Vec::len), "task completed");
                    self.events
                        .publish(FleetEvent::TaskCompleted { task: task.clone() });
                    self.send_status(task_id).await;
                    if !self.net.is_server_mode() {
                        self.upload_results(&task).await;
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                let finished = self
                    .finish_task(task_id, |task| {
                        task.status = TaskStatus::Failed;
                        task.error = Some(message.clone());
                    })
                    .await;
                if let Some(task) = finished {
                    tracing::warn!(%task_id, error = %message, "task failed");
                    self.events.publish(FleetEvent::TaskFailed { task });
                    self.send_status(task_id).await;
                }
            }
        }

        self.local_runs.lock().await.remove(&task_id);
    }

    /// Cancel a running task
    ///
    /// Signals the current child process and abandons in-flight pipeline
    /// state; scratch cleanup still happens on the pipeline's guaranteed
    /// path. No-op unless the task is currently running.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        {
            let tasks = self.tasks.read().await;
            let Some(task) = tasks.get(&task_id) else {
                return false;
            };
            if task.status != TaskStatus::Running {
                return false;
            }
        }

        // transition first so the pipeline's abort error cannot race the
        // record into `failed`
        let finished = self
            .finish_task(task_id, |task| task.status = TaskStatus::Cancelled)
            .await;
        let Some(task) = finished else {
            return false;
        };
        self.executor.cancel(task_id).await;
        tracing::info!(%task_id, "task cancelled");
        self.events.publish(FleetEvent::TaskCancelled { task });
        self.send_status(task_id).await;
        true
    }

    /// Record a progress tick; task progress never decreases
    pub async fn update_task_progress(&self, task_id: Uuid, percent: u8, log: String) {
        let update = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            task.progress = task.progress.max(percent.min(100));
            task.logs.push(log.clone());
            TaskProgress {
                task_id,
                progress: task.progress,
                log,
            }
        };
        self.events
            .publish(FleetEvent::TaskProgress { progress: update });
    }

    /// A task by id
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Every known task
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Tasks currently in `status`
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Ordered log lines for a task
    pub async fn task_logs(&self, task_id: Uuid) -> Vec<String> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .map(|t| t.logs.clone())
            .unwrap_or_default()
    }

    /// Evict completed task records
    pub async fn clear_completed_tasks(&self) {
        self.tasks
            .write()
            .await
            .retain(|_, task| task.status != TaskStatus::Completed);
    }

    /// Apply a terminal transition; refuses to leave an already-terminal
    /// state
    async fn finish_task(
        &self,
        task_id: Uuid,
        apply: impl FnOnce(&mut Task),
    ) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        apply(task);
        task.completed_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Fold a worker's status snapshot into the local task table
    ///
    /// Last writer wins across workers; the record tracks the most recent
    /// reporting node. Snapshots for tasks this node is executing itself
    /// are ignored, and a record that reached a terminal state is frozen.
    async fn apply_remote_status(&self, snapshot: TaskSnapshot) {
        if self.local_runs.lock().await.contains(&snapshot.task_id) {
            return;
        }
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&snapshot.task_id) else {
            tracing::debug!(task_id = %snapshot.task_id, "status snapshot for unknown task");
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = snapshot.status;
        task.progress = task.progress.max(snapshot.progress.min(100));
        task.assigned_node = snapshot.node_id;
        if snapshot.error.is_some() {
            task.error = snapshot.error;
        }
        if snapshot.status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
    }

    /// Report this node's view of a task to the coordinator (worker side)
    async fn send_status(&self, task_id: Uuid) {
        if self.net.is_server_mode() {
            return;
        }
        let snapshot = {
            let tasks = self.tasks.read().await;
            let Some(task) = tasks.get(&task_id) else {
                return;
            };
            TaskSnapshot {
                task_id,
                node_id: Some(self.net.node_id()),
                status: task.status,
                progress: task.progress,
                error: task.error.clone(),
            }
        };
        if let Err(e) = self
            .net
            .send_to_server(Envelope::TaskStatus { data: snapshot })
            .await
        {
            tracing::debug!(%task_id, error = %e, "task status not delivered");
        }
    }

    /// Compress and stream each artifact to the coordinator
    ///
    /// Best-effort: a failed upload is logged and never fails the task. The
    /// temporary compressed copy is deleted whatever the outcome.
    async fn upload_results(&self, task: &Task) {
        let Some(results) = task.result.as_ref().filter(|r| !r.is_empty()) else {
            return;
        };
        if self.net.status().await != crate::nodes::ServerStatus::Connected {
            tracing::debug!(task_id = %task.id, "no coordinator connection; keeping artifacts locally");
            return;
        }

        for result in results {
            let file_name = format!("{}_{}.zip", task.id, result.platform);
            let upload_id = format!("{}-{}", task.id, result.platform);

            let staging = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot create upload staging directory");
                    continue;
                }
            };
            let zip_path = staging.path().join(&file_name);

            if let Err(e) = archive::compress_file(&result.output_path, &zip_path).await {
                tracing::warn!(error = %e, artifact = %result.output_path.display(), "artifact compression failed");
                continue;
            }

            match self
                .net
                .upload_file_to_server(&zip_path, &upload_id, &file_name, Some(task.id.to_string()))
                .await
            {
                Ok(ack) => {
                    tracing::info!(%upload_id, path = ?ack.path, "artifact delivered to coordinator");
                }
                Err(e) => {
                    tracing::warn!(%upload_id, error = %e, "artifact upload failed");
                }
            }
            // staging dir and the temp zip are removed when `staging` drops
        }
    }
}
