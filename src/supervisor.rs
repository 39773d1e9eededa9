//! The supervisor: registry of every workspace and the single entry point
//! for starting, stopping and inspecting tasks.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::WorkspaceConfig;
use crate::error::{LencakError, Result};
use crate::events::{Notifier, TaskEvent, NOTIFY_CAPACITY};
use crate::task::{Task, TaskSnapshot, TaskStatus};
use crate::workspace::{self, Globals, Workspace, WorkspaceSnapshot};

/// A single task together with its workspace's descriptive fields.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub workspace: WorkspaceSnapshot,
    pub task: TaskSnapshot,
}

pub struct Supervisor {
    workspaces: Mutex<BTreeMap<String, Workspace>>,
    globals: Globals,
    notifications: Mutex<Option<mpsc::Receiver<TaskEvent>>>,
}

impl Supervisor {
    /// Assembles every workspace and then starts the configured services.
    /// Must be called from within a tokio runtime.
    pub fn new(configs: &[WorkspaceConfig], globals: Globals) -> Self {
        let (notifier, rx) = Notifier::channel(NOTIFY_CAPACITY);
        let workspaces = workspace::configure_workspaces(configs, &globals, &notifier);
        for workspace in workspaces.values() {
            workspace.start_services();
        }
        info!(workspaces = workspaces.len(), "supervisor ready");
        Self {
            workspaces: Mutex::new(workspaces),
            globals,
            notifications: Mutex::new(Some(rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Workspace>> {
        self.workspaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a task and returns a handle to it. The registry lock is
    /// released before the caller acts on the handle.
    pub fn task(&self, workspace: &str, task: &str) -> Result<Task> {
        let workspaces = self.lock();
        let ws = workspaces
            .get(workspace)
            .ok_or_else(|| LencakError::UnknownWorkspace(workspace.to_string()))?;
        ws.task(task)
            .cloned()
            .ok_or_else(|| LencakError::UnknownTask {
                workspace: workspace.to_string(),
                task: task.to_string(),
            })
    }

    /// Issues a start. Returns false when the workspace or task is unknown.
    /// With `as_service` the task is flagged to restart after every exit.
    pub fn start_task(&self, workspace: &str, task: &str, as_service: bool) -> bool {
        match self.task(workspace, task) {
            Ok(task) => {
                if as_service {
                    task.set_service(true);
                }
                task.start();
                true
            }
            Err(err) => {
                warn!(error = %err, "start rejected");
                false
            }
        }
    }

    /// Issues a stop. With `disable_service` the service flag is cleared
    /// before the signal is sent, so no further restart happens.
    pub fn stop_task(&self, workspace: &str, task: &str, disable_service: bool) -> bool {
        match self.task(workspace, task) {
            Ok(task) => {
                if disable_service {
                    task.set_service(false);
                }
                task.stop();
                true
            }
            Err(err) => {
                warn!(error = %err, "stop rejected");
                false
            }
        }
    }

    pub fn status(&self, workspace: &str, task: &str) -> Result<TaskStatus> {
        self.task(workspace, task).map(|task| task.status())
    }

    /// Full registry, including every task's run history.
    ///
    /// Only handles are copied under the registry lock. Reading captured
    /// output (possibly from disk) happens after it is released.
    pub fn snapshot(&self) -> BTreeMap<String, WorkspaceSnapshot> {
        let parts: Vec<_> = self
            .lock()
            .iter()
            .map(|(name, ws)| (name.clone(), ws.summary(), ws.task_handles()))
            .collect();
        parts
            .into_iter()
            .map(|(name, summary, tasks)| (name, summary.with_tasks(&tasks)))
            .collect()
    }

    pub fn workspace_snapshot(&self, workspace: &str) -> Result<WorkspaceSnapshot> {
        let (summary, tasks) = self
            .lock()
            .get(workspace)
            .map(|ws| (ws.summary(), ws.task_handles()))
            .ok_or_else(|| LencakError::UnknownWorkspace(workspace.to_string()))?;
        Ok(summary.with_tasks(&tasks))
    }

    pub fn task_snapshot(&self, workspace: &str, task: &str) -> Result<TaskDetail> {
        let handle = self.task(workspace, task)?;
        let summary = self
            .lock()
            .get(workspace)
            .map(Workspace::summary)
            .ok_or_else(|| LencakError::UnknownWorkspace(workspace.to_string()))?;
        Ok(TaskDetail {
            workspace: summary,
            task: handle.snapshot(),
        })
    }

    /// Evaluates every column of `workspace` for `task`, one after another.
    /// A column whose function cannot be resolved yields an empty string.
    pub async fn evaluate_columns(
        &self,
        workspace: &str,
        task: &str,
    ) -> Result<BTreeMap<String, String>> {
        let handle = self.task(workspace, task)?;
        let columns: Vec<_> = {
            let workspaces = self.lock();
            let Some(ws) = workspaces.get(workspace) else {
                return Err(LencakError::UnknownWorkspace(workspace.to_string()));
            };
            ws.columns()
                .iter()
                .map(|(name, column)| {
                    (
                        name.clone(),
                        ws.resolve_function(&column.function, &self.globals),
                        column.args.clone(),
                    )
                })
                .collect()
        };

        let mut values = BTreeMap::new();
        for (name, function, args) in columns {
            let value = match function {
                Some(function) => workspace::exec_function(&function, &args, &handle).await,
                None => {
                    warn!(workspace, column = %name, "column function not found");
                    String::new()
                }
            };
            values.insert(name, value);
        }
        Ok(values)
    }

    /// Runs a single named function on behalf of `task`. An unknown
    /// function name yields an empty string.
    pub async fn exec_function(
        &self,
        workspace: &str,
        task: &str,
        function: &str,
        args: &[String],
    ) -> Result<String> {
        let handle = self.task(workspace, task)?;
        let resolved = self
            .lock()
            .get(workspace)
            .and_then(|ws| ws.resolve_function(function, &self.globals));
        match resolved {
            Some(function) => Ok(workspace::exec_function(&function, args, &handle).await),
            None => {
                warn!(workspace, function, "function not found");
                Ok(String::new())
            }
        }
    }

    /// Hands out the receiving end of the notification channel. There is
    /// one consumer, so only the first call gets it.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<TaskEvent>> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn all_tasks(&self) -> Vec<Task> {
        self.lock()
            .values()
            .flat_map(|ws| ws.tasks().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Disables every service, force-kills every active run and waits up to
    /// `grace` for them to exit. Returns true if they all did in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let mut pending = Vec::new();
        for task in self.all_tasks() {
            task.set_service(false);
            if let Some(done) = task.completion() {
                info!(task = %task.name(), "killing task");
                pending.push(done);
                task.kill();
            }
        }
        if pending.is_empty() {
            return true;
        }

        let waiting = pending.len();
        let all_done = async {
            for done in pending {
                done.wait().await;
            }
        };
        match tokio::time::timeout(grace, all_done).await {
            Ok(()) => {
                info!(tasks = waiting, "all tasks stopped");
                true
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "tasks still running after shutdown grace period");
                false
            }
        }
    }
}
