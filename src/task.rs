//! Supervised tasks.
//!
//! A [`Task`] is a cheap, cloneable handle. Its active-run slot and its
//! service flag are guarded independently so status reads, starts and stops
//! only contend for the slot they touch. Run history is append-only.
//!
//! Each launched run is followed by a supervising tokio task that walks the
//! restart cycle:
//!
//! ```text
//! Running -> exited -> slot cleared -> Idle
//!                                   -> Restarting (1s) -> service still on
//!                                                         and slot empty -> Running
//! ```
//!
//! The service flag is read after the exit and again immediately before the
//! relaunch, so a stop that lands during the cool-down prevents it. A stop
//! that lands after the relaunch sees the new run and stops that instead.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::KillSignal;
use crate::events::{Notifier, TaskEvent, TaskEventKind};
use crate::process::{CompletionHandle, RunPlan, RunSnapshot, TaskRun};
use crate::vars::{add_default_vars, replace_vars, Environment};

/// Pause between a service's exit and its automatic relaunch.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Static definition of a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub id: usize,
    pub name: String,
    pub workspace: String,
    pub command: String,
    pub executor: Vec<String>,
    pub environment: Environment,
    pub stdout: String,
    pub stderr: String,
    pub pwd: String,
    pub kill_signal: KillSignal,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Running,
    Stopped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running => f.write_str("Running"),
            TaskStatus::Stopped => f.write_str("Stopped"),
        }
    }
}

struct ActiveRun {
    run: Arc<TaskRun>,
    done: CompletionHandle,
}

/// A launched run whose exit the task has yet to account for.
struct Launched {
    run: Arc<TaskRun>,
    process_done: CompletionHandle,
    report: watch::Sender<Option<i32>>,
}

struct TaskInner {
    spec: TaskSpec,
    notifier: Notifier,
    service: AtomicBool,
    active: Mutex<Option<ActiveRun>>,
    runs: Mutex<Vec<Arc<TaskRun>>>,
}

#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("workspace", &self.inner.spec.workspace)
            .field("name", &self.inner.spec.name)
            .field("service", &self.is_service())
            .field("status", &self.status())
            .finish()
    }
}

/// Serializable view of a task and its runs.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: usize,
    pub name: String,
    pub command: String,
    pub executor: Vec<String>,
    pub environment: Environment,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub metadata: BTreeMap<String, String>,
    pub pwd: String,
    pub killsignal: KillSignal,
    pub service: bool,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<RunSnapshot>,
    pub task_runs: Vec<RunSnapshot>,
}

impl Task {
    /// Builds a task, seeding `TASK` and the default variables into its
    /// environment and resolving its output path templates against it.
    pub fn new(mut spec: TaskSpec, service: bool, notifier: Notifier) -> Self {
        let mut environment = add_default_vars(std::mem::take(&mut spec.environment));
        environment
            .entry("TASK".to_string())
            .or_insert_with(|| spec.name.clone());
        spec.stdout = replace_vars(&spec.stdout, &environment);
        spec.stderr = replace_vars(&spec.stderr, &environment);
        spec.environment = environment;

        Self {
            inner: Arc::new(TaskInner {
                spec,
                notifier,
                service: AtomicBool::new(service),
                active: Mutex::new(None),
                runs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.inner.spec
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runs(&self) -> MutexGuard<'_, Vec<Arc<TaskRun>>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: TaskEventKind) {
        self.inner.notifier.notify(TaskEvent {
            workspace: self.inner.spec.workspace.clone(),
            task: self.inner.spec.name.clone(),
            kind,
        });
    }

    pub fn is_service(&self) -> bool {
        self.inner.service.load(Ordering::SeqCst)
    }

    pub fn set_service(&self, service: bool) {
        self.inner.service.store(service, Ordering::SeqCst);
    }

    pub fn status(&self) -> TaskStatus {
        if self.lock_active().is_some() {
            TaskStatus::Running
        } else {
            TaskStatus::Stopped
        }
    }

    /// Starts a run unless one is already active. Either way the returned
    /// handle resolves with the exit code of the run that is active now.
    pub fn start(&self) -> CompletionHandle {
        let mut active = self.lock_active();
        if let Some(current) = active.as_ref() {
            debug!(task = %self.name(), run = current.run.id(), "already running");
            return current.done.clone();
        }
        let (launched, done) = self.launch_run();
        *active = Some(ActiveRun {
            run: Arc::clone(&launched.run),
            done: done.clone(),
        });
        drop(active);

        self.notify(TaskEventKind::Started);
        tokio::spawn(self.clone().supervise(launched));
        done
    }

    /// Signals the active run with the task's kill signal and clears the
    /// slot right away. The process may still be exiting afterwards.
    pub fn stop(&self) {
        self.stop_with(self.inner.spec.kill_signal);
    }

    /// Like [`Task::stop`] but always kills forcefully.
    pub fn kill(&self) {
        self.stop_with(KillSignal::SigKill);
    }

    fn stop_with(&self, signal: KillSignal) {
        let taken = self.lock_active().take();
        if let Some(active) = taken {
            active.run.stop(signal);
            self.notify(TaskEventKind::Stopped);
        }
    }

    /// Completion handle of the active run, if any.
    pub fn completion(&self) -> Option<CompletionHandle> {
        self.lock_active().as_ref().map(|active| active.done.clone())
    }

    pub fn active_run(&self) -> Option<Arc<TaskRun>> {
        self.lock_active()
            .as_ref()
            .map(|active| Arc::clone(&active.run))
    }

    pub fn runs(&self) -> Vec<Arc<TaskRun>> {
        self.lock_runs().clone()
    }

    /// Creates the next run, records it in the history and launches it.
    /// The second value resolves once the task has finished its bookkeeping
    /// for the run.
    fn launch_run(&self) -> (Launched, CompletionHandle) {
        let run = {
            let mut runs = self.lock_runs();
            let run = Arc::new(TaskRun::new(runs.len(), self.plan(runs.len())));
            runs.push(Arc::clone(&run));
            run
        };
        info!(task = %self.name(), workspace = %self.inner.spec.workspace, run = run.id(), "starting task");
        let process_done = run.launch();
        let (report, task_done) = CompletionHandle::channel();
        let launched = Launched {
            run,
            process_done,
            report,
        };
        (launched, task_done)
    }

    fn plan(&self, run_id: usize) -> RunPlan {
        let spec = &self.inner.spec;
        let command = replace_vars(&spec.command, &spec.environment);
        let pwd = replace_vars(&spec.pwd, &spec.environment);

        let mut path_vars = spec.environment.clone();
        path_vars.insert("RUN".to_string(), run_id.to_string());
        path_vars.insert("TASK_ID".to_string(), spec.id.to_string());
        if !pwd.is_empty() {
            path_vars.insert("PWD".to_string(), pwd.clone());
        }

        RunPlan {
            command,
            executor: spec.executor.clone(),
            environment: spec.environment.clone(),
            pwd: (!pwd.is_empty()).then_some(pwd),
            stdout: replace_vars(&spec.stdout, &path_vars),
            stderr: replace_vars(&spec.stderr, &path_vars),
        }
    }

    async fn supervise(self, mut launched: Launched) {
        loop {
            let Launched {
                run,
                process_done,
                report,
            } = launched;
            let code = process_done.wait().await;
            self.finish(&run);
            report.send_replace(Some(code));
            info!(task = %self.name(), run = run.id(), code, "task exited");

            if !self.is_service() {
                break;
            }
            debug!(task = %self.name(), "service exited, restarting after cool-down");
            tokio::time::sleep(RESTART_COOLDOWN).await;

            match self.relaunch() {
                Some(next) => launched = next,
                None => break,
            }
        }
    }

    /// Clears the active slot if it still holds `run`.
    fn finish(&self, run: &Arc<TaskRun>) {
        let cleared = {
            let mut active = self.lock_active();
            let is_current = active
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.run, run));
            if is_current {
                *active = None;
            }
            is_current
        };
        if cleared {
            self.notify(TaskEventKind::Stopped);
        }
    }

    fn relaunch(&self) -> Option<Launched> {
        let mut active = self.lock_active();
        if !self.is_service() {
            debug!(task = %self.name(), "service disabled during cool-down");
            return None;
        }
        if active.is_some() {
            debug!(task = %self.name(), "started elsewhere during cool-down");
            return None;
        }
        let (launched, done) = self.launch_run();
        *active = Some(ActiveRun {
            run: Arc::clone(&launched.run),
            done,
        });
        drop(active);
        self.notify(TaskEventKind::Started);
        Some(launched)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let spec = &self.inner.spec;
        let active_task = self.active_run().map(|run| run.snapshot());
        let task_runs = self.runs().iter().map(|run| run.snapshot()).collect();
        TaskSnapshot {
            id: spec.id,
            name: spec.name.clone(),
            command: spec.command.clone(),
            executor: spec.executor.clone(),
            environment: spec.environment.clone(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
            metadata: spec.metadata.clone(),
            pwd: spec.pwd.clone(),
            killsignal: spec.kill_signal,
            service: self.is_service(),
            status: self.status(),
            active_task,
            task_runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NOTIFY_CAPACITY;

    fn spec(name: &str, command: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            workspace: "w1".to_string(),
            command: command.to_string(),
            ..TaskSpec::default()
        }
    }

    async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[test]
    fn seeds_task_variable_and_resolves_paths() {
        let mut spec = spec("build", "echo $TASK");
        spec.stdout = "/tmp/$TASK-$RUN.out".to_string();
        let task = Task::new(spec, false, Notifier::detached());

        assert_eq!(task.spec().environment.get("TASK").map(String::as_str), Some("build"));
        assert_eq!(task.spec().stdout, "/tmp/build-$RUN.out");

        let plan = task.plan(3);
        assert_eq!(plan.command, "echo build");
        assert_eq!(plan.stdout, "/tmp/build-3.out");
        assert_eq!(plan.pwd, None);
    }

    #[tokio::test]
    async fn completion_clears_the_active_run() {
        let task = Task::new(spec("t1", "echo hello"), false, Notifier::detached());
        let code = task.start().wait().await;

        assert_eq!(code, 0);
        assert_eq!(task.status(), TaskStatus::Stopped);
        let runs = task.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].stdout_text(), "hello\n");
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let task = Task::new(spec("t", "sleep 0.3"), false, Notifier::detached());
        let first = task.start();
        let second = task.start();

        assert_eq!(task.runs().len(), 1);
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(first.wait().await, second.wait().await);
        assert_eq!(task.runs().len(), 1);
    }

    #[tokio::test]
    async fn stop_clears_slot_immediately() {
        let task = Task::new(spec("t", "sleep 30"), false, Notifier::detached());
        let done = task.start();
        task.stop();

        assert_eq!(task.status(), TaskStatus::Stopped);
        assert!(task.active_run().is_none());
        let code = tokio::time::timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn service_restarts_after_cooldown() {
        let task = Task::new(spec("svc", "true"), true, Notifier::detached());
        task.start();

        assert!(eventually(Duration::from_secs(5), || task.runs().len() >= 3).await);
        task.set_service(false);
        task.stop();

        let runs = task.runs();
        for pair in runs.windows(2) {
            let (Some(stopped), Some(started)) = (pair[0].stopped(), pair[1].started()) else {
                panic!("runs should have timestamps");
            };
            assert!(started - stopped >= time::Duration::seconds(1));
        }
    }

    #[tokio::test]
    async fn disabling_service_during_cooldown_prevents_relaunch() {
        let task = Task::new(spec("svc", "true"), true, Notifier::detached());
        task.start().wait().await;
        // The process is gone; the supervisor is now cooling down.
        task.set_service(false);
        tokio::time::sleep(RESTART_COOLDOWN + Duration::from_millis(500)).await;

        assert_eq!(task.runs().len(), 1);
        assert_eq!(task.status(), TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn start_and_stop_notify() {
        let (notifier, mut rx) = Notifier::channel(NOTIFY_CAPACITY);
        let task = Task::new(spec("t", "sleep 30"), false, notifier);
        task.start();
        task.stop();

        let started = rx.recv().await.unwrap();
        assert_eq!(started.kind, TaskEventKind::Started);
        assert_eq!(started.workspace, "w1");
        let stopped = rx.recv().await.unwrap();
        assert_eq!(stopped.kind, TaskEventKind::Stopped);
    }

    #[tokio::test]
    async fn snapshot_reports_status_and_history() {
        let task = Task::new(spec("t", "echo snap"), false, Notifier::detached());
        task.start().wait().await;

        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Stopped);
        assert!(snapshot.active_task.is_none());
        assert_eq!(snapshot.task_runs.len(), 1);
        assert_eq!(snapshot.task_runs[0].stdout_buf, "snap\n");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "Stopped");
        assert_eq!(json["killsignal"], "sigkill");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_uses_the_configured_signal() {
        let mut spec = spec(
            "graceful",
            "trap 'echo got-int; exit 5' INT; echo ready; while true; do sleep 0.05; done",
        );
        spec.executor = vec!["sh".to_string(), "-c".to_string()];
        spec.kill_signal = KillSignal::SigInt;
        let task = Task::new(spec, false, Notifier::detached());
        let done = task.start();

        let run = task.active_run().unwrap();
        assert!(eventually(Duration::from_secs(5), || run.stdout_text().contains("ready")).await);
        task.stop();

        let code = tokio::time::timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap();
        assert_eq!(code, 5);
        assert!(run.stdout_text().ends_with("got-int\n"));
    }
}
