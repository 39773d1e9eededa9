//! A single execution attempt of a task.
//!
//! A [`TaskRun`] is created with fully resolved inputs ([`RunPlan`]), launched
//! once, and kept afterwards for inspection. Only its own waiter task writes
//! to it after launch; readers take short-lived locks to build snapshots.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::config::KillSignal;
use crate::output::{self, SharedLog};
use crate::runner;
use crate::vars::Environment;

/// Exit code reported when the process could not be launched.
pub const LAUNCH_FAILED_EXIT: i32 = 1;
/// Exit code reported when the process was terminated by a signal.
pub const SIGNALED_EXIT: i32 = -1;

/// A timestamped entry in a run's event log.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub message: String,
}

impl RunEvent {
    fn now(message: String) -> Self {
        Self {
            time: OffsetDateTime::now_utc(),
            message,
        }
    }
}

/// Resolved inputs of a run, after variable substitution.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub command: String,
    pub executor: Vec<String>,
    pub environment: Environment,
    pub pwd: Option<String>,
    /// Stdout file path, empty for in-memory capture.
    pub stdout: String,
    /// Stderr file path, empty for in-memory capture.
    pub stderr: String,
}

#[derive(Debug, Default)]
struct RunState {
    pid: Option<u32>,
    started: Option<OffsetDateTime>,
    stopped: Option<OffsetDateTime>,
    exit_code: Option<i32>,
    error: Option<String>,
    events: Vec<RunEvent>,
    stdout: Option<SharedLog>,
    stderr: Option<SharedLog>,
}

/// Resolves once with the exit code of a run.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<i32>>,
}

impl CompletionHandle {
    pub(crate) fn channel() -> (watch::Sender<Option<i32>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Waits for the exit code. A handle whose producer vanished without
    /// reporting resolves as a launch failure.
    pub async fn wait(mut self) -> i32 {
        match self.rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(LAUNCH_FAILED_EXIT),
            Err(_) => LAUNCH_FAILED_EXIT,
        }
    }
}

#[derive(Debug)]
pub struct TaskRun {
    id: usize,
    plan: RunPlan,
    state: Mutex<RunState>,
    kill: Notify,
}

/// Serializable view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub error: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub stopped: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    pub events: Vec<RunEvent>,
    pub command: String,
    pub executor: Vec<String>,
    pub environment: Environment,
    pub pwd: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub stdout_buf: String,
    pub stderr_buf: String,
}

impl TaskRun {
    pub fn new(id: usize, plan: RunPlan) -> Self {
        Self {
            id,
            plan,
            state: Mutex::new(RunState::default()),
            kill: Notify::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the capture writers, spawns the process and a waiter task for
    /// it. The returned handle yields the exit code exactly once the output
    /// has been flushed and the exit recorded. Must be called at most once,
    /// from within a tokio runtime.
    pub fn launch(self: &Arc<Self>) -> CompletionHandle {
        let (done, handle) = CompletionHandle::channel();
        let stdout = output::open_log(&self.plan.stdout);
        let stderr = output::open_log(&self.plan.stderr);
        {
            let mut state = self.lock();
            state.started = Some(OffsetDateTime::now_utc());
            state.stdout = Some(stdout.clone());
            state.stderr = Some(stderr.clone());
        }

        let argv = runner::command_argv(&self.plan.command, &self.plan.executor);
        let spawned = runner::build_command(&argv, &self.plan.environment, self.plan.pwd.as_deref())
            .and_then(|mut command| command.spawn());

        match spawned {
            Ok(child) => {
                let pid = child.id();
                {
                    let mut state = self.lock();
                    state.pid = pid;
                    let message = format!(
                        "Process {} started: {}",
                        pid.unwrap_or_default(),
                        self.plan.command
                    );
                    info!("{message}");
                    state.events.push(RunEvent::now(message));
                }
                let run = Arc::clone(self);
                tokio::spawn(async move {
                    run.wait_for_exit(child, stdout, stderr, done).await;
                });
            }
            Err(err) => {
                error!(command = %self.plan.command, error = %err, "failed to start process");
                close_log(&stdout);
                close_log(&stderr);
                let mut state = self.lock();
                state.events.push(RunEvent::now(format!("Process failed to start: {err}")));
                state.error = Some(err.to_string());
                state.exit_code = Some(LAUNCH_FAILED_EXIT);
                state.stopped = Some(OffsetDateTime::now_utc());
                done.send_replace(Some(LAUNCH_FAILED_EXIT));
            }
        }
        handle
    }

    async fn wait_for_exit(
        self: Arc<Self>,
        mut child: Child,
        stdout: SharedLog,
        stderr: SharedLog,
        done: watch::Sender<Option<i32>>,
    ) {
        let out_pump = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(runner::pump(stream, stdout.clone())));
        let err_pump = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(runner::pump(stream, stderr.clone())));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.kill.notified() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        for pump in [out_pump, err_pump].into_iter().flatten() {
            runner::drain(pump).await;
        }
        close_log(&stdout);
        close_log(&stderr);

        let code = match &status {
            Ok(status) => status.code().unwrap_or(SIGNALED_EXIT),
            Err(_) => LAUNCH_FAILED_EXIT,
        };
        {
            let mut state = self.lock();
            let pid = state.pid.unwrap_or_default();
            if let Err(err) = &status {
                warn!(pid, error = %err, "failed waiting for process");
                state.error = Some(err.to_string());
            }
            let message = format!("Process {pid} exited with status {code}");
            info!("{message}");
            state.events.push(RunEvent::now(message));
            state.exit_code = Some(code);
            state.stopped = Some(OffsetDateTime::now_utc());
        }
        done.send_replace(Some(code));
    }

    /// Signals the process. A no-op if it never started or already exited.
    pub fn stop(&self, signal: KillSignal) {
        let pid = {
            let state = self.lock();
            if state.stopped.is_some() {
                return;
            }
            match state.pid {
                Some(pid) => pid,
                None => return,
            }
        };
        info!(pid, %signal, "stopping process");

        #[cfg(unix)]
        runner::send_os_signal(pid, signal);

        #[cfg(unix)]
        if signal == KillSignal::SigKill {
            self.kill.notify_one();
        }
        #[cfg(not(unix))]
        self.kill.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().stopped.is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn started(&self) -> Option<OffsetDateTime> {
        self.lock().started
    }

    pub fn stopped(&self) -> Option<OffsetDateTime> {
        self.lock().stopped
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.lock().events.clone()
    }

    pub fn stdout_text(&self) -> String {
        let log = self.lock().stdout.clone();
        log.map(|log| log.text()).unwrap_or_default()
    }

    pub fn stderr_text(&self) -> String {
        let log = self.lock().stderr.clone();
        log.map(|log| log.text()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let (pid, error, started, stopped, exit_code, events, stdout, stderr) = {
            let state = self.lock();
            (
                state.pid,
                state.error.clone().unwrap_or_default(),
                state.started,
                state.stopped,
                state.exit_code,
                state.events.clone(),
                state.stdout.clone(),
                state.stderr.clone(),
            )
        };
        RunSnapshot {
            id: self.id,
            pid,
            error,
            started,
            stopped,
            exit_code,
            events,
            command: self.plan.command.clone(),
            executor: self.plan.executor.clone(),
            environment: self.plan.environment.clone(),
            pwd: self.plan.pwd.clone().unwrap_or_default(),
            stdout: self.plan.stdout.clone(),
            stderr: self.plan.stderr.clone(),
            stdout_buf: stdout.map(|log| log.text()).unwrap_or_default(),
            stderr_buf: stderr.map(|log| log.text()).unwrap_or_default(),
        }
    }
}

fn close_log(log: &SharedLog) {
    if let Err(err) = log.close() {
        warn!(error = %err, "failed to close output capture");
    }
}
