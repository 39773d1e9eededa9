//! OS plumbing for task runs: building the child command, delivering kill
//! signals and pumping output streams into capture writers.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::KillSignal;
use crate::output::SharedLog;
use crate::vars::Environment;

/// How long to keep draining output after the process has exited. Grandchildren
/// that inherited the pipes can otherwise hold them open indefinitely.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// Builds the argv for a resolved command.
///
/// With an executor (e.g. `["bash", "-c"]`) the whole command becomes its last
/// argument. Without one the command is split on whitespace.
pub fn command_argv(command: &str, executor: &[String]) -> Vec<String> {
    if executor.is_empty() {
        command.split_whitespace().map(str::to_string).collect()
    } else {
        let mut argv = executor.to_vec();
        argv.push(command.to_string());
        argv
    }
}

/// Prepares a child process with piped output and exactly `env` as its
/// environment.
pub fn build_command(argv: &[String], env: &Environment, pwd: Option<&str>) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(pwd) = pwd {
        command.current_dir(pwd);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    debug!(argv = %shell_words::join(argv), "prepared command");
    Ok(command)
}

/// Sends `signal` to the process group led by `pid` and to `pid` itself.
#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: KillSignal) {
    let sig = match signal {
        KillSignal::SigInt => libc::SIGINT,
        KillSignal::SigTerm => libc::SIGTERM,
        KillSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as i32;
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

/// Copies everything from `reader` into `log` until EOF or a read error.
pub async fn pump<R>(mut reader: R, log: SharedLog)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = log.write(&buf[..n]) {
                    warn!(error = %err, "failed to write captured output");
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "output stream closed with error");
                break;
            }
        }
    }
}

/// Waits for a pump to finish, aborting it if the stream stays open too long.
pub async fn drain(pump: JoinHandle<()>) {
    let abort = pump.abort_handle();
    if tokio::time::timeout(PUMP_DRAIN, pump).await.is_err() {
        debug!("output stream still open after exit, abandoning it");
        abort.abort();
    }
}
