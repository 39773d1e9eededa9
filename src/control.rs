//! Line-delimited JSON control socket.
//!
//! Every client gets the full registry snapshot on connect and again after
//! each task state change. Clients send one request per line and get one
//! reply per line:
//!
//! ```text
//! -> {"command":"start","workspace":"w1","task":"t2","service":true}
//! <- {"type":"reply","ok":true}
//! <- {"type":"snapshot","workspaces":{...}}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceSnapshot;

/// Default listen address of the control socket.
pub const DEFAULT_ADDR: &str = "127.0.0.1:9056";
/// Longest accepted request line, in bytes.
pub const MAX_MESSAGE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Start,
    Stop,
    Workspace,
    Task,
    Columns,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub command: ControlCommand,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub service: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Snapshot {
        workspaces: BTreeMap<String, WorkspaceSnapshot>,
    },
    Reply {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    fn ok(data: Option<Value>) -> Self {
        ServerMessage::Reply {
            ok: true,
            data,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        ServerMessage::Reply {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    fn render(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to serialize message");
                r#"{"type":"reply","ok":false,"error":"internal serialization error"}"#.to_string()
            }
        }
    }
}

fn render_snapshot(supervisor: &Supervisor) -> Arc<String> {
    Arc::new(
        ServerMessage::Snapshot {
            workspaces: supervisor.snapshot(),
        }
        .render(),
    )
}

/// Re-renders the snapshot after every notification and publishes the
/// latest one to all clients. Bursts collapse into a single render.
pub fn spawn_broadcaster(supervisor: Arc<Supervisor>) -> watch::Receiver<Arc<String>> {
    let (tx, rx) = watch::channel(render_snapshot(&supervisor));
    let Some(mut events) = supervisor.subscribe() else {
        warn!("notification channel already taken, snapshots will not refresh");
        return rx;
    };
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(workspace = %event.workspace, task = %event.task, kind = ?event.kind, "task changed");
            while events.try_recv().is_ok() {}
            // Rendering reads captured output, which may be file-backed.
            let source = Arc::clone(&supervisor);
            let rendered = match tokio::task::spawn_blocking(move || render_snapshot(&source)).await {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!(error = %err, "snapshot render failed");
                    continue;
                }
            };
            if tx.send(rendered).is_err() {
                break;
            }
        }
    });
    rx
}

/// Accepts control clients until the listener fails.
pub async fn serve(listener: TcpListener, supervisor: Arc<Supervisor>) -> Result<()> {
    let snapshots = spawn_broadcaster(Arc::clone(&supervisor));
    info!(addr = %listener.local_addr()?, "control socket listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "client connected");
        let supervisor = Arc::clone(&supervisor);
        let snapshots = snapshots.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(err) = handle_client(reader, writer, supervisor, snapshots).await {
                warn!(%peer, error = %err, "client connection error");
            }
            debug!(%peer, "client disconnected");
        });
    }
}

enum Incoming {
    Line(String),
    NotUtf8,
    TooLong,
}

/// Reads request lines, cutting off anything over [`MAX_MESSAGE`] bytes
/// (not counting the line terminator).
async fn read_requests<R>(reader: R, tx: mpsc::Sender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let limit = MAX_MESSAGE as u64 + 2;
        let incoming = match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) if line.trim_ascii_end().len() > MAX_MESSAGE => Incoming::TooLong,
            Ok(_) => match String::from_utf8(std::mem::take(&mut line)) {
                Ok(text) => Incoming::Line(text),
                Err(_) => Incoming::NotUtf8,
            },
            Err(err) => {
                debug!(error = %err, "read failed");
                break;
            }
        };
        let too_long = matches!(incoming, Incoming::TooLong);
        if tx.send(incoming).await.is_err() || too_long {
            break;
        }
    }
}

pub async fn handle_client<R, W>(
    reader: R,
    mut writer: W,
    supervisor: Arc<Supervisor>,
    mut snapshots: watch::Receiver<Arc<String>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (tx, mut requests) = mpsc::channel(8);
    let reader_task = tokio::spawn(read_requests(reader, tx));

    let initial = Arc::clone(&snapshots.borrow_and_update());
    write_line(&mut writer, &initial).await?;

    let result = loop {
        tokio::select! {
            incoming = requests.recv() => match incoming {
                Some(Incoming::Line(line)) => {
                    let raw = line.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    let reply = match serde_json::from_str::<ControlRequest>(raw) {
                        Ok(request) => handle_message(&supervisor, request).await,
                        Err(err) => ServerMessage::failed(format!("invalid request: {err}")),
                    };
                    if let Err(err) = write_line(&mut writer, &reply.render()).await {
                        break Err(err);
                    }
                }
                Some(Incoming::NotUtf8) => {
                    let reply = ServerMessage::failed("request is not valid UTF-8");
                    if let Err(err) = write_line(&mut writer, &reply.render()).await {
                        break Err(err);
                    }
                }
                Some(Incoming::TooLong) => {
                    let reply = ServerMessage::failed(format!("message exceeds {MAX_MESSAGE} bytes"));
                    break write_line(&mut writer, &reply.render()).await;
                }
                None => break Ok(()),
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let latest = Arc::clone(&snapshots.borrow_and_update());
                if let Err(err) = write_line(&mut writer, &latest).await {
                    break Err(err);
                }
            }
        }
    };
    reader_task.abort();
    result
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Applies one request to the supervisor and builds its reply.
pub async fn handle_message(supervisor: &Supervisor, request: ControlRequest) -> ServerMessage {
    let ControlRequest {
        command,
        workspace,
        task,
        service,
    } = request;
    debug!(?command, %workspace, %task, service, "control request");

    match command {
        ControlCommand::Start => {
            if supervisor.start_task(&workspace, &task, service) {
                ServerMessage::ok(None)
            } else {
                ServerMessage::failed(format!("task {workspace}/{task} not found"))
            }
        }
        ControlCommand::Stop => {
            if supervisor.stop_task(&workspace, &task, service) {
                ServerMessage::ok(None)
            } else {
                ServerMessage::failed(format!("task {workspace}/{task} not found"))
            }
        }
        ControlCommand::Workspace => reply_with(supervisor.workspace_snapshot(&workspace)),
        ControlCommand::Task => reply_with(supervisor.task_snapshot(&workspace, &task)),
        ControlCommand::Columns => reply_with(supervisor.evaluate_columns(&workspace, &task).await),
    }
}

fn reply_with<T: Serialize>(result: crate::error::Result<T>) -> ServerMessage {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => ServerMessage::ok(Some(data)),
            Err(err) => ServerMessage::failed(err.to_string()),
        },
        Err(err) => ServerMessage::failed(err.to_string()),
    }
}
