//! One running helper process and its stdio plumbing

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::SkillError;
use crate::rpc::{RpcRequest, RpcResponse};

/// Lines buffered between the reader task and the caller
const LINE_QUEUE: usize = 64;

/// How to start the helper
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub skill: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Write half plus the reader's delivery queue
pub(crate) struct Session {
    skill: String,
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: Option<oneshot::Receiver<()>>,
}

/// The child itself, handed to the crash monitor
pub(crate) struct ChildHandle {
    pub child: Child,
    pub kill: oneshot::Receiver<()>,
    pub exited: oneshot::Sender<()>,
}

impl ChildHandle {
    /// Kill and reap a child that never got a monitor
    pub async fn reap(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Spawn the helper with piped stdio and start its reader tasks
pub(crate) fn spawn(launch: &Launch) -> Result<(Session, ChildHandle)> {
    let mut cmd = Command::new(&launch.command);
    cmd.args(&launch.args)
        .envs(&launch.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &launch.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow!("entrypoint not found: {}", launch.command)
        } else {
            anyhow!("failed to spawn {}: {}", launch.command, e)
        }
    })?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
    let stderr = child.stderr.take();
    let pid = child.id();

    // Owns stdout for this process's lifetime; the queue closes at EOF.
    // Lines are decoded lossily so stray binary output cannot stop the reader.
    let (tx, rx) = mpsc::channel(LINE_QUEUE);
    let reader_skill = launch.skill.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(skill = %reader_skill, "Failed to read process stdout: {}", e);
                    break;
                }
            }
        }
    });

    if let Some(stderr) = stderr {
        let skill = launch.skill.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
                if n == 0 {
                    break;
                }
                debug!(skill = %skill, "stderr: {}", String::from_utf8_lossy(&buf).trim_end());
                buf.clear();
            }
        });
    }

    debug!(skill = %launch.skill, pid = ?pid, command = %launch.command, "Spawned skill process");

    let (kill_tx, kill_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = oneshot::channel();
    let session = Session {
        skill: launch.skill.clone(),
        stdin,
        lines: rx,
        pid,
        kill: Some(kill_tx),
        exited: Some(exited_rx),
    };
    let handle = ChildHandle {
        child,
        kill: kill_rx,
        exited: exited_tx,
    };
    Ok((session, handle))
}

impl Session {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one request and wait up to `timeout` for the matching response
    pub async fn request(
        &mut self,
        id: i64,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let line = RpcRequest::new(id, method, params).to_line()?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write {} request", method))?;
        self.stdin.flush().await?;

        match tokio::time::timeout(timeout, self.read_response(id)).await {
            Ok(result) => result,
            Err(_) => Err(SkillError::Timeout {
                method: method.to_string(),
                timeout,
            }
            .into()),
        }
    }

    async fn read_response(&mut self, id: i64) -> Result<Value> {
        loop {
            let Some(line) = self.lines.recv().await else {
                return Err(SkillError::ProcessClosed.into());
            };
            let line = line.trim();
            if !line.starts_with('{') {
                debug!(skill = %self.skill, "Skipping non-JSON line: {}", line);
                continue;
            }

            let response: RpcResponse = serde_json::from_str(line)
                .with_context(|| format!("failed to decode response: {}", line))?;
            match response.id {
                Some(got) if got == id => return Ok(response.into_result()?),
                Some(got) => {
                    // Late reply to a call that already timed out
                    debug!(skill = %self.skill, expected = id, got, "Dropping stale response");
                }
                None => {
                    debug!(skill = %self.skill, method = ?response.method, "Ignoring notification");
                }
            }
        }
    }

    /// Kill the child and wait for the monitor to see it exit
    pub async fn terminate(mut self, grace: Duration) -> Result<()> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(exited) = self.exited.take() {
            if tokio::time::timeout(grace, exited).await.is_err() {
                return Err(anyhow!(
                    "skill '{}' process {:?} did not exit after kill",
                    self.skill,
                    self.pid
                ));
            }
        }
        // Dropping closes stdin
        Ok(())
    }
}
