//! One backend child process and its line-delimited JSON channel.
//!
//! ```text
//!  supervisor ── bind 127.0.0.1:0 ── spawn(MODELCAST_CHANNEL=addr)
//!                     │                    │
//!                     ◂──── connect ───────┘
//!                     ◂──── {"type":"ready"}
//!                     ◂──── inner messages, one per line
//!                     ────▸ {"message":…, "meta":…}, one per line
//! ```
//!
//! Everything that happens to the child is reported as a [`ChildEvent`]
//! tagged with the generation it was spawned under, so the supervisor can
//! ignore stragglers from a previous process.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::SupervisorError;
use crate::config::SupervisorConfig;
use crate::protocol::{InnerMessage, ProtocolError};

/// Lines still buffered in the channel are read for this long after exit.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub(crate) enum ChildEvent {
    Ready {
        generation: u64,
    },
    HandshakeFailed {
        generation: u64,
        reason: String,
    },
    Message {
        generation: u64,
        message: InnerMessage,
    },
    Malformed {
        generation: u64,
        line: String,
        error: ProtocolError,
    },
    Exited {
        generation: u64,
        code: Option<i32>,
    },
}

impl ChildEvent {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            ChildEvent::Ready { generation }
            | ChildEvent::HandshakeFailed { generation, .. }
            | ChildEvent::Message { generation, .. }
            | ChildEvent::Malformed { generation, .. }
            | ChildEvent::Exited { generation, .. } => *generation,
        }
    }
}

/// Supervisor-side handle on a running child. Dropping it kills the child.
pub(crate) struct ChildHandle {
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl ChildHandle {
    /// Queue one line for the child.
    pub(crate) fn send_line(&self, line: String) -> bool {
        self.outbound.send(line).is_ok()
    }

    pub(crate) fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

pub(crate) async fn spawn_child(
    config: &SupervisorConfig,
    generation: u64,
    events: mpsc::UnboundedSender<ChildEvent>,
) -> Result<ChildHandle, SupervisorError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| SupervisorError::Channel(e.to_string()))?;
    let channel_addr = listener
        .local_addr()
        .map_err(|e| SupervisorError::Channel(e.to_string()))?;

    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("MODELCAST_CHANNEL", channel_addr.to_string())
        .env(
            "MODELCAST_LOG_PASSTHROUGH",
            if config.log_passthrough { "1" } else { "0" },
        )
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(root) = &config.runtime_root {
        command.env("MODELCAST_RUNTIME_ROOT", root);
    }

    let child = command.spawn().map_err(|e| SupervisorError::Spawn {
        command: config.command.display().to_string(),
        message: e.to_string(),
    })?;
    let pid = child.id();
    log::info!(
        "Spawned backend {} (pid {}, generation {generation})",
        config.command.display(),
        pid.map_or_else(|| "?".to_string(), |p| p.to_string())
    );

    let (kill, kill_rx) = oneshot::channel();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_child(
        child,
        listener,
        config.ready_timeout,
        generation,
        events,
        kill_rx,
        outbound_rx,
    ));

    Ok(ChildHandle {
        generation,
        pid,
        kill: Some(kill),
        outbound,
    })
}

async fn run_child(
    mut child: Child,
    listener: TcpListener,
    ready_timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<ChildEvent>,
    mut kill_rx: oneshot::Receiver<()>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let channel = drive_channel(listener, ready_timeout, generation, events.clone(), outbound_rx);
    tokio::pin!(channel);
    let mut channel_done = false;
    let mut kill_requested = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                if let Err(e) = child.start_kill() {
                    log::warn!("Failed to kill backend generation {generation}: {e}");
                }
            }
            _ = &mut channel, if !channel_done => channel_done = true,
        }
    };

    if !channel_done {
        let _ = tokio::time::timeout(DRAIN_AFTER_EXIT, &mut channel).await;
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("Failed to wait for backend generation {generation}: {e}");
            None
        }
    };
    let _ = events.send(ChildEvent::Exited { generation, code });
}

async fn drive_channel(
    listener: TcpListener,
    ready_timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<ChildEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let outcome = match tokio::time::timeout(ready_timeout, handshake(listener)).await {
        Ok(result) => result,
        Err(_) => Err(format!("no ready message within {ready_timeout:?}")),
    };
    let (mut lines, mut write) = match outcome {
        Ok(channel) => channel,
        Err(reason) => {
            let _ = events.send(ChildEvent::HandshakeFailed { generation, reason });
            return;
        }
    };
    let _ = events.send(ChildEvent::Ready { generation });

    let writer = async move {
        while let Some(mut line) = outbound_rx.recv().await {
            line.push('\n');
            if let Err(e) = write.write_all(line.as_bytes()).await {
                log::warn!("Backend channel write failed: {e}");
                break;
            }
        }
    };

    let reader = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let event = match parse_line(&line) {
                        Ok(message) => ChildEvent::Message {
                            generation,
                            message,
                        },
                        Err(error) => ChildEvent::Malformed {
                            generation,
                            line,
                            error,
                        },
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Backend channel read failed: {e}");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

/// Accept the child's connection and check that its first line is `ready`.
async fn handshake(
    listener: TcpListener,
) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf), String> {
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| format!("channel accept failed: {e}"))?;
    drop(listener);

    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let first = lines
        .next_line()
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "channel closed before ready".to_string())?;
    match parse_line(&first) {
        Ok(InnerMessage::Ready) => Ok((lines, write)),
        _ => Err(format!("expected ready, got {first}")),
    }
}

fn parse_line(line: &str) -> Result<InnerMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    InnerMessage::from_value(&value)
}
