use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection_manager::Outbound;
use crate::api::AppState;
use crate::controller::session_manager::SessionOutput;
use crate::shared::models::{ClientMessage, SandboxError, ServerMessage};

const PROMPT_MARKERS: [&str; 4] = ["$ ", "# ", "bash-", "developer@"];
/// Only the start of a session is searched for a prompt.
const PROMPT_SCAN_LIMIT: usize = 8 * 1024;

/// Decides when the ready banner goes out: on the first prompt-looking
/// output, or when the fallback fires. Never more than once.
#[derive(Debug, Default)]
pub struct BannerGate {
    sent: bool,
    scanned: usize,
}

impl BannerGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Returns true when this chunk should release the banner.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.sent || self.scanned >= PROMPT_SCAN_LIMIT {
            return false;
        }
        self.scanned += chunk.len();
        let text = String::from_utf8_lossy(chunk);
        if PROMPT_MARKERS.iter().any(|marker| text.contains(marker)) {
            self.sent = true;
            return true;
        }
        false
    }

    pub fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.sent, true)
    }
}

pub fn banner(project_id: &str) -> String {
    format!(
        "\r\n✅ Terminal session ready!\r\nProject: {}\r\nType commands below:\r\n\r\n",
        project_id
    )
}

fn output_frame(session_id: &str, data: &[u8]) -> Outbound {
    Outbound::Text(
        ServerMessage::TerminalOutput {
            session_id: session_id.to_string(),
            data: BASE64.encode(data),
        }
        .to_json(),
    )
}

fn error_frame(error: &SandboxError) -> Outbound {
    Outbound::Text(ServerMessage::error(error.to_string(), error.code()).to_json())
}

/// Serve one terminal connection: open a shell, pump its output, apply
/// client input until either side goes away.
pub async fn run(
    state: Arc<AppState>,
    connection_id: String,
    project_id: String,
    mut stream: SplitStream<WebSocket>,
    closed: CancellationToken,
) {
    let connections = state.connections.clone();
    let (session, output) = match state.services.sessions.create_session(&project_id).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Terminal for project {} refused: {}", project_id, e);
            connections.send(&connection_id, error_frame(&e)).await;
            connections
                .send(
                    &connection_id,
                    Outbound::Close {
                        code: 1011,
                        reason: e.code().to_string(),
                    },
                )
                .await;
            return;
        }
    };
    let session_id = session.session_id.clone();

    connections
        .send(
            &connection_id,
            Outbound::Text(
                ServerMessage::SessionCreated {
                    session_id: session_id.clone(),
                    project_id: project_id.clone(),
                }
                .to_json(),
            ),
        )
        .await;

    let fallback = Duration::from_millis(state.services.config.socket.banner_fallback_ms);
    let pump = tokio::spawn(pump_output(
        state.clone(),
        connection_id.clone(),
        project_id.clone(),
        session_id.clone(),
        output,
        fallback,
    ));

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = stream.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(Message::Text(text)) => {
                let reply = match handle_message(&state, &project_id, &session_id, text.as_str()).await {
                    Ok(Some(reply)) => Outbound::Text(reply.to_json()),
                    Ok(None) => continue,
                    Err(e) => error_frame(&e),
                };
                connections.send(&connection_id, reply).await;
            }
            Ok(Message::Pong(_)) => connections.mark_alive(&connection_id).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    pump.abort();
    state
        .services
        .sessions
        .close_session(&project_id, &session_id)
        .await;
    info!(
        "Terminal connection {} closed, session {} released",
        connection_id, session_id
    );
}

async fn pump_output(
    state: Arc<AppState>,
    connection_id: String,
    project_id: String,
    session_id: String,
    mut output: SessionOutput,
    fallback: Duration,
) {
    let connections = &state.connections;
    let mut gate = BannerGate::new();
    let fallback = tokio::time::sleep(fallback);
    tokio::pin!(fallback);

    // False once the connection is gone; nothing is left to write to
    let delivered = loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(Ok(bytes)) => {
                    if !connections.send(&connection_id, output_frame(&session_id, &bytes)).await {
                        break false;
                    }
                    if gate.observe(&bytes)
                        && !connections
                            .send(&connection_id, output_frame(&session_id, banner(&project_id).as_bytes()))
                            .await
                    {
                        break false;
                    }
                }
                Some(Err(e)) => {
                    connections.send(&connection_id, error_frame(&e)).await;
                    break true;
                }
                None => break true,
            },
            _ = &mut fallback, if !gate.is_sent() => {
                if gate.fire()
                    && !connections
                        .send(&connection_id, output_frame(&session_id, banner(&project_id).as_bytes()))
                        .await
                {
                    break false;
                }
            }
        }
    };

    if delivered {
        connections
            .send(
                &connection_id,
                Outbound::Close {
                    code: 1000,
                    reason: "shell exited".to_string(),
                },
            )
            .await;
    }
}

async fn handle_message(
    state: &AppState,
    project_id: &str,
    session_id: &str,
    text: &str,
) -> Result<Option<ServerMessage>, SandboxError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| SandboxError::ConnectionProtocol(format!("malformed message: {}", e)))?;
    let sessions = &state.services.sessions;

    match message {
        ClientMessage::TerminalInput {
            session_id: target,
            data,
        } => {
            ensure_own_session(session_id, &target)?;
            let bytes = BASE64
                .decode(data.as_bytes())
                .map_err(|e| SandboxError::ConnectionProtocol(format!("invalid base64: {}", e)))?;
            sessions.write(project_id, session_id, &bytes).await?;
            Ok(None)
        }
        ClientMessage::TerminalResize {
            session_id: target,
            cols,
            rows,
        } => {
            ensure_own_session(session_id, &target)?;
            sessions.resize(project_id, session_id, cols, rows).await?;
            Ok(None)
        }
        ClientMessage::SessionPing { session_id: target } => {
            if let Some(target) = &target {
                ensure_own_session(session_id, target)?;
            }
            state.services.registry.touch_session(project_id, session_id).await;
            Ok(Some(ServerMessage::SessionPong {
                session_id: target,
                timestamp: chrono::Utc::now().timestamp_millis(),
            }))
        }
        ClientMessage::FileChanged { .. } | ClientMessage::FileWatch { .. } => Err(
            SandboxError::ConnectionProtocol("file messages belong on the watcher channel".to_string()),
        ),
    }
}

fn ensure_own_session(own: &str, target: &str) -> Result<(), SandboxError> {
    if own == target {
        Ok(())
    } else {
        Err(SandboxError::NotFound(format!("session {}", target)))
    }
}
