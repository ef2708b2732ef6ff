use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection_manager::Outbound;
use crate::api::AppState;
use crate::shared::models::{ClientMessage, SandboxError, ServerMessage};

/// Serve one watcher connection. Container events reach it through the
/// connection manager; this loop only handles what the client sends.
pub async fn run(
    state: Arc<AppState>,
    connection_id: String,
    project_id: String,
    mut stream: SplitStream<WebSocket>,
    closed: CancellationToken,
) {
    let connections = state.connections.clone();
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
                let reply = match handle_message(&state, &connection_id, &project_id, text.as_str()).await {
                    Ok(Some(reply)) => Outbound::Text(reply.to_json()),
                    Ok(None) => continue,
                    Err(e) => Outbound::Text(ServerMessage::error(e.to_string(), e.code()).to_json()),
                };
                connections.send(&connection_id, reply).await;
            }
            Ok(Message::Pong(_)) => connections.mark_alive(&connection_id).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    info!("Watcher connection {} for project {} closed", connection_id, project_id);
}

async fn handle_message(
    state: &AppState,
    connection_id: &str,
    project_id: &str,
    text: &str,
) -> Result<Option<ServerMessage>, SandboxError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| SandboxError::ConnectionProtocol(format!("malformed message: {}", e)))?;

    match message {
        ClientMessage::FileChanged { path, content } => {
            apply_file_change(state, project_id, &path, &content).await?;
            let notice = ServerMessage::FileChanged { path, content }.to_json();
            state
                .connections
                .broadcast(project_id, &notice, Some(connection_id))
                .await;
            Ok(None)
        }
        ClientMessage::FileWatch { path } => {
            debug!("Connection {} watching {}", connection_id, path);
            Ok(Some(ServerMessage::FileWatchAck { path }))
        }
        _ => Err(SandboxError::ConnectionProtocol(
            "terminal messages belong on the terminal channel".to_string(),
        )),
    }
}

/// Write client-supplied content into the running sandbox's workspace.
async fn apply_file_change(
    state: &AppState,
    project_id: &str,
    path: &str,
    content: &str,
) -> Result<(), SandboxError> {
    state
        .services
        .provisioner
        .write_workspace_file(project_id, path, content.as_bytes())
        .await
}
