pub mod connection_manager;
pub mod terminal;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::api::AppState;
use crate::shared::models::constants::CLOSE_POLICY_VIOLATION;
use crate::shared::models::validate_project_id;
use connection_manager::{ChannelKind, Outbound, Registration};

/// How long queued frames may take to flush once a connection is done.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
}

fn resolve_channel(query: &ChannelQuery) -> Result<(ChannelKind, String), String> {
    let project_id = query
        .project_id
        .as_deref()
        .ok_or_else(|| "projectId is required".to_string())?;
    validate_project_id(project_id).map_err(|e| e.to_string())?;
    let kind = query
        .kind
        .as_deref()
        .and_then(ChannelKind::parse)
        .ok_or_else(|| format!("unknown channel type {:?}", query.kind))?;
    Ok((kind, project_id.to_string()))
}

/// `GET /ws?type=terminal|watcher&projectId=...`. Bad declarations are
/// accepted and then closed with a policy-violation code.
pub async fn socket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChannelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let channel = resolve_channel(&query);
    ws.on_upgrade(move |socket| async move {
        match channel {
            Ok((kind, project_id)) => serve(state, socket, kind, project_id).await,
            Err(reason) => reject(socket, reason).await,
        }
    })
}

async fn reject(mut socket: WebSocket, reason: String) {
    warn!("Rejecting socket connection: {}", reason);
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

async fn serve(state: Arc<AppState>, socket: WebSocket, kind: ChannelKind, project_id: String) {
    let Registration {
        connection_id,
        mut outbound,
        closed,
    } = state.connections.register(&project_id, kind).await;
    let (mut sink, stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, closing) = match frame {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Ping => (Message::Ping(Bytes::new()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    match kind {
        ChannelKind::Terminal => {
            terminal::run(state.clone(), connection_id.clone(), project_id, stream, closed).await
        }
        ChannelKind::Watcher => {
            watcher::run(state.clone(), connection_id.clone(), project_id, stream, closed).await
        }
    }

    state.connections.deregister(&connection_id).await;
    // A peer that stopped reading can stall the sink indefinitely
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(kind: Option<&str>, project_id: Option<&str>) -> ChannelQuery {
        ChannelQuery {
            kind: kind.map(str::to_string),
            project_id: project_id.map(str::to_string),
        }
    }

    #[test]
    fn test_channel_declaration() {
        assert_eq!(
            resolve_channel(&query(Some("terminal"), Some("p1"))),
            Ok((ChannelKind::Terminal, "p1".to_string()))
        );
        assert!(resolve_channel(&query(Some("watcher"), None)).is_err());
        assert!(resolve_channel(&query(Some("shell"), Some("p1"))).is_err());
        assert!(resolve_channel(&query(None, Some("p1"))).is_err());
        assert!(resolve_channel(&query(Some("terminal"), Some("bad/id"))).is_err());
    }
}
