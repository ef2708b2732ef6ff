use serde::{Deserialize, Serialize};

/// Frames a browser client may send on either channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "terminal:input", rename_all = "camelCase")]
    TerminalInput { session_id: String, data: String },
    #[serde(rename = "terminal:resize", rename_all = "camelCase")]
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "session:ping", rename_all = "camelCase")]
    SessionPing {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "file:changed")]
    FileChanged { path: String, content: String },
    #[serde(rename = "file:watch")]
    FileWatch { path: String },
}

/// Frames the server sends to a single connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session:created", rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        project_id: String,
    },
    #[serde(rename = "terminal:output", rename_all = "camelCase")]
    TerminalOutput { session_id: String, data: String },
    #[serde(rename = "session:pong", rename_all = "camelCase")]
    SessionPong {
        session_id: Option<String>,
        timestamp: i64,
    },
    #[serde(rename = "file:changed")]
    FileChanged { path: String, content: String },
    #[serde(rename = "file:watch:ack")]
    FileWatchAck { path: String },
    #[serde(rename = "error")]
    Error { message: String, code: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"serialization failed","code":"internal"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_terminal_input() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal:input","sessionId":"s1","data":"aGk="}"#)
                .unwrap();
        match msg {
            ClientMessage::TerminalInput { session_id, data } => {
                assert_eq!(session_id, "s1");
                assert_eq!(data, "aGk=");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_resize_requires_dimensions() {
        let result = serde_json::from_str::<ClientMessage>(
            r#"{"type":"terminal:resize","sessionId":"s1","cols":120}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_error_envelope_shape() {
        let json = ServerMessage::error("Maximum sessions reached", "capacity_exceeded").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "capacity_exceeded");
    }
}
