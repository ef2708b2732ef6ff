use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::demux::StreamDemuxer;
use super::provisioner::SandboxProvisioner;
use super::registry::ContainerRegistry;
use super::runtime::{ContainerRuntime, ExecRequest};
use crate::shared::models::constants::{SANDBOX_HOME, SANDBOX_USER, WORKSPACE_DIR};
use crate::shared::models::{SandboxError, SandboxResult};

const OUTPUT_BUFFER: usize = 256;

/// One interactive shell inside a sandbox.
pub struct TerminalSession {
    pub session_id: String,
    pub project_id: String,
    pub container_id: String,
    pub exec_id: String,
    pub created_at: DateTime<Utc>,
    input: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pump: Mutex<Option<AbortHandle>>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl TerminalSession {
    pub fn new(
        session_id: String,
        project_id: String,
        container_id: String,
        exec_id: String,
        input: Box<dyn AsyncWrite + Send + Unpin>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            session_id,
            project_id,
            container_id,
            exec_id,
            created_at: Utc::now(),
            input: Mutex::new(Some(input)),
            pump: Mutex::new(None),
            runtime,
        }
    }

    /// Bytes reach the shell in call order; the input lock serializes writers.
    pub async fn write(&self, data: &[u8]) -> SandboxResult<()> {
        let mut input = self.input.lock().await;
        let writer = input
            .as_mut()
            .ok_or_else(|| SandboxError::SessionStream(format!("session {} is closed", self.session_id)))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| SandboxError::SessionStream(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SandboxError::SessionStream(e.to_string()))
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> SandboxResult<()> {
        self.runtime.resize_exec(&self.exec_id, cols, rows).await?;
        Ok(())
    }

    pub async fn kill(&self) {
        if let Some(mut writer) = self.input.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        debug!("Session {} killed", self.session_id);
    }

    pub async fn is_open(&self) -> bool {
        self.input.lock().await.is_some()
    }

    async fn set_pump(&self, handle: AbortHandle) {
        *self.pump.lock().await = Some(handle);
    }
}

/// Decoded shell output. The channel closes when the shell exits.
pub type SessionOutput = mpsc::Receiver<SandboxResult<Bytes>>;

pub struct TerminalSessionManager {
    provisioner: Arc<SandboxProvisioner>,
    registry: Arc<ContainerRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    max_sessions: usize,
}

impl TerminalSessionManager {
    pub fn new(
        provisioner: Arc<SandboxProvisioner>,
        registry: Arc<ContainerRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        max_sessions: usize,
    ) -> Self {
        Self {
            provisioner,
            registry,
            runtime,
            max_sessions,
        }
    }

    fn shell_request(project_id: &str) -> ExecRequest {
        ExecRequest::new(["/bin/bash", "--login", "-i"])
            .user(SANDBOX_USER)
            .working_dir(WORKSPACE_DIR)
            .env("TERM=xterm-256color")
            .env("COLORTERM=truecolor")
            .env(format!("HOME={}", SANDBOX_HOME))
            .env(format!("USER={}", SANDBOX_USER))
            .env(format!("PROJECT_ID={}", project_id))
    }

    pub async fn create_session(
        &self,
        project_id: &str,
    ) -> SandboxResult<(Arc<TerminalSession>, SessionOutput)> {
        let container = self.provisioner.create_or_reuse(project_id).await?;
        if container.sessions.len() >= self.max_sessions {
            return Err(SandboxError::Capacity(format!(
                "Maximum sessions reached ({})",
                self.max_sessions
            )));
        }

        let stream = self
            .runtime
            .exec_interactive(&container.container_id, Self::shell_request(project_id))
            .await
            .map_err(|e| SandboxError::SessionStream(format!("failed to open shell: {}", e)))?;

        let session = Arc::new(TerminalSession::new(
            Uuid::new_v4().to_string(),
            project_id.to_string(),
            container.container_id.clone(),
            stream.exec_id,
            stream.input,
            self.runtime.clone(),
        ));

        // The cap is re-checked under the registry lock
        if let Err(e) = self
            .registry
            .add_session(project_id, session.clone(), self.max_sessions)
            .await
        {
            session.kill().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let registry = self.registry.clone();
        let pump_session = session.clone();
        let output = stream.output;
        let pump = tokio::spawn(async move {
            let mut frames = FramedRead::new(output, StreamDemuxer::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    // Output alone does not count as activity; only the client does
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Session {} stream error: {}", pump_session.session_id, e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
            registry
                .remove_session(&pump_session.project_id, &pump_session.session_id)
                .await;
            info!(
                "Session {} ended for project {}",
                pump_session.session_id, pump_session.project_id
            );
        });
        session.set_pump(pump.abort_handle()).await;

        info!(
            "Created terminal session {} for project {}",
            session.session_id, project_id
        );
        Ok((session, rx))
    }

    pub async fn write(&self, project_id: &str, session_id: &str, data: &[u8]) -> SandboxResult<()> {
        let session = self
            .registry
            .session(project_id, session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("session {}", session_id)))?;
        session.write(data).await?;
        self.registry.touch_session(project_id, session_id).await;
        Ok(())
    }

    pub async fn resize(&self, project_id: &str, session_id: &str, cols: u16, rows: u16) -> SandboxResult<()> {
        let session = self
            .registry
            .session(project_id, session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("session {}", session_id)))?;
        session.resize(cols, rows).await?;
        self.registry.touch_session(project_id, session_id).await;
        Ok(())
    }

    /// Deregister and tear down a session. Unknown ids are a no-op.
    pub async fn close_session(&self, project_id: &str, session_id: &str) {
        if let Some(session) = self.registry.remove_session(project_id, session_id).await {
            session.kill().await;
            info!("Closed session {} for project {}", session_id, project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{harness, Harness};
    use std::time::Duration;

    async fn collect_until(output: &mut SessionOutput, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(2), output.recv())
                .await
                .expect("timed out waiting for output")
                .expect("stream closed")
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    #[tokio::test]
    async fn test_shell_round_trip_through_demuxer() {
        let h = harness(|_| {}).await;
        let (session, mut output) = h.sessions.create_session("p1").await.unwrap();

        collect_until(&mut output, "$ ").await;
        h.sessions
            .write("p1", &session.session_id, b"echo hi\n")
            .await
            .unwrap();
        let seen = collect_until(&mut output, "hi").await;
        assert!(seen.contains("hi"));
        assert_eq!(h.registry.session_count("p1").await, 1);
    }

    #[tokio::test]
    async fn test_session_cap() {
        let h = harness(|c| c.limits.max_sessions_per_container = 1).await;
        let _first = h.sessions.create_session("p1").await.unwrap();
        let Err(err) = h.sessions.create_session("p1").await else {
            panic!("session opened past the cap");
        };
        assert_eq!(err.code(), "capacity_exceeded");
    }

    async fn session_activity(h: &Harness, session_id: &str) -> DateTime<Utc> {
        h.registry.get("p1").await.unwrap().sessions[session_id].last_activity
    }

    #[tokio::test]
    async fn test_only_client_traffic_counts_as_activity() {
        let h = harness(|_| {}).await;
        let (session, mut output) = h.sessions.create_session("p1").await.unwrap();
        let opened = session_activity(&h, &session.session_id).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        collect_until(&mut output, "$ ").await;
        assert_eq!(session_activity(&h, &session.session_id).await, opened);

        h.sessions.resize("p1", &session.session_id, 120, 40).await.unwrap();
        assert!(session_activity(&h, &session.session_id).await > opened);
    }

    #[tokio::test]
    async fn test_shell_exit_deregisters_session() {
        let h = harness(|_| {}).await;
        let (session, mut output) = h.sessions.create_session("p1").await.unwrap();
        h.sessions
            .write("p1", &session.session_id, b"exit\n")
            .await
            .unwrap();

        while output.recv().await.is_some() {}
        // The pump removes the session after the stream ends
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.registry.session_count("p1").await, 0);
    }

    #[tokio::test]
    async fn test_close_session_kills_input() {
        let h = harness(|_| {}).await;
        let (session, _output) = h.sessions.create_session("p1").await.unwrap();
        h.sessions.close_session("p1", &session.session_id).await;

        assert!(!session.is_open().await);
        assert_eq!(h.registry.session_count("p1").await, 0);
        assert!(h
            .sessions
            .write("p1", &session.session_id, b"ls\n")
            .await
            .is_err());
    }
}
