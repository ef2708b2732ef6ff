use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StatsOptions,
        StopContainerOptions,
    },
    exec::{CreateExecOptions, ResizeExecOptions, StartExecResults},
    image::BuildImageOptions,
    models::{HostConfig, PortBinding, ResourcesUlimits},
    Docker,
};
use futures::StreamExt;
use hyper::{header, Body, Request, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};

use super::runtime::{
    ContainerInspect, ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest, ExecStream,
    StatsSample,
};
use crate::shared::SandboxConfig;

/// Docker Engine adapter. API calls go through bollard; interactive exec
/// attach hijacks the HTTP connection itself so the raw stream reaches the
/// demultiplexer untouched.
pub struct DockerRuntime {
    docker: Docker,
    socket_path: String,
    api_timeout: Duration,
    exec_timeout: Duration,
    build_timeout: Duration,
}

fn is_status(err: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if codes.contains(status_code)
    )
}

async fn timed<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {}s", what, limit.as_secs())),
    }
}

/// Single-entry tar holding the Dockerfile, used as the build context.
fn dockerfile_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut archive = tar::Builder::new(&mut tar_data);
        let mut header = tar::Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
        archive.finish()?;
    }
    Ok(tar_data)
}

impl DockerRuntime {
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            &config.docker.socket,
            config.docker.api_timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )
        .with_context(|| format!("Failed to connect to Docker at {}", config.docker.socket))?;
        Ok(Self {
            docker,
            socket_path: config.docker.socket.clone(),
            api_timeout: config.api_timeout(),
            exec_timeout: config.exec_timeout(),
            build_timeout: config.build_timeout(),
        })
    }

    async fn create_exec(&self, id: &str, request: &ExecRequest, tty: bool) -> Result<String> {
        let exec_config = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            user: request.user.clone(),
            working_dir: request.working_dir.clone(),
            env: (!request.env.is_empty()).then(|| request.env.clone()),
            attach_stdin: Some(tty || request.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            ..Default::default()
        };
        let exec = timed(self.api_timeout, "create exec", async {
            anyhow::Ok(self.docker.create_exec(id, exec_config).await?)
        })
        .await?;
        Ok(exec.id)
    }

    /// POST /exec/{id}/start with an upgrade request and hand back both halves
    /// of the upgraded connection.
    async fn hijack_exec(&self, exec_id: &str) -> Result<ExecStream> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to open Docker socket {}", self.socket_path))?;
        let (mut sender, conn) = hyper::client::conn::handshake(stream).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Exec attach connection closed: {}", e);
            }
        });

        let body = serde_json::json!({ "Detach": false, "Tty": true }).to_string();
        let request = Request::post(format!("/exec/{}/start", exec_id))
            .header(header::HOST, "docker")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Body::from(body))?;

        let response = sender.send_request(request).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(anyhow!(
                "Exec attach for {} was not upgraded (status {})",
                exec_id,
                response.status()
            ));
        }
        let upgraded = hyper::upgrade::on(response).await?;
        let (output, input) = tokio::io::split(upgraded);
        Ok(ExecStream {
            exec_id: exec_id.to_string(),
            output: Box::new(output),
            input: Box::new(input),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let result = timed(self.api_timeout, "inspect image", async {
            anyhow::Ok(self.docker.inspect_image(image).await)
        })
        .await?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(anyhow!("Failed to inspect image {}: {}", image, e)),
        }
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<()> {
        let tar_data = dockerfile_context(dockerfile)?;
        let build_options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!("Building sandbox image {}", image);
        let mut build_stream = self
            .docker
            .build_image(build_options, None, Some(tar_data.into()));

        let mut error_message: Option<String> = None;
        let outcome = tokio::time::timeout(self.build_timeout, async {
            while let Some(build_result) = build_stream.next().await {
                match build_result {
                    Ok(output) => {
                        if let Some(stream) = &output.stream {
                            let message = stream.trim();
                            if !message.is_empty() {
                                debug!("Build: {}", message);
                            }
                        }
                        if let Some(error) = output.error {
                            error!("Docker build error: {}", error);
                            error_message = Some(error);
                        }
                    }
                    Err(e) => {
                        error_message = Some(format!("Stream error: {}", e));
                        break;
                    }
                }
            }
        })
        .await;

        if outcome.is_err() {
            return Err(anyhow!(
                "Docker build timed out after {}s",
                self.build_timeout.as_secs()
            ));
        }
        if let Some(err_msg) = error_message {
            return Err(anyhow!("Docker build failed: {}", err_msg));
        }
        if !self.image_exists(image).await? {
            return Err(anyhow!("Docker build completed but image {} not found", image));
        }
        info!("Sandbox image {} built", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.published_ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some("0".to_string()),
                }]),
            );
        }

        let tmpfs = HashMap::from([
            ("/tmp".to_string(), "rw,size=100m".to_string()),
            ("/var/tmp".to_string(), "rw,size=100m".to_string()),
        ]);
        let ulimits = vec![
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(1024),
                hard: Some(2048),
            },
            ResourcesUlimits {
                name: Some("nproc".to_string()),
                soft: Some(256),
                hard: Some(512),
            },
            ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(100_000_000),
                hard: Some(100_000_000),
            },
        ];

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            labels: Some(spec.labels.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(crate::shared::models::constants::WORKSPACE_DIR.to_string()),
            exposed_ports: Some(exposed_ports),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    spec.workspace.display(),
                    crate::shared::models::constants::WORKSPACE_DIR
                )]),
                port_bindings: Some(port_bindings),
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                cpu_shares: Some(spec.cpu_shares),
                pids_limit: Some(spec.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(
                    ["CHOWN", "SETUID", "SETGID", "DAC_OVERRIDE"]
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                ),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                tmpfs: Some(tmpfs),
                ulimits: Some(ulimits),
                network_mode: Some("bridge".to_string()),
                dns: Some(vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let created = timed(self.api_timeout, "create container", async {
            anyhow::Ok(self.docker.create_container(Some(options), config).await?)
        })
        .await?;
        info!("Created container {} ({})", spec.name, created.id);
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let result = timed(self.api_timeout, "start container", async {
            anyhow::Ok(self.docker.start_container::<String>(id, None).await)
        })
        .await?;
        match result {
            Ok(()) => Ok(()),
            // 304: already running
            Err(e) if is_status(&e, &[304]) => Ok(()),
            Err(e) => Err(anyhow!("Failed to start container {}: {}", id, e)),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let result = timed(self.api_timeout, "stop container", async {
            anyhow::Ok(self
                .docker
                .stop_container(id, Some(StopContainerOptions { t: 10 }))
                .await)
        })
        .await?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[304, 404]) => {
                warn!("Container {} already stopped or gone", id);
                Ok(())
            }
            Err(e) => Err(anyhow!("Failed to stop container {}: {}", id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let result = timed(self.api_timeout, "remove container", async {
            anyhow::Ok(self.docker.remove_container(id, Some(options)).await)
        })
        .await?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404, 409]) => {
                warn!("Container {} already removed, treating as success", id);
                Ok(())
            }
            Err(e) => Err(anyhow!("Failed to remove container {}: {}", id, e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>> {
        let result = timed(self.api_timeout, "inspect container", async {
            anyhow::Ok(self.docker.inspect_container(id, None).await)
        })
        .await?;
        let info = match result {
            Ok(info) => info,
            Err(e) if is_status(&e, &[404]) => return Ok(None),
            Err(e) => return Err(anyhow!("Failed to inspect container {}: {}", id, e)),
        };

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let mut ports = HashMap::new();
        if let Some(map) = info.network_settings.and_then(|n| n.ports) {
            for (key, bindings) in map {
                let Some(container_port) = key
                    .strip_suffix("/tcp")
                    .and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()));
                if let Some(host_port) = host_port {
                    ports.insert(container_port, host_port);
                }
            }
        }

        Ok(Some(ContainerInspect {
            id: info.id.unwrap_or_else(|| id.to_string()),
            running,
            ports,
        }))
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput> {
        let exec_id = self.create_exec(id, &request, false).await?;
        timed(self.exec_timeout, "exec", async {
            let mut out = ExecOutput::default();
            if let StartExecResults::Attached {
                mut output,
                mut input,
            } = self.docker.start_exec(&exec_id, None).await?
            {
                if let Some(data) = &request.stdin {
                    input.write_all(data).await?;
                    input.shutdown().await?;
                }
                while let Some(frame) = output.next().await {
                    use bollard::container::LogOutput;
                    match frame? {
                        LogOutput::StdErr { message } => out.stderr.extend_from_slice(&message),
                        other => out.stdout.extend_from_slice(&other.into_bytes()),
                    }
                }
            }
            let inspect = self.docker.inspect_exec(&exec_id).await?;
            out.exit_code = inspect.exit_code.unwrap_or(0);
            anyhow::Ok(out)
        })
        .await
    }

    async fn exec_interactive(&self, id: &str, request: ExecRequest) -> Result<ExecStream> {
        let exec_id = self.create_exec(id, &request, true).await?;
        timed(self.api_timeout, "exec attach", self.hijack_exec(&exec_id)).await
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        timed(self.api_timeout, "resize exec", async {
            anyhow::Ok(self
                .docker
                .resize_exec(
                    exec_id,
                    ResizeExecOptions {
                        height: rows,
                        width: cols,
                    },
                )
                .await?)
        })
        .await
    }

    async fn stats(&self, id: &str) -> Result<StatsSample> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let stats = timed(self.api_timeout, "container stats", async {
            let mut stream = Box::pin(self.docker.stats(id, Some(options)));
            match stream.next().await {
                Some(stats) => anyhow::Ok(stats?),
                None => Err(anyhow!("No stats returned for {}", id)),
            }
        })
        .await?;

        let (rx_bytes, tx_bytes) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(StatsSample {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_total: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            rx_bytes,
            tx_bytes,
        })
    }

    async fn logs_tail(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            ..Default::default()
        };
        timed(self.api_timeout, "container logs", async {
            let mut out = Vec::new();
            let mut stream = Box::pin(self.docker.logs(id, Some(options)));
            while let Some(chunk) = stream.next().await {
                out.extend(chunk?.to_string().lines().map(str::to_string));
            }
            anyhow::Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dockerfile_context_is_single_entry_tar() {
        let data = dockerfile_context("FROM scratch\n").unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(data));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile"]);
    }

    #[test]
    fn test_is_status_matches_server_errors() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_status(&err, &[404]));
        assert!(!is_status(&err, &[304]));
    }
}
