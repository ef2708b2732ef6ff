//! In-process doubles for the container runtime and the project store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::registry::SandboxContainer;
use super::runtime::{
    ContainerInspect, ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest, ExecStream,
    StatsSample,
};
use super::session_manager::TerminalSession;
use super::workspace::WRITE_SCRIPT;
use super::SandboxServices;
use crate::shared::models::{ContainerState, EntryKind, SandboxError, SandboxResult};
use crate::shared::store::{ProjectStore, TreeNode};
use crate::shared::SandboxConfig;

pub const FAKE_PROMPT: &str = "developer@sandbox:/workspace$ ";

fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Line-oriented stand-in for bash. Output is multiplexed the way a non-TTY
/// exec attach delivers it.
async fn fake_shell(input: DuplexStream, mut output: DuplexStream) {
    let mut lines = BufReader::new(input).lines();
    if output.write_all(&frame(1, FAKE_PROMPT.as_bytes())).await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim();
        if command == "exit" {
            break;
        }
        let mut reply = frame(1, format!("{}\r\n", command).as_bytes());
        if let Some(text) = command.strip_prefix("echo ") {
            reply.extend(frame(1, format!("{}\r\n", text).as_bytes()));
        } else if !command.is_empty() {
            reply.extend(frame(
                2,
                format!("bash: {}: command not found\r\n", command).as_bytes(),
            ));
        }
        reply.extend(frame(1, FAKE_PROMPT.as_bytes()));
        if output.write_all(&reply).await.is_err() {
            break;
        }
    }
}

struct FakeContainer {
    name: String,
    running: bool,
    ports: HashMap<u16, u16>,
    listening: BTreeSet<u16>,
    find_output: String,
    ps_output: String,
    files: BTreeMap<String, Vec<u8>>,
}

struct FakeState {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    listen_tools: Vec<String>,
    next_id: usize,
    create_count: usize,
    build_count: usize,
    killed: Vec<u32>,
    resizes: Vec<(String, u16, u16)>,
    fail_starts: bool,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
    create_delay: Duration,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                images: HashSet::new(),
                containers: HashMap::new(),
                listen_tools: vec!["netstat".to_string()],
                next_id: 1,
                create_count: 0,
                build_count: 0,
                killed: Vec::new(),
                resizes: Vec::new(),
                fail_starts: false,
            }),
            create_delay: Duration::from_millis(10),
        }
    }

    fn resolve(state: &FakeState, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn with_container<T>(&self, id: &str, f: impl FnOnce(&mut FakeContainer) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let key = Self::resolve(&state, id)?;
        state.containers.get_mut(&key).map(f)
    }

    fn insert_container(&self, name: &str, ports: &[u16]) -> String {
        let mut state = self.state.lock().unwrap();
        let n = state.next_id;
        state.next_id += 1;
        let id = format!("fake{:04}", n);
        let ports = ports
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, 40000 + (n as u16) * 20 + i as u16))
            .collect();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                running: false,
                ports,
                listening: BTreeSet::new(),
                find_output: String::new(),
                ps_output: String::new(),
                files: BTreeMap::new(),
            },
        );
        id
    }

    pub async fn add_running_container(&self, name: &str) -> String {
        let id = self.insert_container(name, &[22, 3000, 8080]);
        self.set_running(&id, true);
        id
    }

    pub fn set_running(&self, id: &str, running: bool) {
        self.with_container(id, |c| c.running = running);
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.with_container(id, |c| c.running).unwrap_or(false)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.with_container(id, |_| ()).is_some()
    }

    pub fn forget_container(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn set_listen_tools(&self, tools: &[&str]) {
        self.state.lock().unwrap().listen_tools = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_listening(&self, id: &str, ports: &[u16]) {
        self.with_container(id, |c| c.listening = ports.iter().copied().collect());
    }

    pub fn set_find_output(&self, id: &str, output: &str) {
        self.with_container(id, |c| c.find_output = output.to_string());
    }

    pub fn set_ps_output(&self, id: &str, output: &str) {
        self.with_container(id, |c| c.ps_output = output.to_string());
    }

    /// Place a file inside the container's own filesystem.
    pub fn put_file(&self, id: &str, path: &str, content: &[u8]) {
        self.with_container(id, |c| c.files.insert(path.to_string(), content.to_vec()));
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.with_container(id, |c| c.files.get(path).cloned()).flatten()
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_starts = fail;
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().unwrap().create_count
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().unwrap().build_count
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.state.lock().unwrap().resizes.clone()
    }

    fn run_command(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput> {
        let cmd = request.cmd.as_slice();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let key = Self::resolve(state, id).ok_or_else(|| anyhow!("no such container {}", id))?;
        let tools = state.listen_tools.clone();

        if let [_, _, script, _, path] = cmd {
            if script == WRITE_SCRIPT {
                let container = state
                    .containers
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("no such container {}", id))?;
                let content = request.stdin.clone().unwrap_or_default();
                container.files.insert(path.clone(), content);
                return Ok(ExecOutput::default());
            }
        }

        let container = state
            .containers
            .get(&key)
            .ok_or_else(|| anyhow!("no such container {}", id))?;
        if !container.running {
            return Err(anyhow!("container {} is not running", id));
        }

        let script = match cmd {
            [sh, flag, script] if sh == "sh" && flag == "-c" => script.clone(),
            _ => cmd.join(" "),
        };
        let ok = |stdout: String| ExecOutput {
            exit_code: 0,
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
        };
        let missing = ExecOutput {
            exit_code: 127,
            stdout: Vec::new(),
            stderr: b"command not found".to_vec(),
        };

        let tool = script.split_whitespace().next().unwrap_or_default().to_string();
        let output = match tool.as_str() {
            "netstat" | "ss" | "lsof" if !tools.contains(&tool) => missing,
            "netstat" => ok(container
                .listening
                .iter()
                .map(|p| format!("tcp        0      0 0.0.0.0:{}            0.0.0.0:*               LISTEN\n", p))
                .collect()),
            "ss" => ok(container
                .listening
                .iter()
                .map(|p| format!("LISTEN 0      511          0.0.0.0:{}        0.0.0.0:*\n", p))
                .collect()),
            "lsof" => ok(container
                .listening
                .iter()
                .map(|p| format!("node 41 developer 20u IPv4 0x1 0t0 TCP *:{} (LISTEN)\n", p))
                .collect()),
            "cat" => match cmd.last().and_then(|path| container.files.get(path)) {
                Some(content) => ExecOutput {
                    exit_code: 0,
                    stdout: content.clone(),
                    stderr: Vec::new(),
                },
                None => ExecOutput {
                    exit_code: 1,
                    stdout: Vec::new(),
                    stderr: b"cat: No such file or directory".to_vec(),
                },
            },
            "find" => ok(container.find_output.clone()),
            "ps" => ok(container.ps_output.clone()),
            "kill" => {
                let pid = cmd.last().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
                let known = container
                    .ps_output
                    .lines()
                    .skip(1)
                    .filter_map(|l| l.split_whitespace().nth(1))
                    .any(|p| p == pid.to_string());
                if known {
                    state.killed.push(pid);
                    ok(String::new())
                } else {
                    ExecOutput {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: format!("kill: ({}) - No such process", pid).into_bytes(),
                    }
                }
            }
            _ => ok(String::new()),
        };
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn build_image(&self, image: &str, _dockerfile: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.build_count += 1;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        tokio::time::sleep(self.create_delay).await;
        {
            let mut state = self.state.lock().unwrap();
            if Self::resolve(&state, &spec.name).is_some() {
                return Err(anyhow!("conflict: name {} in use", spec.name));
            }
            state.create_count += 1;
        }
        Ok(self.insert_container(&spec.name, &spec.published_ports))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_starts {
            return Err(anyhow!("container {} failed to start", id));
        }
        self.with_container(id, |c| c.running = true)
            .ok_or_else(|| anyhow!("no such container {}", id))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.set_running(id, false);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = Self::resolve(&state, id) {
            state.containers.remove(&key);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>> {
        let state = self.state.lock().unwrap();
        Ok(Self::resolve(&state, id).and_then(|key| {
            state.containers.get(&key).map(|c| ContainerInspect {
                id: key.clone(),
                running: c.running,
                ports: c.ports.clone(),
            })
        }))
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput> {
        self.run_command(id, &request)
    }

    async fn exec_interactive(&self, id: &str, _request: ExecRequest) -> Result<ExecStream> {
        let exec_id = {
            let mut state = self.state.lock().unwrap();
            let key = Self::resolve(&state, id).ok_or_else(|| anyhow!("no such container {}", id))?;
            if !state.containers.get(&key).map(|c| c.running).unwrap_or(false) {
                return Err(anyhow!("container {} is not running", id));
            }
            state.next_id += 1;
            format!("exec{:04}", state.next_id)
        };
        let (client_in, shell_in) = tokio::io::duplex(4096);
        let (client_out, shell_out) = tokio::io::duplex(4096);
        tokio::spawn(fake_shell(shell_in, shell_out));
        Ok(ExecStream {
            exec_id,
            output: Box::new(client_out),
            input: Box::new(client_in),
        })
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .resizes
            .push((exec_id.to_string(), cols, rows));
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<StatsSample> {
        if !self.exists(id) {
            return Err(anyhow!("no such container {}", id));
        }
        Ok(StatsSample {
            cpu_total: 200,
            precpu_total: 100,
            system_total: 2000,
            presystem_total: 1000,
            online_cpus: 1,
            memory_usage: 64 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
            rx_bytes: 1024,
            tx_bytes: 512,
        })
    }

    async fn logs_tail(&self, _id: &str, _lines: usize) -> Result<Vec<String>> {
        Ok(vec!["Starting SSH daemon...".to_string()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Read(String),
    Write(String),
    CreateFolder(String),
    Delete(String),
    ListTree,
}

#[derive(Default)]
struct StoreState {
    files: BTreeMap<(String, String), Vec<u8>>,
    folders: BTreeSet<(String, String)>,
    calls: Vec<StoreCall>,
    fail_writes: bool,
}

/// Project store backed by maps, recording every call it receives.
#[derive(Default)]
pub struct MemoryProjectStore {
    state: Mutex<StoreState>,
}

fn insert_node(nodes: &mut Vec<TreeNode>, parts: &[&str], prefix: &str, kind: EntryKind, size: Option<u64>) {
    let Some((first, rest)) = parts.split_first() else {
        return;
    };
    let path = if prefix.is_empty() {
        first.to_string()
    } else {
        format!("{}/{}", prefix, first)
    };
    let index = match nodes.iter().position(|n| n.name == *first) {
        Some(i) => i,
        None => {
            let leaf = rest.is_empty();
            nodes.push(TreeNode {
                name: first.to_string(),
                path: path.clone(),
                kind: if leaf { kind } else { EntryKind::Folder },
                children: Vec::new(),
                size: if leaf { size } else { None },
            });
            nodes.len() - 1
        }
    };
    insert_node(&mut nodes[index].children, rest, &path, kind, size);
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn file(&self, project_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(project_id.to_string(), path.to_string()))
            .cloned()
    }

    pub fn has_folder(&self, project_id: &str, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .folders
            .contains(&(project_id.to_string(), path.to_string()))
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn read(&self, project_id: &str, path: &str) -> SandboxResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Read(path.to_string()));
        state
            .files
            .get(&(project_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn write(&self, project_id: &str, path: &str, content: &[u8]) -> SandboxResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Write(path.to_string()));
        if state.fail_writes {
            return Err(SandboxError::Transport("store unavailable".to_string()));
        }
        state
            .files
            .insert((project_id.to_string(), path.to_string()), content.to_vec());
        Ok(())
    }

    async fn create_folder(&self, project_id: &str, path: &str) -> SandboxResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::CreateFolder(path.to_string()));
        state
            .folders
            .insert((project_id.to_string(), path.to_string()));
        Ok(())
    }

    async fn delete(&self, project_id: &str, path: &str) -> SandboxResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Delete(path.to_string()));
        let nested = format!("{}/", path);
        state
            .files
            .retain(|(p, f), _| p != project_id || (f != path && !f.starts_with(&nested)));
        state
            .folders
            .retain(|(p, f)| p != project_id || (f != path && !f.starts_with(&nested)));
        Ok(())
    }

    async fn list_tree(&self, project_id: &str) -> SandboxResult<Vec<TreeNode>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::ListTree);
        let mut roots = Vec::new();
        for (_, folder) in state.folders.iter().filter(|(p, _)| p == project_id) {
            let parts: Vec<&str> = folder.split('/').collect();
            insert_node(&mut roots, &parts, "", EntryKind::Folder, None);
        }
        for ((_, file), content) in state.files.iter().filter(|((p, _), _)| p == project_id) {
            let parts: Vec<&str> = file.split('/').collect();
            insert_node(&mut roots, &parts, "", EntryKind::File, Some(content.len() as u64));
        }
        Ok(roots)
    }
}

pub fn container_record(project_id: &str, container_id: &str) -> SandboxContainer {
    let now = chrono::Utc::now();
    SandboxContainer {
        project_id: project_id.to_string(),
        container_id: container_id.to_string(),
        name: format!("sandbox-{}", project_id),
        state: ContainerState::Running,
        created_at: now,
        last_activity: now,
        workspace: std::env::temp_dir().join(format!("sandbox-{}", project_id)),
        ssh_port: None,
        sessions: HashMap::new(),
    }
}

/// A session with nowhere to send input, for registry bookkeeping tests.
pub fn detached_session(project_id: &str, session_id: &str) -> Arc<TerminalSession> {
    Arc::new(TerminalSession::new(
        session_id.to_string(),
        project_id.to_string(),
        "fake".to_string(),
        format!("exec-{}", session_id),
        Box::new(tokio::io::sink()),
        Arc::new(FakeRuntime::new()),
    ))
}

/// Fully wired services over the fakes, with a throwaway workspace root.
pub struct Harness {
    pub services: SandboxServices,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<MemoryProjectStore>,
    pub root: tempfile::TempDir,
}

impl Deref for Harness {
    type Target = SandboxServices;

    fn deref(&self) -> &SandboxServices {
        &self.services
    }
}

pub async fn harness(configure: impl FnOnce(&mut SandboxConfig)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.workspace_root = root.path().to_path_buf();
    configure(&mut config);

    let runtime = Arc::new(FakeRuntime::new());
    let store = Arc::new(MemoryProjectStore::new());
    let services = SandboxServices::new(Arc::new(config), runtime.clone(), store.clone());
    Harness {
        services,
        runtime,
        store,
        root,
    }
}
