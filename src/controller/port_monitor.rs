use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::event_bus::EventBus;
use super::runtime::{ContainerRuntime, ExecRequest};
use crate::shared::models::{ActivePort, SandboxError, SandboxEvent, SandboxResult};
use crate::shared::SandboxConfig;

/// Listing tools tried in order; the first one that runs wins.
const LISTEN_PROBES: [(&str, &str); 3] = [
    ("netstat", "netstat -tln"),
    ("ss", "ss -tln"),
    ("lsof", "lsof -nP -iTCP -sTCP:LISTEN"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Listening(BTreeSet<u16>),
    /// No listing tool could run in the container.
    Unknown,
}

/// Ports in LISTEN state from netstat, ss or lsof output.
pub fn parse_listening(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| {
            // The local address is the first column with a colon in all three formats
            line.split_whitespace()
                .find(|col| col.contains(':'))
                .and_then(|addr| addr.rsplit(':').next())
                .and_then(|port| port.parse::<u16>().ok())
        })
        .collect()
}

pub async fn probe_listening(runtime: &dyn ContainerRuntime, container_id: &str) -> ProbeOutcome {
    for (tool, command) in LISTEN_PROBES {
        match runtime.exec(container_id, ExecRequest::shell(command)).await {
            Ok(output) if output.success() => {
                return ProbeOutcome::Listening(parse_listening(&output.stdout_lossy()));
            }
            Ok(output) => {
                debug!("{} unavailable in {} (exit {})", tool, container_id, output.exit_code);
            }
            Err(e) => {
                debug!("{} probe failed in {}: {}", tool, container_id, e);
            }
        }
    }
    ProbeOutcome::Unknown
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortTransitions {
    pub detected: Vec<u16>,
    pub stopped: Vec<u16>,
}

pub fn diff_ports(previous: &BTreeSet<u16>, current: &BTreeSet<u16>) -> PortTransitions {
    PortTransitions {
        detected: current.difference(previous).copied().collect(),
        stopped: previous.difference(current).copied().collect(),
    }
}

type ActiveMap = BTreeMap<u16, Option<u16>>;

/// Per-project background probe of the candidate dev ports.
pub struct PortMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    events: EventBus,
    candidates: BTreeSet<u16>,
    interval: Duration,
    public_host: String,
    active: Mutex<HashMap<String, Arc<Mutex<ActiveMap>>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PortMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, events: EventBus, config: &SandboxConfig) -> Self {
        Self {
            runtime,
            events,
            candidates: config.ports.monitored.iter().copied().collect(),
            interval: Duration::from_millis(config.ports.check_interval_ms),
            public_host: config.server.public_host.clone(),
            active: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        self.candidates.iter().copied()
    }

    fn url_for(&self, host_port: Option<u16>) -> Option<String> {
        host_port.map(|p| format!("http://{}:{}", self.public_host, p))
    }

    async fn project_state(&self, project_id: &str) -> Arc<Mutex<ActiveMap>> {
        self.active
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn start(self: &Arc<Self>, project_id: &str, container_id: &str) {
        let monitor = Arc::clone(self);
        let project = project_id.to_string();
        let container = container_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.scan(&project, &container).await {
                    debug!("Port scan for {} failed: {}", project, e);
                }
            }
        });

        if let Some(previous) = self.tasks.lock().await.insert(project_id.to_string(), handle) {
            previous.abort();
        }
        info!("Port monitor started for project {}", project_id);
    }

    pub async fn stop(&self, project_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(project_id) {
            handle.abort();
            info!("Port monitor stopped for project {}", project_id);
        }
        self.active.lock().await.remove(project_id);
    }

    pub async fn is_running(&self, project_id: &str) -> bool {
        self.tasks.lock().await.contains_key(project_id)
    }

    /// One probe + diff pass. Scans for the same project are serialized so a
    /// port is reported detected at most once while it stays up.
    pub async fn scan(&self, project_id: &str, container_id: &str) -> SandboxResult<Vec<ActivePort>> {
        let state = self.project_state(project_id).await;
        let mut active = state.lock().await;

        let current: BTreeSet<u16> = match probe_listening(self.runtime.as_ref(), container_id).await {
            ProbeOutcome::Listening(ports) => ports.intersection(&self.candidates).copied().collect(),
            ProbeOutcome::Unknown => {
                warn!("No port listing tool available in {}", container_id);
                BTreeSet::new()
            }
        };
        let previous: BTreeSet<u16> = active.keys().copied().collect();
        let transitions = diff_ports(&previous, &current);

        let mut mappings = HashMap::new();
        if !transitions.detected.is_empty() {
            match self.runtime.inspect_container(container_id).await {
                Ok(Some(inspect)) => mappings = inspect.ports,
                Ok(None) => {
                    return Err(SandboxError::PortProbe(format!(
                        "container {} is gone",
                        container_id
                    )))
                }
                Err(e) => warn!("Could not resolve host ports for {}: {}", container_id, e),
            }
        }

        for port in transitions.stopped {
            active.remove(&port);
            info!("Port {} stopped in project {}", port, project_id);
            self.events.publish(SandboxEvent::PortStopped {
                project_id: project_id.to_string(),
                container_port: port,
                timestamp: Utc::now(),
            });
        }
        for port in transitions.detected {
            let host_port = mappings.get(&port).copied();
            active.insert(port, host_port);
            info!("Port {} detected in project {} (host {:?})", port, project_id, host_port);
            self.events.publish(SandboxEvent::PortDetected {
                project_id: project_id.to_string(),
                container_port: port,
                host_port,
                url: self.url_for(host_port),
                timestamp: Utc::now(),
            });
        }

        Ok(self.to_active_ports(&active))
    }

    fn to_active_ports(&self, active: &ActiveMap) -> Vec<ActivePort> {
        active
            .iter()
            .map(|(&container_port, &host_port)| ActivePort {
                container_port,
                host_port,
                url: self.url_for(host_port),
                status: "active",
            })
            .collect()
    }

    pub async fn active_ports(&self, project_id: &str) -> Vec<ActivePort> {
        let Some(state) = self.active.lock().await.get(project_id).cloned() else {
            return Vec::new();
        };
        let active = state.lock().await;
        self.to_active_ports(&active)
    }
}
