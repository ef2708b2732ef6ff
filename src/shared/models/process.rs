use serde::Serialize;

/// One row of `ps aux` inside a sandbox. Built on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    pub user: String,
    pub cpu: String,
    pub memory: String,
    pub command: String,
    pub status: &'static str,
}
