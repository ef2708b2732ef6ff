pub mod config;
pub mod logging;
pub mod models;
pub mod store;

pub use config::SandboxConfig;
