// Sandbox image layout
pub const SANDBOX_USER: &str = "developer";
pub const SANDBOX_HOME: &str = "/home/developer";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const SANDBOX_HOSTNAME: &str = "sandbox";

// Container identity
pub const CONTAINER_NAME_PREFIX: &str = "sandbox-";
pub const LABEL_PROJECT_ID: &str = "project.id";
pub const LABEL_SERVICE: &str = "service";
pub const LABEL_CREATED_BY: &str = "created.by";

pub const SSH_CONTAINER_PORT: u16 = 22;

// WebSocket close codes
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_GOING_AWAY: u16 = 1001;
