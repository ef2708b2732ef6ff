use std::path::{Component, Path, PathBuf};

use super::runtime::{ContainerRuntime, ExecRequest};
use crate::shared::models::constants::{SANDBOX_USER, WORKSPACE_DIR};
use crate::shared::models::{SandboxError, SandboxResult};

/// Creates the parent folders of `$1`, then copies stdin into it.
pub const WRITE_SCRIPT: &str = "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"";

/// The plain components of a store-relative path, or None when it is empty
/// or would climb out of its root.
fn plain_components(relative: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then_some(parts)
}

/// Join a store-relative path onto a host directory. Only used on a
/// workspace the sandbox has not touched yet.
pub fn workspace_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    joined.extend(plain_components(relative)?);
    Some(joined)
}

/// Absolute path of a store-relative file inside the sandbox.
pub fn container_path(relative: &str) -> Option<String> {
    Some(format!("{}/{}", WORKSPACE_DIR, plain_components(relative)?.join("/")))
}

fn checked_path(relative: &str) -> SandboxResult<String> {
    container_path(relative).ok_or_else(|| {
        SandboxError::ConnectionProtocol(format!("invalid workspace path {:?}", relative))
    })
}

fn failed(action: &str, path: &str, stderr: &[u8]) -> SandboxError {
    SandboxError::Transport(format!(
        "{} {}: {}",
        action,
        path,
        String::from_utf8_lossy(stderr).trim()
    ))
}

/// Read a workspace file as the sandbox user, so links resolve inside the
/// container and never on the host.
pub async fn read_file(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    relative: &str,
) -> SandboxResult<Vec<u8>> {
    let path = checked_path(relative)?;
    let request = ExecRequest::new(["cat", "--", path.as_str()]).user(SANDBOX_USER);
    let output = runtime.exec(container_id, request).await?;
    if !output.success() {
        return Err(failed("read", relative, &output.stderr));
    }
    Ok(output.stdout)
}

/// Write a workspace file as the sandbox user, creating missing folders.
pub async fn write_file(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    relative: &str,
    content: &[u8],
) -> SandboxResult<()> {
    let path = checked_path(relative)?;
    let request = ExecRequest::new(["sh", "-c", WRITE_SCRIPT, "sh", path.as_str()])
        .user(SANDBOX_USER)
        .stdin(content);
    let output = runtime.exec(container_id, request).await?;
    if !output.success() {
        return Err(failed("write", relative, &output.stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeRuntime;

    #[test]
    fn test_paths_refuse_escape() {
        let root = Path::new("/tmp/sandbox-p1");
        assert_eq!(
            workspace_path(root, "src/index.js"),
            Some(PathBuf::from("/tmp/sandbox-p1/src/index.js"))
        );
        assert_eq!(
            workspace_path(root, "/src/./a.js"),
            Some(PathBuf::from("/tmp/sandbox-p1/src/a.js"))
        );
        assert_eq!(workspace_path(root, "../etc/passwd"), None);
        assert_eq!(workspace_path(root, ""), None);

        assert_eq!(container_path("src/./a.js").as_deref(), Some("/workspace/src/a.js"));
        assert_eq!(container_path("src/../../etc"), None);
    }

    #[tokio::test]
    async fn test_files_go_through_the_container() {
        let runtime = FakeRuntime::new();
        let id = runtime.add_running_container("sandbox-p1").await;

        write_file(&runtime, &id, "src/app.js", b"let x = 1;").await.unwrap();
        assert_eq!(
            runtime.file(&id, "/workspace/src/app.js"),
            Some(b"let x = 1;".to_vec())
        );
        assert_eq!(read_file(&runtime, &id, "src/app.js").await.unwrap(), b"let x = 1;");

        let Err(err) = read_file(&runtime, &id, "missing.js").await else {
            panic!("missing file was read");
        };
        assert_eq!(err.code(), "transport");
        let Err(err) = write_file(&runtime, &id, "../escape", b"").await else {
            panic!("escaping path was written");
        };
        assert_eq!(err.code(), "protocol_error");
    }
}
