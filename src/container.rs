use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;

use crate::error::{ContainerError, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: String,
    pub name: String,
}

/// The seam between `User` and the container orchestrator daemon.
pub trait ContainerPort: Send + Sync {
    fn find_network(&self, name: &str) -> Result<Option<Network>>;
    fn compose_up(&self, project_id: &str, compose_files: &[PathBuf]) -> Result<()>;
    fn compose_down(
        &self,
        project_id: &str,
        compose_files: &[PathBuf],
        timeout: Duration,
    ) -> Result<()>;
    fn compose_is_running(&self, project_id: &str, compose_files: &[PathBuf]) -> Result<bool>;
}

/// Production implementation: shells out to the `docker-compose` (or
/// Compose v2 `docker compose`) CLI and the `docker` CLI for network
/// lookups, the same `Command::new(..).stdout(Stdio::piped())` idiom the
/// teacher project uses for every host mutation.
pub struct Gateway {
    challenges_root: PathBuf,
    compose_bin: Vec<String>,
}

impl Gateway {
    pub fn new(challenges_root: PathBuf, compose_bin: Vec<String>) -> Self {
        Gateway {
            challenges_root,
            compose_bin,
        }
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        let joined = self.challenges_root.join(file);
        normalize(&joined)
    }

    fn compose_command(&self, project_id: &str, compose_files: &[PathBuf]) -> Command {
        let (program, leading_args) = self
            .compose_bin
            .split_first()
            .expect("compose_bin must not be empty");
        let mut cmd = Command::new(program);
        cmd.args(leading_args);
        cmd.arg("--project-name").arg(project_id);
        for file in compose_files {
            cmd.arg("--file").arg(self.resolve(file));
        }
        cmd
    }
}

impl ContainerPort for Gateway {
    fn find_network(&self, name: &str) -> Result<Option<Network>> {
        let filter = format!("name=^{name}$");
        let output = Command::new("docker")
            .args(["network", "ls", "--filter", &filter, "--format", "{{json .}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| Error::Container(ContainerError::new(err.into())))?;
        if !output.status.success() {
            return Err(Error::Container(ContainerError::new(anyhow::anyhow!(
                "docker network ls failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))));
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|err| Error::Container(ContainerError::new(err.into())))?;
            let net_name = value.get("Name").and_then(Value::as_str);
            if net_name == Some(name) {
                let id = value
                    .get("ID")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Ok(Some(Network {
                    id,
                    name: name.to_string(),
                }));
            }
        }
        Ok(None)
    }

    fn compose_up(&self, project_id: &str, compose_files: &[PathBuf]) -> Result<()> {
        tracing::debug!(project_id, "compose up --detach");
        run(self
            .compose_command(project_id, compose_files)
            .args(["up", "--detach"]))
    }

    fn compose_down(
        &self,
        project_id: &str,
        compose_files: &[PathBuf],
        timeout: Duration,
    ) -> Result<()> {
        tracing::debug!(project_id, ?timeout, "compose down");
        run(self
            .compose_command(project_id, compose_files)
            .args(["down", "--timeout", &timeout.as_secs().to_string()]))
    }

    fn compose_is_running(&self, project_id: &str, compose_files: &[PathBuf]) -> Result<bool> {
        let output = self
            .compose_command(project_id, compose_files)
            .arg("top")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| Error::Container(ContainerError::new(err.into())))?;
        if !output.status.success() {
            return Err(Error::Container(ContainerError::new(anyhow::anyhow!(
                "compose top failed for {}: {}",
                project_id,
                String::from_utf8_lossy(&output.stderr)
            ))));
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}

fn run(cmd: &mut Command) -> Result<()> {
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| Error::Container(ContainerError::new(err.into())))?;
    if !output.status.success() {
        return Err(Error::Container(ContainerError::new(anyhow::anyhow!(
            "{:?} failed: {}",
            cmd,
            String::from_utf8_lossy(&output.stderr)
        ))));
    }
    Ok(())
}

/// Lexically normalises a joined path (no `..`/`.` components surviving),
/// without requiring the path to exist on disk like `Path::canonicalize`
/// would.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeGateway {
        inner: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        networks: HashMap<String, Network>,
        running: std::collections::HashSet<String>,
        up_calls: usize,
        down_calls: usize,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            FakeGateway::default()
        }

        pub fn seed_network(&self, project_id: &str, network_id: &str) {
            let mut state = self.inner.lock().unwrap();
            state.networks.insert(
                format!("{project_id}_default"),
                Network {
                    id: network_id.to_string(),
                    name: format!("{project_id}_default"),
                },
            );
        }

        pub fn mark_running(&self, project_id: &str) {
            self.inner.lock().unwrap().running.insert(project_id.to_string());
        }

        pub fn up_calls(&self) -> usize {
            self.inner.lock().unwrap().up_calls
        }

        pub fn down_calls(&self) -> usize {
            self.inner.lock().unwrap().down_calls
        }
    }

    impl ContainerPort for FakeGateway {
        fn find_network(&self, name: &str) -> Result<Option<Network>> {
            Ok(self.inner.lock().unwrap().networks.get(name).cloned())
        }

        fn compose_up(&self, project_id: &str, _compose_files: &[PathBuf]) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.running.insert(project_id.to_string());
            state.up_calls += 1;
            Ok(())
        }

        fn compose_down(
            &self,
            project_id: &str,
            _compose_files: &[PathBuf],
            _timeout: Duration,
        ) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.running.remove(project_id);
            state.down_calls += 1;
            Ok(())
        }

        fn compose_is_running(&self, project_id: &str, _compose_files: &[PathBuf]) -> Result<bool> {
            Ok(self.inner.lock().unwrap().running.contains(project_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_parent_components() {
        let path = Path::new("/challenges/../challenges/example/docker-compose.yml");
        assert_eq!(
            normalize(path),
            PathBuf::from("/challenges/example/docker-compose.yml")
        );
    }
}
