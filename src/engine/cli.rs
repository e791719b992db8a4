//! Engine backed by the `docker` command line client

use super::classify::Classifier;
use super::{
    ContainerInfo, ContainerState, Engine, EngineError, EngineResult, ImageInfo, RunSpec,
    ServiceInfo, SwarmInfo, SwarmState,
};
use crate::resource::spec::{host_ip, SwarmNodeSpec};
use crate::resource::NodeRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const JSON_FORMAT: &str = "{{json .}}";

/// How to reach the docker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Client binary
    pub binary: String,
    /// Daemon socket or URL passed as `--host`
    pub host: Option<String>,
    /// Per-command timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
            timeout_secs: 120,
        }
    }
}

/// Docker CLI engine
pub struct DockerCli {
    config: DockerConfig,
    classifier: Classifier,
}

impl DockerCli {
    pub fn new(config: DockerConfig, classifier: Classifier) -> Self {
        Self { config, classifier }
    }

    /// Run the client with `args`, returning stdout on success
    async fn run(&self, args: &[String]) -> EngineResult<String> {
        let mut cmd = Command::new(&self.config.binary);
        if let Some(host) = &self.config.host {
            cmd.arg("--host").arg(host);
        }
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let shown = format!("{} {}", self.config.binary, args.join(" "));
        debug!(command = %shown, "Running engine command");

        let limit = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Err(_) => {
                return Err(self
                    .classifier
                    .classify_timeout(&shown, self.config.timeout_secs))
            }
            Ok(Err(e)) => return Err(self.classifier.classify_spawn(&self.config.binary, &e)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            stdout.as_str()
        } else {
            stderr.as_ref()
        };
        let err = self.classifier.classify_exit(output.status.code(), message);
        debug!(command = %shown, class = %err.class, "Engine command failed: {}", err);
        Err(err)
    }

    /// Run a query whose failure may just mean the object does not exist
    async fn query(&self, args: &[String]) -> EngineResult<Option<String>> {
        match self.run(args).await {
            Ok(out) => Ok(Some(out)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Engine for DockerCli {
    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageInfo>> {
        let out = self
            .query(&args(&["image", "inspect", "--format", JSON_FORMAT, reference]))
            .await?;
        let Some(out) = out else { return Ok(None) };
        let dto: ImageDto = parse_line(&out)?;
        Ok(Some(ImageInfo {
            id: dto.id,
            repo_digests: dto.repo_digests.unwrap_or_default(),
        }))
    }

    async fn inspect_container(&self, name: &str) -> EngineResult<Option<ContainerInfo>> {
        let out = self
            .query(&args(&["container", "inspect", "--format", JSON_FORMAT, name]))
            .await?;
        let Some(out) = out else { return Ok(None) };
        let dto: ContainerDto = parse_line(&out)?;
        Ok(Some(ContainerInfo {
            id: dto.id,
            name: dto.name.trim_start_matches('/').to_string(),
            state: ContainerState::parse(&dto.state.status),
            image_id: dto.image,
            labels: dto.config.labels.unwrap_or_default(),
        }))
    }

    async fn swarm_info(&self) -> EngineResult<SwarmInfo> {
        let out = self
            .run(&args(&["info", "--format", "{{json .Swarm}}"]))
            .await?;
        let dto: SwarmDto = parse_line(&out)?;
        Ok(SwarmInfo {
            local_state: SwarmState::parse(&dto.local_node_state),
            node_id: dto.node_id,
            node_addr: dto.node_addr,
            cluster_id: dto.cluster.map(|c| c.id).filter(|id| !id.is_empty()),
            is_manager: dto.control_available,
            managers: dto
                .remote_managers
                .unwrap_or_default()
                .into_iter()
                .map(|m| host_ip(&m.addr).unwrap_or(m.addr))
                .collect(),
        })
    }

    async fn stack_services(&self, stack: &str) -> EngineResult<Vec<ServiceInfo>> {
        let filter = format!("label=com.docker.stack.namespace={}", stack);
        let ids = self
            .run(&args(&["service", "ls", "--quiet", "--filter", &filter]))
            .await?;
        let ids: Vec<String> = ids.split_whitespace().map(str::to_string).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut inspect = args(&["service", "inspect", "--format", JSON_FORMAT]);
        inspect.extend(ids);
        let out = self.run(&inspect).await?;

        let mut services = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let dto: ServiceDto = parse_line(line)?;
            services.push(ServiceInfo {
                id: dto.id,
                name: dto.spec.name,
                labels: dto.spec.labels.unwrap_or_default(),
            });
        }
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<()> {
        self.run(&args(&["image", "pull", "--quiet", reference]))
            .await
            .map(drop)
    }

    async fn remove_image(&self, id: &str) -> EngineResult<()> {
        self.query(&args(&["image", "rm", id])).await.map(drop)
    }

    async fn run_container(&self, spec: &RunSpec) -> EngineResult<String> {
        let out = self.run(&run_args(spec)?).await?;
        Ok(out.trim().to_string())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.query(&args(&["container", "rm", "--force", id]))
            .await
            .map(drop)
    }

    async fn swarm_init(&self, spec: &SwarmNodeSpec) -> EngineResult<()> {
        let mut argv = args(&["swarm", "init"]);
        push_opt(&mut argv, "--advertise-addr", &spec.advertise_addr);
        push_opt(&mut argv, "--listen-addr", &spec.listen_addr);
        self.run(&argv).await.map(drop)
    }

    async fn swarm_join(&self, spec: &SwarmNodeSpec) -> EngineResult<()> {
        let mut argv = args(&["swarm", "join"]);
        push_opt(&mut argv, "--token", &spec.token);
        push_opt(&mut argv, "--advertise-addr", &spec.advertise_addr);
        push_opt(&mut argv, "--listen-addr", &spec.listen_addr);
        let manager = spec
            .manager_ip
            .as_deref()
            .ok_or_else(|| EngineError::fatal("swarm join requires a manager address"))?;
        argv.push(manager.to_string());
        self.run(&argv).await.map(drop)
    }

    async fn swarm_leave(&self) -> EngineResult<()> {
        match self.run(&args(&["swarm", "leave", "--force"])).await {
            Err(e) if e.message.to_lowercase().contains("not part of a swarm") => Ok(()),
            other => other.map(drop),
        }
    }

    async fn set_node_role(&self, node_id: &str, role: NodeRole) -> EngineResult<()> {
        let verb = match role {
            NodeRole::Manager => "promote",
            NodeRole::Worker => "demote",
        };
        self.run(&args(&["node", verb, node_id])).await.map(drop)
    }

    async fn stack_deploy(&self, stack: &str, compose_files: &[PathBuf]) -> EngineResult<()> {
        let mut argv = args(&["stack", "deploy", "--prune"]);
        for file in compose_files {
            argv.push("--compose-file".to_string());
            argv.push(file.display().to_string());
        }
        argv.push(stack.to_string());
        self.run(&argv).await.map(drop)
    }

    async fn label_service(&self, service: &str, key: &str, value: &str) -> EngineResult<()> {
        let label = format!("{}={}", key, value);
        self.run(&args(&[
            "service",
            "update",
            "--detach",
            "--label-add",
            &label,
            service,
        ]))
        .await
        .map(drop)
    }

    async fn stack_remove(&self, stack: &str) -> EngineResult<()> {
        match self.run(&args(&["stack", "rm", stack])).await {
            Err(e) if e.message.to_lowercase().contains("nothing found in stack") => Ok(()),
            other => other.map(drop),
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn push_opt(argv: &mut Vec<String>, flag: &str, value: &Option<String>) {
    if let Some(value) = value {
        argv.push(flag.to_string());
        argv.push(value.clone());
    }
}

/// Arguments of `docker run` for `spec`
pub fn run_args(spec: &RunSpec) -> EngineResult<Vec<String>> {
    let mut argv = args(&["run", "--detach", "--name", &spec.name]);
    for (key, value) in &spec.labels {
        argv.push("--label".to_string());
        argv.push(format!("{}={}", key, value));
    }
    push_opt(&mut argv, "--restart", &spec.restart);
    push_opt(&mut argv, "--net", &spec.net);
    push_opt(&mut argv, "--hostname", &spec.hostname);
    for env in &spec.env {
        argv.push("--env".to_string());
        argv.push(env.clone());
    }
    for port in &spec.ports {
        argv.push("--publish".to_string());
        argv.push(port.clone());
    }
    for volume in &spec.volumes {
        argv.push("--volume".to_string());
        argv.push(volume.clone());
    }
    for extra in &spec.extra_parameters {
        argv.extend(split_command(extra)?);
    }
    argv.push(spec.image.clone());
    if let Some(command) = &spec.command {
        argv.extend(split_command(command)?);
    }
    Ok(argv)
}

/// Split a command line into words, honouring single and double quotes and
/// backslash escapes
pub fn split_command(line: &str) -> EngineResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_word = true;
                }
                None => return Err(EngineError::fatal(format!("trailing escape in '{}'", line))),
            },
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(EngineError::fatal(format!("unterminated quote in '{}'", line)));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Lookup errors that mean the object simply is not there
fn is_missing(err: &EngineError) -> bool {
    let lower = err.message.to_lowercase();
    err.class == super::FailureClass::Fatal
        && (lower.contains("no such") || lower.contains("not found"))
}

fn parse_line<T: for<'de> Deserialize<'de>>(out: &str) -> EngineResult<T> {
    let line = out.trim();
    serde_json::from_str(line)
        .map_err(|e| EngineError::fatal(format!("unexpected engine output '{}': {}", line, e)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageDto {
    id: String,
    #[serde(default)]
    repo_digests: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerDto {
    id: String,
    name: String,
    image: String,
    state: ContainerStateDto,
    config: ContainerConfigDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerStateDto {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfigDto {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmDto {
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(default)]
    node_addr: String,
    #[serde(default)]
    local_node_state: String,
    #[serde(default)]
    control_available: bool,
    #[serde(default)]
    cluster: Option<ClusterDto>,
    #[serde(default)]
    remote_managers: Option<Vec<RemoteManagerDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteManagerDto {
    #[serde(default)]
    addr: String,
}

#[derive(Debug, Deserialize)]
struct ClusterDto {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDto {
    #[serde(rename = "ID")]
    id: String,
    spec: ServiceSpecDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceSpecDto {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureClass;

    fn run_spec() -> RunSpec {
        RunSpec {
            name: "web".to_string(),
            image: "docker.io/library/nginx:latest".to_string(),
            command: Some("nginx -g 'daemon off;'".to_string()),
            restart: Some("always".to_string()),
            net: None,
            env: vec!["A=1".to_string()],
            ports: vec!["8080:80".to_string()],
            volumes: Vec::new(),
            hostname: None,
            extra_parameters: vec!["--memory 64m".to_string()],
            labels: BTreeMap::from([("io.moor.fingerprint".to_string(), "sha256:ab".to_string())]),
        }
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("sh -c 'echo hello world'").unwrap(),
            vec!["sh", "-c", "echo hello world"]
        );
        assert_eq!(
            split_command(r#"echo "a \"b\"" c\ d"#).unwrap(),
            vec!["echo", "a \"b\"", "c d"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_command("echo 'open").is_err());
    }

    #[test]
    fn test_run_args_order() {
        let argv = run_args(&run_spec()).unwrap();
        let image_at = argv
            .iter()
            .position(|a| a == "docker.io/library/nginx:latest")
            .unwrap();
        assert_eq!(&argv[..4], &["run", "--detach", "--name", "web"]);
        assert!(argv.contains(&"io.moor.fingerprint=sha256:ab".to_string()));
        assert!(argv[..image_at].contains(&"--memory".to_string()));
        assert_eq!(&argv[image_at + 1..], &["nginx", "-g", "daemon off;"]);
    }

    #[test]
    fn test_is_missing() {
        assert!(is_missing(&EngineError::fatal("Error: No such image: busybox")));
        assert!(!is_missing(&EngineError::unavailable("No such host")));
        assert!(!is_missing(&EngineError::new(
            FailureClass::Fatal,
            "conflict: unable to remove"
        )));
    }

    #[test]
    fn test_parse_container_output() {
        let line = r#"{"Id":"c1","Name":"/web","Image":"sha256:i1","State":{"Status":"running"},"Config":{"Labels":{"a":"b"}}}"#;
        let dto: ContainerDto = parse_line(line).unwrap();
        assert_eq!(dto.id, "c1");
        assert_eq!(dto.state.status, "running");
        assert_eq!(dto.config.labels.unwrap()["a"], "b");
    }

    #[test]
    fn test_parse_swarm_output() {
        let line = r#"{"NodeID":"n1","NodeAddr":"10.0.0.1","LocalNodeState":"active","ControlAvailable":true,"Cluster":{"ID":"c1"},"RemoteManagers":[{"NodeID":"n1","Addr":"10.0.0.1:2377"}]}"#;
        let dto: SwarmDto = parse_line(line).unwrap();
        assert_eq!(dto.node_id, "n1");
        assert!(dto.control_available);
        assert_eq!(dto.cluster.unwrap().id, "c1");
        assert_eq!(dto.remote_managers.unwrap()[0].addr, "10.0.0.1:2377");

        let inactive: SwarmDto =
            parse_line(r#"{"NodeID":"","NodeAddr":"","LocalNodeState":"inactive","ControlAvailable":false,"RemoteManagers":null}"#)
                .unwrap();
        assert!(inactive.cluster.is_none());
        assert!(inactive.remote_managers.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let cli = DockerCli::new(
            DockerConfig {
                binary: "/nonexistent/moor-docker".to_string(),
                host: None,
                timeout_secs: 5,
            },
            Classifier::default(),
        );
        let err = cli.swarm_info().await.unwrap_err();
        assert_eq!(err.class, FailureClass::NotInstalled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_classified() {
        let cli = DockerCli::new(
            DockerConfig {
                binary: "false".to_string(),
                host: Some("tcp://127.0.0.1:2376".to_string()),
                timeout_secs: 5,
            },
            Classifier::default(),
        );
        let err = cli.swarm_info().await.unwrap_err();
        assert_eq!(err.class, FailureClass::Fatal);
    }
}
