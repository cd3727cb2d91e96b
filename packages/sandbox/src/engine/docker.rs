// ABOUTME: Docker engine implementation for per-tenant sandbox containers
// ABOUTME: Uses bollard for lifecycle calls and a hijacked exec attach routed through the demultiplexer

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, EngineError, ExecHandle,
    ExecSpec, ExecState, FrameStream, ResourceStats, Result,
};
use crate::demux::StreamFrame;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Label key prefix for containers and volumes owned by Warden.
pub const LABEL_PREFIX: &str = "warden";
const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerEngine {
    client: Docker,
    /// Local daemon socket. When set, exec output is read raw and demultiplexed here.
    socket_path: Option<PathBuf>,
    /// Images pulled during this process lifetime
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerEngine {
    /// Connect using DOCKER_HOST or the platform default socket
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, detect_socket_path()))
    }

    pub fn with_client(client: Docker, socket_path: Option<PathBuf>) -> Self {
        Self {
            client,
            socket_path,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
        labels.insert(format!("{}.name", LABEL_PREFIX), spec.name.clone());

        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}:rw", spec.volume, spec.workspace_path)]),
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpu_cores * 1_000_000_000.0) as i64),
            // tini as pid 1 so killed exec children get reaped
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some(spec.workspace_path.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(EngineError::Image(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(EngineError::Image(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(EngineError::Image(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )))
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                let mut cache = self.image_cache.write().await;
                cache.insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    /// Map bollard's decoded frames when no raw socket is available (TCP or TLS daemons).
    fn decoded_output(
        output: std::pin::Pin<
            Box<dyn futures::Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>,
        >,
    ) -> FrameStream {
        Box::pin(output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(StreamFrame::stdout(message)))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(StreamFrame::stderr(message))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(EngineError::Stream(e.to_string()))),
            }
        }))
    }
}

fn detect_socket_path() -> Option<PathBuf> {
    match std::env::var("DOCKER_HOST") {
        Ok(host) => host.strip_prefix("unix://").map(PathBuf::from),
        Err(_) => {
            let default = PathBuf::from(DEFAULT_SOCKET);
            default.exists().then_some(default)
        }
    }
}

/// Attach a lifecycle error to its operation, keeping 404 and 409 distinguishable.
fn engine_error(operation: &str, target: &str, e: BollardError) -> EngineError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(format!("{} {}: {}", operation, target, message)),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(format!("{} {}: {}", operation, target, message)),
        other => EngineError::Container(format!("{} {}: {}", operation, target, other)),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker is not reachable: {}", e);
                Ok(false)
            }
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(image) && self.image_exists(image).await? {
                return Ok(());
            }
        }
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull_image(image).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| engine_error("create", &spec.name, e))?;

        debug!("Created container {} ({})", spec.name, container.id);
        for warning in &container.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        self.start_container(&container.id).await?;
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(engine_error("start", container_id, e)),
        }
    }

    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()> {
        info!("Stopping container: {} (grace: {:?})", container_id, grace);

        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(engine_error("stop", container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        // Named volumes survive `v: true`; the manager removes them explicitly.
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(engine_error("remove", container_id, e)),
        }
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        let inspect = match self
            .client
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(engine_error("inspect", name_or_id, e)),
        };

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| ContainerState::from_engine(s.as_ref()))
            .unwrap_or(ContainerState::Unknown);

        Ok(Some(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| name_or_id.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| name_or_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            state,
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        }))
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<()> {
        let mut labels = labels;
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());

        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels,
            ..Default::default()
        };
        self.client
            .create_volume(options)
            .await
            .map_err(|e| EngineError::Volume(format!("create {}: {}", name, e)))?;
        debug!("Volume {} ready", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        info!("Removing volume: {}", name);
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(EngineError::Volume(format!("remove {}: {}", name, e))),
        }
    }

    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecHandle> {
        debug!("Exec in {}: {:?}", container_id, spec.command);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(spec.command),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: spec.working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| match engine_error("exec", container_id, e) {
                EngineError::Container(msg) => EngineError::Exec(msg),
                other => other,
            })?;

        #[cfg(unix)]
        {
            if let Some(socket) = &self.socket_path {
                let raw = hijack::start_exec_raw(socket, &exec.id).await?;
                return Ok(ExecHandle {
                    exec_id: exec.id,
                    output: crate::demux::demux_stream(raw),
                });
            }
        }

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?
        {
            StartExecResults::Attached { output, .. } => Ok(ExecHandle {
                exec_id: exec.id,
                output: Self::decoded_output(output),
            }),
            StartExecResults::Detached => Err(EngineError::Exec(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_error("inspect exec", exec_id, e))?;
        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats_stream = self.client.stats(container_id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => {
                let cpu_delta = stats
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
                let system_delta = stats
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

                let cpu_usage_percent = if system_delta > 0 && cpu_delta > 0 {
                    (cpu_delta as f64 / system_delta as f64)
                        * 100.0
                        * stats.cpu_stats.online_cpus.unwrap_or(1) as f64
                } else {
                    0.0
                };

                let (network_rx_bytes, network_tx_bytes) = match stats.networks {
                    Some(networks) => (
                        networks.values().map(|n| n.rx_bytes).sum(),
                        networks.values().map(|n| n.tx_bytes).sum(),
                    ),
                    None => (0, 0),
                };

                Ok(ResourceStats {
                    cpu_usage_percent,
                    memory_usage_mb: stats.memory_stats.usage.unwrap_or(0) / (1024 * 1024),
                    memory_limit_mb: stats.memory_stats.limit.unwrap_or(0) / (1024 * 1024),
                    network_rx_bytes,
                    network_tx_bytes,
                })
            }
            Some(Err(e)) => Err(engine_error("stats", container_id, e)),
            None => Err(EngineError::Container(format!(
                "stats {}: daemon returned no sample",
                container_id
            ))),
        }
    }
}

#[cfg(unix)]
mod hijack {
    //! Raw exec start over the daemon socket. The daemon answers with an HTTP upgrade and then
    //! writes the multiplexed stdout/stderr bytes directly on the connection.

    use crate::engine::{EngineError, Result};
    use async_stream::stream;
    use bytes::{Bytes, BytesMut};
    use futures::Stream;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    const MAX_HEAD_LEN: usize = 16 * 1024;

    pub async fn start_exec_raw(
        socket: &Path,
        exec_id: &str,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let mut conn = UnixStream::connect(socket)
            .await
            .map_err(|e| EngineError::Connection(format!("{}: {}", socket.display(), e)))?;

        let body = r#"{"Detach":false,"Tty":false}"#;
        let request = format!(
            "POST /exec/{}/start HTTP/1.1\r\nHost: docker\r\nContent-Type: application/json\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Length: {}\r\n\r\n{}",
            exec_id,
            body.len(),
            body
        );
        conn.write_all(request.as_bytes())
            .await
            .map_err(|e| EngineError::Exec(format!("start exec {}: {}", exec_id, e)))?;

        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        let head_end = loop {
            let n = conn
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::Exec(format!("start exec {}: {}", exec_id, e)))?;
            if n == 0 {
                return Err(EngineError::Exec(format!(
                    "start exec {}: connection closed before response",
                    exec_id
                )));
            }
            head.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_head_end(&head) {
                break pos;
            }
            if head.len() > MAX_HEAD_LEN {
                return Err(EngineError::Exec(format!(
                    "start exec {}: response head too large",
                    exec_id
                )));
            }
        };

        let status_line = String::from_utf8_lossy(&head[..head_end])
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        let status = status_line.split_whitespace().nth(1).unwrap_or_default();
        if status != "101" && status != "200" {
            let detail = String::from_utf8_lossy(&head[head_end..]).trim().to_string();
            return Err(match status {
                "404" => EngineError::NotFound(format!("exec {}: {}", exec_id, detail)),
                _ => EngineError::Exec(format!("start exec {}: {} {}", exec_id, status_line, detail)),
            });
        }

        let leftover = Bytes::copy_from_slice(&head[head_end..]);
        Ok(stream! {
            if !leftover.is_empty() {
                yield Ok(leftover);
            }
            loop {
                let mut chunk = BytesMut::with_capacity(8192);
                match conn.read_buf(&mut chunk).await {
                    Ok(0) => break,
                    Ok(_) => yield Ok(chunk.freeze()),
                    Err(e) => {
                        yield Err(EngineError::Stream(e.to_string()));
                        break;
                    }
                }
            }
        })
    }

    fn find_head_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

}
