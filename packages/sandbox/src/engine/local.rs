// ABOUTME: In-process container engine that runs exec'd commands as host processes
// ABOUTME: Emits engine-framed output in small chunks so every exec exercises the demultiplexer

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, EngineError, ExecHandle,
    ExecSpec, ExecState, ResourceStats, Result,
};
use crate::demux::{demux_stream, encode_frame, Channel};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
struct LocalContainer {
    id: String,
    name: String,
    state: ContainerState,
    labels: HashMap<String, String>,
}

#[derive(Default)]
struct LocalState {
    containers: HashMap<String, LocalContainer>,
    volumes: HashSet<String>,
    execs: HashMap<String, ExecState>,
    exec_log: Vec<Vec<String>>,
    next_id: u64,
}

/// Engine double for tests. Containers are bookkeeping only; exec runs on the host.
pub struct LocalProcessEngine {
    state: Arc<Mutex<LocalState>>,
    create_delay: Duration,
    chunk_size: usize,
    creates: AtomicUsize,
    stats: Mutex<ResourceStats>,
}

impl Default for LocalProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState::default())),
            create_delay: Duration::ZERO,
            chunk_size: 7,
            creates: AtomicUsize::new(0),
            stats: Mutex::new(ResourceStats {
                cpu_usage_percent: 2.5,
                memory_usage_mb: 128,
                memory_limit_mb: 2048,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
            }),
        }
    }

    /// Delay every container creation, to widen race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Size of the raw chunks handed to the demultiplexer.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of successful container creations.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn container_id(&self, name: &str) -> Option<String> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }

    pub fn container_state(&self, name: &str) -> Option<ContainerState> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.state)
    }

    /// Change a container's state behind the manager's back, e.g. to simulate a crash.
    pub fn set_state(&self, name: &str, state: ContainerState) {
        let mut guard = self.lock();
        if let Some(container) = guard.containers.values_mut().find(|c| c.name == name) {
            container.state = state;
        }
    }

    /// Delete a container behind the manager's back.
    pub fn remove_externally(&self, name: &str) {
        self.lock().containers.retain(|_, c| c.name != name);
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self.lock().volumes.iter().cloned().collect();
        volumes.sort();
        volumes
    }

    /// Every command passed to `exec`, in order.
    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.lock().exec_log.clone()
    }

    pub fn set_stats(&self, stats: ResourceStats) {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner()) = stats;
    }

    fn find_id(state: &LocalState, name_or_id: &str) -> Option<String> {
        if state.containers.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        state
            .containers
            .values()
            .find(|c| c.name == name_or_id)
            .map(|c| c.id.clone())
    }
}

#[async_trait]
impl ContainerEngine for LocalProcessEngine {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut state = self.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "create {}: name already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("local-{:012x}", state.next_id);
        state.containers.insert(
            id.clone(),
            LocalContainer {
                id: id.clone(),
                name: spec.name.clone(),
                state: ContainerState::Running,
                labels: spec.labels.clone(),
            },
        );
        state.volumes.insert(spec.volume.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        let id = Self::find_id(&state, container_id)
            .ok_or_else(|| EngineError::NotFound(format!("start {}", container_id)))?;
        if let Some(container) = state.containers.get_mut(&id) {
            container.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.lock();
        let id = Self::find_id(&state, container_id)
            .ok_or_else(|| EngineError::NotFound(format!("stop {}", container_id)))?;
        if let Some(container) = state.containers.get_mut(&id) {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        let mut state = self.lock();
        if let Some(id) = Self::find_id(&state, container_id) {
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        let state = self.lock();
        Ok(Self::find_id(&state, name_or_id)
            .and_then(|id| state.containers.get(&id))
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.state,
                labels: c.labels.clone(),
            }))
    }

    async fn create_volume(&self, name: &str, _labels: HashMap<String, String>) -> Result<()> {
        self.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.lock().volumes.remove(name);
        Ok(())
    }

    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecHandle> {
        let exec_id = {
            let mut state = self.lock();
            let id = Self::find_id(&state, container_id)
                .ok_or_else(|| EngineError::NotFound(format!("exec {}", container_id)))?;
            let running = state
                .containers
                .get(&id)
                .map(|c| c.state == ContainerState::Running)
                .unwrap_or(false);
            if !running {
                return Err(EngineError::Exec(format!(
                    "exec {}: container is not running",
                    container_id
                )));
            }
            state.exec_log.push(spec.command.clone());
            state.next_id += 1;
            let exec_id = format!("exec-{:08x}", state.next_id);
            state.execs.insert(
                exec_id.clone(),
                ExecState {
                    running: true,
                    exit_code: None,
                },
            );
            exec_id
        };

        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| EngineError::Exec("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Exec(format!("spawn {}: {}", program, e)))?;
        let (mut stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(EngineError::Exec("child pipes unavailable".to_string())),
        };

        let (tx, rx) = mpsc::channel::<Result<Bytes>>(64);
        let chunk_size = self.chunk_size;
        let state = self.state.clone();
        let task_exec_id = exec_id.clone();

        tokio::spawn(async move {
            let send = move |channel: Channel, data: &[u8]| {
                let tx = tx.clone();
                let framed = encode_frame(channel, data);
                async move {
                    for piece in framed.chunks(chunk_size) {
                        // Receiver gone means the caller stopped reading; keep draining the pipes.
                        let _ = tx.send(Ok(Bytes::copy_from_slice(piece))).await;
                    }
                }
            };

            let mut out_buf = [0u8; 4096];
            let mut err_buf = [0u8; 4096];
            let mut out_open = true;
            let mut err_open = true;
            while out_open || err_open {
                tokio::select! {
                    read = stdout.read(&mut out_buf), if out_open => match read {
                        Ok(0) | Err(_) => out_open = false,
                        Ok(n) => send(Channel::Stdout, &out_buf[..n]).await,
                    },
                    read = stderr.read(&mut err_buf), if err_open => match read {
                        Ok(0) | Err(_) => err_open = false,
                        Ok(n) => send(Channel::Stderr, &err_buf[..n]).await,
                    },
                }
            }

            let exit_code = child
                .wait()
                .await
                .ok()
                .map(|status| status.code().map(i64::from).unwrap_or(137));
            let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
            guard.execs.insert(
                task_exec_id,
                ExecState {
                    running: false,
                    exit_code,
                },
            );
        });

        Ok(ExecHandle {
            exec_id,
            output: demux_stream(ReceiverStream::new(rx)),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        self.lock()
            .execs
            .get(exec_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("exec {}", exec_id)))
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceStats> {
        let state = self.lock();
        let id = Self::find_id(&state, container_id)
            .ok_or_else(|| EngineError::NotFound(format!("stats {}", container_id)))?;
        match state.containers.get(&id).map(|c| c.state) {
            Some(ContainerState::Running) => {
                Ok(self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone())
            }
            _ => Err(EngineError::Container(format!(
                "stats {}: container is not running",
                container_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "ubuntu:22.04".to_string(),
            volume: format!("{}-workspace", name),
            workspace_path: "/workspace".to_string(),
            memory_mb: 512,
            cpu_cores: 0.5,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_exec_output_is_split_by_channel() {
        let engine = LocalProcessEngine::new().with_chunk_size(3);
        let id = engine.create_container(&spec("box")).await.unwrap();

        let handle = engine
            .exec(&id, ExecSpec::shell("printf out; printf err >&2; exit 4"))
            .await
            .unwrap();

        let frames: Vec<_> = handle.output.map(|f| f.unwrap()).collect().await;
        let stdout: Vec<u8> = frames
            .iter()
            .filter(|f| f.channel == Channel::Stdout)
            .flat_map(|f| f.payload.to_vec())
            .collect();
        let stderr: Vec<u8> = frames
            .iter()
            .filter(|f| f.channel == Channel::Stderr)
            .flat_map(|f| f.payload.to_vec())
            .collect();
        assert_eq!(stdout, b"out".to_vec());
        assert_eq!(stderr, b"err".to_vec());

        let state = engine.inspect_exec(&handle.exec_id).await.unwrap();
        assert_eq!(state.exit_code, Some(4));
        assert!(!state.running);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let engine = LocalProcessEngine::new();
        engine.create_container(&spec("box")).await.unwrap();
        let err = engine.create_container(&spec("box")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(engine.create_count(), 1);
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let engine = LocalProcessEngine::new();
        let id = engine.create_container(&spec("box")).await.unwrap();
        engine
            .stop_container(&id, Duration::from_secs(1))
            .await
            .unwrap();

        let err = engine.exec(&id, ExecSpec::shell("true")).await.unwrap_err();
        assert!(matches!(err, EngineError::Exec(_)));
    }
}
