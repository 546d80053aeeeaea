//! Typed interface over the container engine. Hides bollard's Docker-specific
//! error shapes behind the small `DriverError` taxonomy the rest of the core
//! is allowed to handle (see SPEC_FULL.md §4.2).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("other: {0}")]
    Other(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Retries a transient `EngineUnavailable` driver error once after a 100 ms
/// backoff (SPEC_FULL.md §7's propagation policy); every other error kind,
/// and a second `EngineUnavailable`, surfaces to the caller unchanged.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> DriverResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DriverResult<T>>,
{
    match op().await {
        Err(DriverError::EngineUnavailable(_)) => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            op().await
        }
        other => other,
    }
}

/// Everything the Session Registry needs to create a hardened container.
/// Field names mirror SPEC_FULL.md §4.2's bit-exact security profile.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    /// (host_volume_name, target_path), only present when persistence is on.
    pub volume_mount: Option<(String, String)>,
    pub tmpfs_workspace: bool,
    pub working_dir: String,
    pub mem_limit: i64,
    pub cpu_quota_pct: u32,
    pub pids_limit: i64,
    pub nofile_soft: u64,
    pub nofile_hard: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Missing,
}

#[derive(Debug, Clone)]
pub struct ContainerInspection {
    pub state: ContainerState,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

pub const MANAGED_LABEL: &str = "sandbox.managed";
pub const USER_LABEL: &str = "sandbox.user_id";
pub const SESSION_LABEL: &str = "sandbox.session_id";
pub const CREATED_AT_LABEL: &str = "sandbox.created_at";

/// Bound applied to stdout/stderr capture buffers (SPEC_FULL.md §4.4).
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> DriverResult<String>;
    async fn start(&self, container_id: &str) -> DriverResult<()>;
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        working_dir: &str,
        timeout: Duration,
    ) -> DriverResult<ExecResult>;
    async fn inspect(&self, container_id: &str) -> DriverResult<ContainerInspection>;
    async fn remove(&self, container_id: &str, force: bool) -> DriverResult<()>;
    async fn list(&self, label_filter: &str) -> DriverResult<Vec<ContainerSummary>>;
    async fn volume_create(&self, name: &str) -> DriverResult<()>;
    async fn volume_remove(&self, name: &str) -> DriverResult<()>;
    /// Copy a single file's contents out of the container as a tar stream
    /// scoped to `path` (bollard's `download_from_container`).
    async fn download_file(&self, container_id: &str, path: &str) -> DriverResult<Vec<u8>>;
    /// Stream a tar archive containing `path` (and any missing parent dirs)
    /// into the container (bollard's `upload_to_container`).
    async fn upload_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> DriverResult<()>;
}

pub mod bollard_driver {
    use super::*;
    use bollard::container::{
        Config as BollardConfig, CreateContainerOptions, DownloadFromContainerOptions,
        RemoveContainerOptions, UploadToContainerOptions,
    };
    use bollard::errors::Error as BollardError;
    use bollard::exec::{CreateExecOptions, StartExecResults};
    use bollard::models::{HostConfig, Mount, MountTypeEnum};
    use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
    use bollard::Docker;
    use futures::StreamExt;
    use std::io::Cursor;
    use tar::{Builder, Header};
    use tracing::{info, warn};

    pub struct BollardDriver {
        docker: Docker,
    }

    impl BollardDriver {
        pub fn connect(socket: Option<&str>) -> anyhow::Result<Self> {
            let docker = match socket {
                Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
                None => Docker::connect_with_socket_defaults()?,
            };
            Ok(Self { docker })
        }

        fn map_err(err: BollardError) -> DriverError {
            match &err {
                BollardError::DockerResponseServerError { status_code, message } => {
                    match status_code {
                        404 => DriverError::NotFound(message.clone()),
                        409 => DriverError::Conflict(message.clone()),
                        _ => DriverError::Other(err.to_string()),
                    }
                }
                BollardError::DockerStreamError { .. } | BollardError::HyperResponseError { .. } => {
                    DriverError::EngineUnavailable(err.to_string())
                }
                _ => DriverError::Other(err.to_string()),
            }
        }
    }

    #[async_trait]
    impl ContainerDriver for BollardDriver {
        async fn create(&self, spec: ContainerSpec) -> DriverResult<String> {
            let mut mounts = vec![Mount {
                typ: Some(MountTypeEnum::TMPFS),
                target: Some("/tmp".to_string()),
                tmpfs_size: Some(64 * 1024 * 1024),
                ..Default::default()
            }];

            if let Some((volume, target)) = &spec.volume_mount {
                mounts.push(Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(volume.clone()),
                    target: Some(target.clone()),
                    read_only: Some(false),
                    ..Default::default()
                });
            } else if spec.tmpfs_workspace {
                mounts.push(Mount {
                    typ: Some(MountTypeEnum::TMPFS),
                    target: Some("/workspace".to_string()),
                    tmpfs_size: Some(64 * 1024 * 1024),
                    ..Default::default()
                });
            }

            let config = BollardConfig {
                image: Some(spec.image.clone()),
                labels: Some(spec.labels.clone()),
                env: Some(spec.env.clone()),
                user: Some("1000:1000".to_string()),
                working_dir: Some(spec.working_dir.clone()),
                entrypoint: Some(vec!["/bin/sh".to_string()]),
                cmd: Some(vec![
                    "-c".to_string(),
                    "while :; do sleep 3600; done".to_string(),
                ]),
                host_config: Some(HostConfig {
                    mounts: Some(mounts),
                    readonly_rootfs: Some(true),
                    network_mode: Some("none".to_string()),
                    cap_drop: Some(vec!["ALL".to_string()]),
                    security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                    memory: Some(spec.mem_limit),
                    memory_swap: Some(spec.mem_limit),
                    cpu_quota: Some((spec.cpu_quota_pct as i64) * 1000),
                    cpu_period: Some(100_000),
                    pids_limit: Some(spec.pids_limit),
                    ulimits: Some(vec![
                        bollard::models::ResourcesUlimits {
                            name: Some("nofile".to_string()),
                            soft: Some(spec.nofile_soft as i64),
                            hard: Some(spec.nofile_hard as i64),
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let container = self
                .docker
                .create_container(None::<CreateContainerOptions<String>>, config)
                .await
                .map_err(Self::map_err)?;
            Ok(container.id)
        }

        async fn start(&self, container_id: &str) -> DriverResult<()> {
            self.docker
                .start_container::<String>(container_id, None)
                .await
                .map_err(Self::map_err)
        }

        async fn exec(
            &self,
            container_id: &str,
            argv: &[String],
            working_dir: &str,
            timeout: Duration,
        ) -> DriverResult<ExecResult> {
            let start = std::time::Instant::now();
            let exec_config = CreateExecOptions {
                cmd: Some(argv.to_vec()),
                working_dir: Some(working_dir.to_string()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            };

            let exec = self
                .docker
                .create_exec(container_id, exec_config)
                .await
                .map_err(Self::map_err)?;

            let run = async {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                let mut truncated = false;

                if let StartExecResults::Attached { mut output, .. } = self
                    .docker
                    .start_exec(&exec.id, None)
                    .await
                    .map_err(Self::map_err)?
                {
                    while let Some(Ok(msg)) = output.next().await {
                        let (buf, bytes) = match &msg {
                            bollard::container::LogOutput::StdOut { message } => {
                                (&mut stdout, message.as_ref())
                            }
                            bollard::container::LogOutput::StdErr { message } => {
                                (&mut stderr, message.as_ref())
                            }
                            _ => continue,
                        };
                        let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                        if room == 0 {
                            truncated = true;
                            continue;
                        }
                        if bytes.len() > room {
                            buf.extend_from_slice(&bytes[..room]);
                            truncated = true;
                        } else {
                            buf.extend_from_slice(bytes);
                        }
                    }
                }
                Ok::<_, DriverError>((stdout, stderr, truncated))
            };

            match tokio::time::timeout(timeout, run).await {
                Ok(Ok((stdout, stderr, truncated))) => {
                    let inspect = self
                        .docker
                        .inspect_exec(&exec.id)
                        .await
                        .map_err(Self::map_err)?;
                    let exit_code = inspect.exit_code.unwrap_or(-1);
                    Ok(ExecResult {
                        exit_code,
                        stdout,
                        stderr,
                        duration_ms: start.elapsed().as_millis() as u64,
                        timed_out: false,
                        truncated,
                    })
                }
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    // Best-effort kill of the exec's process group. bollard
                    // does not expose the exec pid directly; sending a kill
                    // signal via a fresh exec against the container's whole
                    // process tree is the documented workaround.
                    let kill_config = CreateExecOptions {
                        cmd: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            "kill -9 -1 2>/dev/null || true".to_string(),
                        ]),
                        ..Default::default()
                    };
                    if let Ok(kill_exec) = self.docker.create_exec(container_id, kill_config).await
                    {
                        let _ = self.docker.start_exec(&kill_exec.id, None).await;
                    }
                    warn!(container_id, "exec timed out after {:?}", timeout);
                    Ok(ExecResult {
                        exit_code: 124,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        timed_out: true,
                        truncated: false,
                    })
                }
            }
        }

        async fn inspect(&self, container_id: &str) -> DriverResult<ContainerInspection> {
            match self.docker.inspect_container(container_id, None).await {
                Ok(info) => {
                    let running = info
                        .state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false);
                    let created_at = info
                        .created
                        .as_ref()
                        .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
                        .map(|dt| dt.timestamp())
                        .unwrap_or(0);
                    Ok(ContainerInspection {
                        state: if running {
                            ContainerState::Running
                        } else {
                            ContainerState::Stopped
                        },
                        created_at,
                    })
                }
                Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                    Ok(ContainerInspection {
                        state: ContainerState::Missing,
                        created_at: 0,
                    })
                }
                Err(e) => Err(Self::map_err(e)),
            }
        }

        async fn remove(&self, container_id: &str, force: bool) -> DriverResult<()> {
            match self
                .docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => Ok(()),
                Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
                Err(e) => Err(Self::map_err(e)),
            }
        }

        async fn list(&self, label_filter: &str) -> DriverResult<Vec<ContainerSummary>> {
            let mut filters = HashMap::new();
            filters.insert("label".to_string(), vec![label_filter.to_string()]);
            let options = bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            };
            let containers = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(Self::map_err)?;
            Ok(containers
                .into_iter()
                .filter_map(|c| {
                    let id = c.id?;
                    let labels = c.labels.unwrap_or_default();
                    Some(ContainerSummary { id, labels })
                })
                .collect())
        }

        async fn volume_create(&self, name: &str) -> DriverResult<()> {
            match self.docker.inspect_volume(name).await {
                Ok(_) => return Ok(()),
                Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {}
                Err(e) => return Err(Self::map_err(e)),
            }
            self.docker
                .create_volume(CreateVolumeOptions {
                    name: name.to_string(),
                    driver: "local".to_string(),
                    ..Default::default()
                })
                .await
                .map_err(Self::map_err)?;
            info!(volume = name, "created workspace volume");
            Ok(())
        }

        async fn volume_remove(&self, name: &str) -> DriverResult<()> {
            match self
                .docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                Ok(()) => Ok(()),
                Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
                Err(e) => Err(Self::map_err(e)),
            }
        }

        async fn download_file(&self, container_id: &str, path: &str) -> DriverResult<Vec<u8>> {
            let mut stream = self.docker.download_from_container(
                container_id,
                Some(DownloadFromContainerOptions { path: path.to_string() }),
            );
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk.map_err(Self::map_err)?);
            }
            Ok(buf)
        }

        async fn upload_file(
            &self,
            container_id: &str,
            path: &str,
            contents: &[u8],
        ) -> DriverResult<()> {
            // `path` is an absolute container path (e.g. "/workspace/a/b.txt").
            // The tar is unpacked at container root "/", so every entry name
            // must carry the full path relative to root, not just the
            // trailing component — otherwise the file lands at the root
            // instead of inside the intended directory.
            let full_path = path.trim_start_matches('/').to_string();
            let dir = full_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");

            let mut tar_data = Vec::new();
            {
                let mut archive = Builder::new(Cursor::new(&mut tar_data));
                if !dir.is_empty() {
                    let mut components = String::new();
                    for component in dir.split('/').filter(|c| !c.is_empty()) {
                        if !components.is_empty() {
                            components.push('/');
                        }
                        components.push_str(component);
                        let mut header = Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_mode(0o755);
                        header.set_size(0);
                        header.set_uid(1000);
                        header.set_gid(1000);
                        header.set_cksum();
                        archive
                            .append_data(&mut header, format!("{components}/"), std::io::empty())
                            .map_err(|e| DriverError::Other(e.to_string()))?;
                    }
                }

                let mut header = Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_uid(1000);
                header.set_gid(1000);
                header.set_cksum();
                archive
                    .append_data(&mut header, &full_path, contents)
                    .map_err(|e| DriverError::Other(e.to_string()))?;
                archive
                    .finish()
                    .map_err(|e| DriverError::Other(e.to_string()))?;
            }

            self.docker
                .upload_to_container(
                    container_id,
                    Some(UploadToContainerOptions {
                        path: "/".to_string(),
                        ..Default::default()
                    }),
                    tar_data.into(),
                )
                .await
                .map_err(Self::map_err)
        }
    }
}

pub use bollard_driver::BollardDriver;

#[cfg(test)]
pub mod fake {
    //! In-memory `ContainerDriver` fake used across the core's unit tests,
    //! keeping them independent of a real Docker daemon.
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    #[derive(Debug, Clone)]
    struct FakeContainer {
        labels: HashMap<String, String>,
        running: bool,
        created_at: i64,
        files: BTreeMap<String, Vec<u8>>,
    }

    pub struct FakeDriver {
        containers: Mutex<HashMap<String, FakeContainer>>,
        volumes: Mutex<HashMap<String, ()>>,
        next_id: AtomicU64,
        pub fail_creates: std::sync::atomic::AtomicBool,
        pub create_count: AtomicU64,
        clock: AtomicU64,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            Self {
                containers: Mutex::new(HashMap::new()),
                volumes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fail_creates: std::sync::atomic::AtomicBool::new(false),
                create_count: AtomicU64::new(0),
                clock: AtomicU64::new(1_700_000_000),
            }
        }
    }

    impl FakeDriver {
        pub fn advance_clock(&self, secs: u64) {
            self.clock.fetch_add(secs, Ordering::SeqCst);
        }

        pub fn container_count(&self) -> usize {
            self.containers.lock().unwrap().len()
        }

        pub fn volume_count(&self) -> usize {
            self.volumes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn create(&self, spec: ContainerSpec) -> DriverResult<String> {
            self.create_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(DriverError::EngineUnavailable("forced failure".into()));
            }
            let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let now = self.clock.load(Ordering::SeqCst) as i64;
            self.containers.lock().unwrap().insert(
                id.clone(),
                FakeContainer {
                    labels: spec.labels,
                    running: false,
                    created_at: now,
                    files: BTreeMap::new(),
                },
            );
            Ok(id)
        }

        async fn start(&self, container_id: &str) -> DriverResult<()> {
            let mut guard = self.containers.lock().unwrap();
            let c = guard
                .get_mut(container_id)
                .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
            c.running = true;
            Ok(())
        }

        async fn exec(
            &self,
            container_id: &str,
            argv: &[String],
            _working_dir: &str,
            timeout: Duration,
        ) -> DriverResult<ExecResult> {
            {
                let guard = self.containers.lock().unwrap();
                if !guard.contains_key(container_id) {
                    return Err(DriverError::NotFound(container_id.to_string()));
                }
            }

            let start = std::time::Instant::now();
            if argv.iter().any(|a| a == "sleep") {
                let secs: u64 = argv
                    .iter()
                    .skip_while(|a| *a != "sleep")
                    .nth(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let sim = Duration::from_secs(secs);
                if sim > timeout {
                    sleep(timeout).await;
                    return Ok(ExecResult {
                        exit_code: 124,
                        timed_out: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                        ..Default::default()
                    });
                }
                sleep(sim).await;
            }

            let joined = argv.join(" ");
            let stdout = if argv.first().map(String::as_str) == Some("echo") {
                format!("{}\n", argv[1..].join(" ")).into_bytes()
            } else {
                format!("ran: {joined}\n").into_bytes()
            };

            Ok(ExecResult {
                exit_code: 0,
                stdout,
                stderr: Vec::new(),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
                truncated: false,
            })
        }

        async fn inspect(&self, container_id: &str) -> DriverResult<ContainerInspection> {
            let guard = self.containers.lock().unwrap();
            match guard.get(container_id) {
                Some(c) => Ok(ContainerInspection {
                    state: if c.running {
                        ContainerState::Running
                    } else {
                        ContainerState::Stopped
                    },
                    created_at: c.created_at,
                }),
                None => Ok(ContainerInspection {
                    state: ContainerState::Missing,
                    created_at: 0,
                }),
            }
        }

        async fn remove(&self, container_id: &str, _force: bool) -> DriverResult<()> {
            self.containers.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn list(&self, label_filter: &str) -> DriverResult<Vec<ContainerSummary>> {
            let (key, value) = label_filter
                .split_once('=')
                .unwrap_or((label_filter, "true"));
            let guard = self.containers.lock().unwrap();
            Ok(guard
                .iter()
                .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
                .map(|(id, c)| ContainerSummary {
                    id: id.clone(),
                    labels: c.labels.clone(),
                })
                .collect())
        }

        async fn volume_create(&self, name: &str) -> DriverResult<()> {
            self.volumes.lock().unwrap().insert(name.to_string(), ());
            Ok(())
        }

        async fn volume_remove(&self, name: &str) -> DriverResult<()> {
            self.volumes.lock().unwrap().remove(name);
            Ok(())
        }

        async fn download_file(&self, container_id: &str, path: &str) -> DriverResult<Vec<u8>> {
            let guard = self.containers.lock().unwrap();
            let c = guard
                .get(container_id)
                .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
            c.files
                .get(path)
                .cloned()
                .ok_or_else(|| DriverError::NotFound(path.to_string()))
        }

        async fn upload_file(
            &self,
            container_id: &str,
            path: &str,
            contents: &[u8],
        ) -> DriverResult<()> {
            let mut guard = self.containers.lock().unwrap();
            let c = guard
                .get_mut(container_id)
                .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
            c.files.insert(path.to_string(), contents.to_vec());
            Ok(())
        }
    }
}
