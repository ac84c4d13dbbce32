//! Docker Swarm adapter for the cluster orchestrator contract.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    Limit, Mount, MountTypeEnum, MountVolumeOptions, MountVolumeOptionsDriverConfig,
    NetworkAttachmentConfig, ResourceObject, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, Task, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
    TaskSpecResources, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use bollard::service::InspectServiceOptions;
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Utc};
use coursehub_core::session::{
    ClusterOrchestratorClient, LaunchSpec, OrchestratorError, TaskFilter, TaskInfo, TaskState,
};
use coursehub_core::workspace::MountSpec;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Label linking driver-backed volumes to the service that created them.
pub const SERVICE_LABEL: &str = "coursehub.service";

/// Engine socket used when `DOCKER_HOST` does not name a unix socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// [`ClusterOrchestratorClient`] backed by the Docker Engine API.
///
/// Each session is a replicated service with exactly one replica and no
/// restart policy, so a crashed notebook surfaces as a failed task instead
/// of a restart loop.
///
/// Services and volumes go through `bollard`. The task list is read straight
/// from the engine socket, which `bollard` 0.18 does not expose.
#[derive(Clone)]
pub struct SwarmOrchestratorClient {
    docker: Docker,
    socket: PathBuf,
    http: Client<UnixConnector, Full<Bytes>>,
}

impl SwarmOrchestratorClient {
    /// Connects to the engine listening on `socket`.
    pub fn connect_unix(socket: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let socket = socket.into();
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(map_error)?;
        Ok(Self {
            docker,
            socket,
            http: Client::unix(),
        })
    }

    /// Connects through the unix socket named by `DOCKER_HOST`, or the
    /// default engine socket.
    pub fn connect_local() -> Result<Self, OrchestratorError> {
        let socket = std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| host.strip_prefix("unix://").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        Self::connect_unix(socket)
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value, OrchestratorError> {
        let path = format!("/v{}{}", self.docker.client_version(), path_and_query);
        let uri: Uri = HyperlocalUri::new(&self.socket, &path).into();
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(map_error(BollardError::DockerResponseServerError {
                status_code: status.as_u16(),
                message: server_message(&body),
            }));
        }
        serde_json::from_slice(&body).map_err(|e| {
            OrchestratorError::Transport(format!("malformed engine response for {}: {}", path, e))
        })
    }

    /// Removes every volume labelled for `service`.
    ///
    /// Volumes that are already gone are skipped; any other failure is
    /// returned after the remaining volumes have been attempted.
    async fn remove_service_volumes(&self, service: &str) -> Result<(), OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", SERVICE_LABEL, service)],
        );
        let volumes = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(map_error)?
            .volumes
            .unwrap_or_default();

        let mut failure = None;
        for volume in volumes {
            match self
                .docker
                .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
                .await
                .map_err(map_error)
            {
                Ok(()) => {
                    tracing::debug!(service = %service, volume = %volume.name, "Volume removed");
                }
                Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        service = %service,
                        volume = %volume.name,
                        error = %e,
                        "Failed to remove service volume"
                    );
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ClusterOrchestratorClient for SwarmOrchestratorClient {
    async fn create_service(&self, spec: &LaunchSpec) -> Result<String, OrchestratorError> {
        let response = self
            .docker
            .create_service(service_spec(spec), None)
            .await
            .map_err(map_error)?;
        let id = response.id.unwrap_or_else(|| spec.service_name.clone());
        tracing::info!(service = %spec.service_name, service_id = %id, "Service created");
        Ok(id)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, OrchestratorError> {
        let raw = self.get_json(&tasks_path(filter)?).await?;
        let tasks: Vec<Task> = serde_json::from_value(raw)
            .map_err(|e| OrchestratorError::Transport(format!("malformed task list: {}", e)))?;

        if tasks.is_empty() {
            // The task filter silently matches nothing for unknown services.
            self.docker
                .inspect_service(&filter.service, None::<InspectServiceOptions>)
                .await
                .map_err(map_error)?;
        }

        Ok(tasks.into_iter().map(task_info).collect())
    }

    /// Deletes the service, then its labelled volumes.
    ///
    /// Volumes are cleaned up even when the service is already gone, so a
    /// repeated teardown finishes what an earlier one left behind.
    async fn remove_service(&self, service: &str) -> Result<(), OrchestratorError> {
        match self.docker.delete_service(service).await.map_err(map_error) {
            Ok(()) => {
                tracing::info!(service = %service, "Service removed");
                self.remove_service_volumes(service).await
            }
            Err(OrchestratorError::NotFound(message)) => {
                self.remove_service_volumes(service).await?;
                Err(OrchestratorError::NotFound(message))
            }
            Err(e) => Err(e),
        }
    }
}

/// Request path listing the tasks selected by `filter`.
pub fn tasks_path(filter: &TaskFilter) -> Result<String, OrchestratorError> {
    let mut filters = BTreeMap::new();
    filters.insert("service", vec![filter.service.as_str()]);
    if filter.desired_running {
        filters.insert("desired-state", vec!["running"]);
    }
    let encoded = serde_json::to_string(&filters)
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

    let mut url = reqwest::Url::parse("http://engine/tasks")
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
    url.query_pairs_mut().append_pair("filters", &encoded);
    Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
}

fn server_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

/// Maps a Docker client error onto the orchestrator error taxonomy.
pub fn map_error(err: BollardError) -> OrchestratorError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => OrchestratorError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => OrchestratorError::Api {
            status_code,
            message,
        },
        other => OrchestratorError::Transport(other.to_string()),
    }
}

/// Builds the service definition for a session.
pub fn service_spec(spec: &LaunchSpec) -> ServiceSpec {
    let labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mounts = spec
        .mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| service_mount(&spec.service_name, index, mount))
        .collect();

    let container_spec = TaskSpecContainerSpec {
        image: Some(spec.image.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        user: spec.user.clone(),
        mounts: Some(mounts),
        labels: Some(labels.clone()),
        ..Default::default()
    };

    let limits = Limit {
        nano_cpus: spec.resources.cpu_limit_nanos(),
        memory_bytes: spec.resources.mem_limit.and_then(|m| i64::try_from(m).ok()),
        ..Default::default()
    };
    let reservations = ResourceObject {
        nano_cpus: spec.resources.cpu_guarantee_nanos(),
        memory_bytes: spec
            .resources
            .mem_guarantee
            .and_then(|m| i64::try_from(m).ok()),
        ..Default::default()
    };

    let task_template = TaskSpec {
        container_spec: Some(container_spec),
        resources: Some(TaskSpecResources {
            limits: Some(limits),
            reservations: Some(reservations),
        }),
        placement: (!spec.placement_constraints.is_empty()).then(|| TaskSpecPlacement {
            constraints: Some(spec.placement_constraints.clone()),
            ..Default::default()
        }),
        networks: (!spec.networks.is_empty()).then(|| {
            spec.networks
                .iter()
                .map(|network| NetworkAttachmentConfig {
                    target: Some(network.clone()),
                    ..Default::default()
                })
                .collect()
        }),
        restart_policy: Some(TaskSpecRestartPolicy {
            condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
            ..Default::default()
        }),
        ..Default::default()
    };

    ServiceSpec {
        name: Some(spec.service_name.clone()),
        labels: Some(labels),
        task_template: Some(task_template),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name of the driver-backed volume for the `index`-th mount of a service.
pub fn volume_name(service: &str, index: usize) -> String {
    format!("{}-{}", service, index)
}

fn service_mount(service: &str, index: usize, mount: &MountSpec) -> Mount {
    let target = Some(mount.container_path.to_string_lossy().into_owned());
    let host_path = mount.host_path.to_string_lossy().into_owned();
    let read_only = Some(mount.mode.is_read_only());

    match &mount.driver {
        None => Mount {
            target,
            source: Some(host_path),
            typ: Some(MountTypeEnum::BIND),
            read_only,
            ..Default::default()
        },
        Some(driver) => {
            let mut options: HashMap<String, String> = driver
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            options.insert("device".to_string(), host_path);

            let mut labels = HashMap::new();
            labels.insert(SERVICE_LABEL.to_string(), service.to_string());

            Mount {
                target,
                source: Some(volume_name(service, index)),
                typ: Some(MountTypeEnum::VOLUME),
                read_only,
                volume_options: Some(MountVolumeOptions {
                    labels: Some(labels),
                    driver_config: Some(MountVolumeOptionsDriverConfig {
                        name: Some(driver.name.clone()),
                        options: Some(options),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    }
}

/// Converts a Docker task into the orchestrator-neutral view.
pub fn task_info(task: Task) -> TaskInfo {
    let status = task.status.unwrap_or_default();
    let state = status
        .state
        .map(|s| TaskState::parse(&s.to_string()))
        .unwrap_or_else(|| TaskState::Unknown(String::new()));

    TaskInfo {
        id: task.id.unwrap_or_default(),
        state,
        message: status.message,
        error: status.err,
        updated_at: task
            .updated_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc)),
    }
}
