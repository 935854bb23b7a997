#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Collaborator traits and data model for an ECS-shaped rolling service
//! deployment: the service description, its deployments, stopped tasks,
//! service events, and CloudWatch alarm statuses. Consumed, never
//! implemented, by `ecsservice`; concrete clients live outside this
//! repository.

use std::time::SystemTime;

use async_trait::async_trait;

/// Error returned by a remote describe call. See `cfn::RemoteError` for the
/// rationale behind modeling throttling as data rather than a distinct
/// error type.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct RemoteError {
    source: Box<dyn std::error::Error + Send + Sync>,
    throttled: bool,
}

impl RemoteError {
    /// Wraps a fatal, non-throttling error from a remote call.
    pub fn other(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            throttled: false,
        }
    }

    /// Wraps a throttling error from a remote call.
    pub fn throttled(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            throttled: true,
        }
    }

    /// Whether this error represents rate limiting rather than a fatal
    /// failure.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }
}

/// A deployment's place in its service's deployment history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    /// The currently intended version ("primary deployment", glossary).
    Primary,
    /// An earlier version still draining.
    Active,
    /// Any other status string the control plane reports.
    Other(String),
}

/// A deployment's rollout outcome, independent of container-level counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    /// The rollout finished successfully.
    Completed,
    /// The rollout finished unsuccessfully.
    Failed,
    /// No rollout state has been reported yet.
    Empty,
}

/// One deployment within a service, as returned by the remote control
/// plane before the streamer derives its task-definition revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeployment {
    /// A remote-assigned id for this deployment.
    pub id: String,
    /// This deployment's place in the service's deployment history.
    pub status: DeploymentStatus,
    /// The desired task count.
    pub desired_count: u32,
    /// The currently running task count.
    pub running_count: u32,
    /// The currently failed task count.
    pub failed_count: u32,
    /// The currently pending task count.
    pub pending_count: u32,
    /// The rollout's outcome, if known.
    pub rollout_state: RolloutState,
    /// The task definition identifier this deployment runs, of the form
    /// `arn:...:task-definition/<family>:<revision>`.
    pub task_definition_arn: String,
    /// When this deployment was created.
    pub created_at: SystemTime,
    /// When this deployment was last updated.
    pub updated_at: SystemTime,
}

/// One deployment within a service, as built by the streamer from a
/// [`RawDeployment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsDeployment {
    /// A remote-assigned id for this deployment.
    pub id: String,
    /// This deployment's place in the service's deployment history.
    pub status: DeploymentStatus,
    /// The desired task count.
    pub desired_count: u32,
    /// The currently running task count.
    pub running_count: u32,
    /// The currently failed task count.
    pub failed_count: u32,
    /// The currently pending task count.
    pub pending_count: u32,
    /// The rollout's outcome, if known.
    pub rollout_state: RolloutState,
    /// The task definition revision this deployment runs, parsed from the
    /// raw deployment's `task_definition_arn` by [`task_definition_revision`].
    pub task_definition_revision: Option<String>,
    /// When this deployment was created.
    pub created_at: SystemTime,
    /// When this deployment was last updated.
    pub updated_at: SystemTime,
}

impl From<RawDeployment> for EcsDeployment {
    fn from(raw: RawDeployment) -> Self {
        Self {
            task_definition_revision: task_definition_revision(&raw.task_definition_arn),
            id: raw.id,
            status: raw.status,
            desired_count: raw.desired_count,
            running_count: raw.running_count,
            failed_count: raw.failed_count,
            pending_count: raw.pending_count,
            rollout_state: raw.rollout_state,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        }
    }
}

/// The state of one CloudWatch-shaped alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmState {
    /// The alarm's threshold is not breached.
    Ok,
    /// The alarm's threshold is breached.
    Alarm,
    /// The alarm has insufficient data to evaluate.
    InsufficientData,
}

/// One alarm's latest observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmStatus {
    /// The alarm's name.
    pub name: String,
    /// The alarm's current state.
    pub state: AlarmState,
}

/// A task that stopped, as returned before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedTask {
    /// A remote-assigned id for this task.
    pub id: String,
    /// The id of the deployment (or other actor) that started this task.
    pub started_by: String,
    /// When the task stopped.
    pub stopped_at: SystemTime,
    /// Why the task stopped, as reported by the control plane.
    pub stopped_reason: String,
}

/// One event recorded against a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    /// A remote-assigned id for this event.
    pub id: String,
    /// The event's free-form message.
    pub message: String,
    /// When the event was recorded.
    pub created_at: SystemTime,
}

/// The raw service description returned by `Service(cluster, service)`,
/// before the streamer applies any filtering.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescription {
    /// The service's deployments, in no particular guaranteed order.
    pub deployments: Vec<RawDeployment>,
    /// The service's recorded events, newest-first.
    pub events: Vec<ServiceEvent>,
    /// Whether the deployment configuration enables CloudWatch alarms.
    pub alarms_enabled: bool,
    /// The alarm names to query when `alarms_enabled`.
    pub alarm_names: Vec<String>,
}

/// The full per-poll snapshot emitted by the service-deployment streamer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcsServiceSnapshot {
    /// The service's deployments.
    pub deployments: Vec<EcsDeployment>,
    /// Failure-keyword-matching messages observed since the last poll that
    /// reached a new (unseen) service event.
    pub latest_failure_events: Vec<String>,
    /// The current alarm statuses, if alarms are enabled.
    pub alarms: Vec<AlarmStatus>,
    /// Stopped tasks belonging to the primary deployment, filtered and
    /// sorted.
    pub stopped_tasks: Vec<StoppedTask>,
}

/// Describes an ECS-shaped service and its stopped tasks.
#[async_trait]
pub trait EcsServiceDescriber: Send + Sync {
    /// Fetches the current description of `service` in `cluster`.
    async fn service(&self, cluster: &str, service: &str) -> Result<ServiceDescription, RemoteError>;

    /// Fetches recently stopped tasks of `service` in `cluster`, before any
    /// streamer-side filtering.
    async fn stopped_service_tasks(&self, cluster: &str, service: &str) -> Result<Vec<StoppedTask>, RemoteError>;
}

/// Fetches CloudWatch-shaped alarm statuses. The single option used is "with these names".
#[async_trait]
pub trait CloudWatchDescriber: Send + Sync {
    /// Fetches the current statuses of the alarms named in `names`.
    async fn alarm_statuses(&self, names: &[String]) -> Result<Vec<AlarmStatus>, RemoteError>;
}

/// Extracts the revision suffix from a task-definition identifier of the
/// form `arn:...:task-definition/<family>:<revision>`.
///
/// Takes the substring after the last `/`, then after the single `:`.
/// Returns `None` if the identifier doesn't have that shape.
pub fn task_definition_revision(task_definition_arn: &str) -> Option<String> {
    let after_slash = task_definition_arn.rsplit('/').next()?;
    let (_family, revision) = after_slash.split_once(':')?;
    Some(revision.to_string())
}
