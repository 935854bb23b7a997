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

//! Polls a container-service deployment: derives a done-state from its
//! deployments, filters stopped tasks and failure-keyword service events
//! down to the ones caused by the deployment under observation, and
//! surfaces alarm statuses when the service's deployment configuration
//! enables them.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use backoff::{BackoffConfig, Clock, Rng, SystemClock, SystemRng};
use ecs::{
    AlarmStatus, CloudWatchDescriber, DeploymentStatus, EcsDeployment, EcsServiceDescriber,
    EcsServiceSnapshot, RemoteError, RolloutState,
};
use streamer::{FetchOutcome, Streamer, Subscribers};
use tokio::sync::mpsc;

/// The default substring a stopped task's reason is checked against to
/// recognize an auto-scaling-originated stop, rather than one caused by the
/// deployment under observation.
pub const DEFAULT_SCALING_STOP_MARKER: &str = "auto scaling";

/// Case-insensitive substrings that mark a service event's message as a
/// failure worth surfacing.
const FAILURE_KEYWORDS: &[&str] = &[
    "fail",
    "unhealthy",
    "error",
    "throttle",
    "unable",
    "missing",
    "alarm detected",
    "rolling back",
];

/// Errors a [`ServiceStreamer`]'s `fetch` can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// `Service` failed for a reason other than throttling.
    #[error("fetch service description: {source}")]
    FetchServiceDescription {
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
    /// `StoppedServiceTasks` failed for a reason other than throttling.
    #[error("fetch stopped tasks: {source}")]
    FetchStoppedTasks {
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
    /// `AlarmStatuses` failed for a reason other than throttling.
    #[error("retrieve alarm statuses: {source}")]
    RetrieveAlarmStatuses {
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
}

struct FetchState {
    seen_event_ids: HashSet<String>,
    buffer: Vec<EcsServiceSnapshot>,
    retries: u32,
}

/// Polls one container service's deployment, buffering a full
/// [`EcsServiceSnapshot`] per successful fetch.
pub struct ServiceStreamer<SD, AD, C = SystemClock, R = SystemRng> {
    service_client: Arc<SD>,
    alarm_client: Arc<AD>,
    clock: C,
    rng: R,
    backoff: BackoffConfig,
    cluster: String,
    service: String,
    deployment_start: SystemTime,
    scaling_stop_marker: String,
    state: Mutex<FetchState>,
    subscribers: Subscribers<EcsServiceSnapshot>,
}

impl<SD, AD> ServiceStreamer<SD, AD, SystemClock, SystemRng>
where
    SD: EcsServiceDescriber,
    AD: CloudWatchDescriber,
{
    /// Creates a streamer for `service` in `cluster`, only considering
    /// deployment activity at or after `deployment_start`, using the
    /// default scaling-stop marker, the system clock, and the system RNG.
    pub fn new(
        service_client: Arc<SD>,
        alarm_client: Arc<AD>,
        cluster: impl Into<String>,
        service: impl Into<String>,
        deployment_start: SystemTime,
    ) -> Self {
        Self::with_parts(
            service_client,
            alarm_client,
            SystemClock,
            SystemRng,
            BackoffConfig::default(),
            cluster,
            service,
            deployment_start,
            DEFAULT_SCALING_STOP_MARKER,
        )
    }
}

impl<SD, AD, C, R> ServiceStreamer<SD, AD, C, R>
where
    SD: EcsServiceDescriber,
    AD: CloudWatchDescriber,
    C: Clock,
    R: Rng,
{
    /// Creates a streamer with every injected dependency made explicit.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        service_client: Arc<SD>,
        alarm_client: Arc<AD>,
        clock: C,
        rng: R,
        backoff: BackoffConfig,
        cluster: impl Into<String>,
        service: impl Into<String>,
        deployment_start: SystemTime,
        scaling_stop_marker: impl Into<String>,
    ) -> Self {
        Self {
            service_client,
            alarm_client,
            clock,
            rng,
            backoff,
            cluster: cluster.into(),
            service: service.into(),
            deployment_start,
            scaling_stop_marker: scaling_stop_marker.into(),
            state: Mutex::new(FetchState {
                seen_event_ids: HashSet::new(),
                buffer: Vec::new(),
                retries: 0,
            }),
            subscribers: Subscribers::new(),
        }
    }

    /// Registers a new subscriber. Returns an already-closed channel if
    /// this streamer has already been closed.
    pub fn subscribe(&self) -> mpsc::Receiver<EcsServiceSnapshot> {
        self.subscribers.subscribe(1)
    }
}

/// Whether `deployment` alone makes the service "done". A non-primary deployment never is.
fn deployment_is_done(deployment: &EcsDeployment, deployment_start: SystemTime) -> bool {
    if deployment.status != DeploymentStatus::Primary {
        return false;
    }
    if deployment.updated_at < deployment_start {
        return false;
    }

    match deployment.rollout_state {
        RolloutState::Failed => true,
        RolloutState::Completed | RolloutState::Empty => deployment.desired_count == deployment.running_count,
    }
}

fn matches_failure_keyword(message: &str) -> bool {
    let lower = message.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

#[async_trait]
impl<SD, AD, C, R> Streamer for ServiceStreamer<SD, AD, C, R>
where
    SD: EcsServiceDescriber + Send + Sync,
    AD: CloudWatchDescriber + Send + Sync,
    C: Clock + Send,
    R: Rng + Send,
{
    type Error = FetchError;

    async fn fetch(&mut self) -> Result<FetchOutcome, Self::Error> {
        let description = match self.service_client.service(&self.cluster, &self.service).await {
            Ok(description) => description,
            Err(err) if err.is_throttled() => return Ok(self.throttled()),
            Err(source) => {
                return Err(FetchError::FetchServiceDescription { source })
            }
        };

        let deployments: Vec<EcsDeployment> = description.deployments.into_iter().map(EcsDeployment::from).collect();
        let done = deployments.iter().any(|d| deployment_is_done(d, self.deployment_start));
        let primary_deployment_id = deployments
            .iter()
            .find(|d| d.status == DeploymentStatus::Primary)
            .map(|d| d.id.clone());

        let stopped_tasks = match self.service_client.stopped_service_tasks(&self.cluster, &self.service).await {
            Ok(tasks) => tasks,
            Err(err) if err.is_throttled() => return Ok(self.throttled()),
            Err(source) => {
                return Err(FetchError::FetchStoppedTasks { source })
            }
        };

        let mut stopped_tasks: Vec<_> = stopped_tasks
            .into_iter()
            .filter(|task| {
                Some(&task.started_by) == primary_deployment_id.as_ref()
                    && task.stopped_at >= self.deployment_start
                    && !task.stopped_reason.to_lowercase().contains(&self.scaling_stop_marker.to_lowercase())
            })
            .collect();
        stopped_tasks.sort_by(|a, b| b.stopped_at.cmp(&a.stopped_at));

        let mut seen_event_ids = {
            let state = self.state.lock().expect("service streamer state mutex poisoned");
            state.seen_event_ids.clone()
        };

        let mut latest_failure_events = Vec::new();
        for event in &description.events {
            if event.created_at < self.deployment_start || seen_event_ids.contains(&event.id) {
                break;
            }
            let _ = seen_event_ids.insert(event.id.clone());
            if matches_failure_keyword(&event.message) {
                latest_failure_events.push(event.message.clone());
            }
        }

        let alarms = if description.alarms_enabled {
            match self.alarm_client.alarm_statuses(&description.alarm_names).await {
                Ok(alarms) => alarms,
                Err(err) if err.is_throttled() => return Ok(self.throttled()),
                Err(source) => {
                    return Err(FetchError::RetrieveAlarmStatuses { source })
                }
            }
        } else {
            Vec::<AlarmStatus>::new()
        };

        let snapshot = EcsServiceSnapshot {
            deployments,
            latest_failure_events,
            alarms,
            stopped_tasks,
        };

        {
            let mut state = self.state.lock().expect("service streamer state mutex poisoned");
            state.seen_event_ids = seen_event_ids;
            state.buffer.push(snapshot);
            state.retries = 0;
        }

        let next_at = backoff::next_fetch_at(0, &self.backoff, &self.clock, &mut self.rng);
        Ok(FetchOutcome { next_at, done })
    }

    async fn notify(&mut self) {
        let batch = {
            let mut state = self.state.lock().expect("service streamer state mutex poisoned");
            std::mem::take(&mut state.buffer)
        };

        self.subscribers.notify_all(batch).await;
    }

    async fn close(&mut self) {
        self.subscribers.close();
    }
}

impl<SD, AD, C, R> ServiceStreamer<SD, AD, C, R>
where
    C: Clock,
    R: Rng,
{
    fn throttled(&mut self) -> FetchOutcome {
        let next_at = {
            let mut state = self.state.lock().expect("service streamer state mutex poisoned");
            state.retries += 1;
            backoff::next_fetch_at(state.retries, &self.backoff, &self.clock, &mut self.rng)
        };
        tracing::debug!(cluster = %self.cluster, service = %self.service, "ecs describe call throttled");
        FetchOutcome::pending(next_at)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use ecs::{RawDeployment, ServiceDescription, ServiceEvent, StoppedTask};

    use super::*;

    struct FixedClock(SystemTime);
    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            self.0
        }
    }

    #[derive(Default)]
    struct ZeroRng;
    impl Rng for ZeroRng {
        fn below(&mut self, _bound: u64) -> u64 {
            0
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    /// Each fake client call pops one scripted result, so a `RemoteError`
    /// (which doesn't implement `Clone`) can still be scripted without a
    /// clone-on-every-call fake.
    struct FakeServiceClient {
        description: StdMutex<Option<Result<ServiceDescription, RemoteError>>>,
        stopped_tasks: StdMutex<Option<Result<Vec<StoppedTask>, RemoteError>>>,
    }

    #[async_trait]
    impl EcsServiceDescriber for FakeServiceClient {
        async fn service(&self, _cluster: &str, _service: &str) -> Result<ServiceDescription, RemoteError> {
            self.description
                .lock()
                .expect("description mutex poisoned")
                .take()
                .expect("service() called more than once in this test")
        }

        async fn stopped_service_tasks(&self, _cluster: &str, _service: &str) -> Result<Vec<StoppedTask>, RemoteError> {
            self.stopped_tasks
                .lock()
                .expect("stopped tasks mutex poisoned")
                .take()
                .expect("stopped_service_tasks() called more than once in this test")
        }
    }

    struct FakeAlarmClient {
        alarms: StdMutex<Option<Result<Vec<AlarmStatus>, RemoteError>>>,
    }

    #[async_trait]
    impl CloudWatchDescriber for FakeAlarmClient {
        async fn alarm_statuses(&self, _names: &[String]) -> Result<Vec<AlarmStatus>, RemoteError> {
            self.alarms
                .lock()
                .expect("alarms mutex poisoned")
                .take()
                .expect("alarm_statuses() called more than once in this test")
        }
    }

    fn epoch_plus(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn deployment(status: DeploymentStatus, rollout: RolloutState, desired: u32, running: u32, updated_at: SystemTime) -> RawDeployment {
        RawDeployment {
            id: "dep-1".to_string(),
            status,
            desired_count: desired,
            running_count: running,
            failed_count: 0,
            pending_count: 0,
            rollout_state: rollout,
            task_definition_arn: "arn:aws:ecs:us-west-2:1111:task-definition/webapp-test-frontend:3".to_string(),
            created_at: epoch_plus(0),
            updated_at,
        }
    }

    fn streamer_with(
        description: ServiceDescription,
        stopped_tasks: Vec<StoppedTask>,
        alarms: Vec<AlarmStatus>,
        deployment_start: SystemTime,
    ) -> ServiceStreamer<FakeServiceClient, FakeAlarmClient, FixedClock, ZeroRng> {
        streamer_with_results(Ok(description), Ok(stopped_tasks), Ok(alarms), deployment_start)
    }

    fn streamer_with_results(
        description: Result<ServiceDescription, RemoteError>,
        stopped_tasks: Result<Vec<StoppedTask>, RemoteError>,
        alarms: Result<Vec<AlarmStatus>, RemoteError>,
        deployment_start: SystemTime,
    ) -> ServiceStreamer<FakeServiceClient, FakeAlarmClient, FixedClock, ZeroRng> {
        ServiceStreamer::with_parts(
            Arc::new(FakeServiceClient {
                description: StdMutex::new(Some(description)),
                stopped_tasks: StdMutex::new(Some(stopped_tasks)),
            }),
            Arc::new(FakeAlarmClient {
                alarms: StdMutex::new(Some(alarms)),
            }),
            FixedClock(SystemTime::UNIX_EPOCH),
            ZeroRng,
            BackoffConfig::default(),
            "demo-cluster",
            "demo-service",
            deployment_start,
            DEFAULT_SCALING_STOP_MARKER,
        )
    }

    #[tokio::test]
    async fn done_when_primary_completed_and_counts_match() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Primary, RolloutState::Completed, 3, 3, epoch_plus(10))],
            events: vec![],
            alarms_enabled: false,
            alarm_names: vec![],
        };
        let mut s = streamer_with(description, vec![], vec![], epoch_plus(5));
        let outcome = s.fetch().await.expect("fetch should succeed");
        assert!(outcome.done);
    }

    #[tokio::test]
    async fn not_done_when_counts_still_diverge() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Primary, RolloutState::Completed, 3, 2, epoch_plus(10))],
            events: vec![],
            alarms_enabled: false,
            alarm_names: vec![],
        };
        let mut s = streamer_with(description, vec![], vec![], epoch_plus(5));
        let outcome = s.fetch().await.expect("fetch should succeed");
        assert!(!outcome.done);
    }

    #[tokio::test]
    async fn done_on_failed_rollout_regardless_of_counts() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Primary, RolloutState::Failed, 3, 1, epoch_plus(10))],
            events: vec![],
            alarms_enabled: false,
            alarm_names: vec![],
        };
        let mut s = streamer_with(description, vec![], vec![], epoch_plus(5));
        let outcome = s.fetch().await.expect("fetch should succeed");
        assert!(outcome.done);
    }

    #[tokio::test]
    async fn non_primary_deployment_never_completes_the_stream_alone() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Active, RolloutState::Completed, 3, 3, epoch_plus(10))],
            events: vec![],
            alarms_enabled: false,
            alarm_names: vec![],
        };
        let mut s = streamer_with(description, vec![], vec![], epoch_plus(5));
        let outcome = s.fetch().await.expect("fetch should succeed");
        assert!(!outcome.done);
    }

    #[tokio::test]
    async fn stopped_tasks_are_filtered_and_sorted_newest_first() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Primary, RolloutState::Empty, 3, 1, epoch_plus(1))],
            events: vec![],
            alarms_enabled: false,
            alarm_names: vec![],
        };

        let tasks = vec![
            StoppedTask {
                id: "t1".to_string(),
                started_by: "dep-1".to_string(),
                stopped_at: epoch_plus(20),
                stopped_reason: "essential container exited".to_string(),
            },
            StoppedTask {
                id: "t2".to_string(),
                started_by: "dep-1".to_string(),
                stopped_at: epoch_plus(30),
                stopped_reason: "scaled down by Auto Scaling".to_string(),
            },
            StoppedTask {
                id: "t3".to_string(),
                started_by: "dep-0".to_string(),
                stopped_at: epoch_plus(25),
                stopped_reason: "essential container exited".to_string(),
            },
            StoppedTask {
                id: "t4".to_string(),
                started_by: "dep-1".to_string(),
                stopped_at: epoch_plus(10),
                stopped_reason: "essential container exited".to_string(),
            },
        ];

        let mut s = streamer_with(description, tasks, vec![], epoch_plus(5));
        let _ = s.fetch().await.expect("fetch should succeed");
        let mut rx = s.subscribe();
        s.notify().await;
        let snapshot = rx.try_recv().expect("one snapshot expected");

        let ids: Vec<_> = snapshot.stopped_tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["t1", "t4"]);
    }

    #[tokio::test]
    async fn failure_keyword_events_are_collected_until_the_lower_bound_or_a_seen_id() {
        let description = ServiceDescription {
            deployments: vec![deployment(DeploymentStatus::Primary, RolloutState::Empty, 3, 1, epoch_plus(1))],
            events: vec![
                ServiceEvent {
                    id: "e3".to_string(),
                    message: "service is unhealthy".to_string(),
                    created_at: epoch_plus(30),
                },
                ServiceEvent {
                    id: "e2".to_string(),
                    message: "steady state reached".to_string(),
                    created_at: epoch_plus(20),
                },
                ServiceEvent {
                    id: "e1".to_string(),
                    message: "rolling back deployment".to_string(),
                    created_at: epoch_plus(1),
                },
            ],
            alarms_enabled: false,
            alarm_names: vec![],
        };

        let mut s = streamer_with(description, vec![], vec![], epoch_plus(5));
        let _ = s.fetch().await.expect("fetch should succeed");
        let mut rx = s.subscribe();
        s.notify().await;
        let snapshot = rx.try_recv().expect("one snapshot expected");

        // e1 is before the lower bound: iteration stops there, never inspected.
        assert_eq!(snapshot.latest_failure_events, vec!["service is unhealthy"]);
    }

    #[tokio::test]
    async fn alarms_are_only_fetched_when_enabled() {
        let description = ServiceDescription {
            deployments: vec![],
            events: vec![],
            alarms_enabled: true,
            alarm_names: vec!["high-5xx".to_string()],
        };
        let alarms = vec![AlarmStatus {
            name: "high-5xx".to_string(),
            state: ecs::AlarmState::Alarm,
        }];

        let mut s = streamer_with(description, vec![], alarms, epoch_plus(5));
        let _ = s.fetch().await.expect("fetch should succeed");
        let mut rx = s.subscribe();
        s.notify().await;
        let snapshot = rx.try_recv().expect("one snapshot expected");
        assert_eq!(snapshot.alarms.len(), 1);
    }

    #[tokio::test]
    async fn other_errors_are_wrapped_with_the_stable_message_prefix() {
        let mut s = streamer_with_results(Err(RemoteError::other(Boom)), Ok(vec![]), Ok(vec![]), epoch_plus(5));
        let err = s.fetch().await.expect_err("non-throttling error must surface");
        assert_eq!(err.to_string(), "fetch service description: boom");
    }
}
