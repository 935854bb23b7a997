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

//! Polls one stack-set operation and expands its currently in-progress
//! instances into child stack streamers, one per region.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use backoff::{BackoffConfig, Clock, Rng, SystemClock, SystemRng};
use cfn::{
    RemoteError, StackInstanceStatus, StackSetDescriber, StackSetOpEvent, StackSetOperation,
};
use cfnstack::StackStreamer;
use streamer::{FetchOutcome, Streamer, Subscribers};
use tokio::sync::mpsc;

/// The default interval `instance_streamers` waits between instance-summary
/// re-queries while no in-progress instance has appeared yet.
pub const DEFAULT_INSTANCE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors a [`StackSetStreamer`]'s `fetch` can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// `DescribeOperation` failed for a reason other than throttling.
    #[error("describe operation \"{operation_id}\" for stack set \"{stack_set_name}\": {source}")]
    DescribeOperation {
        /// The stack set's name.
        stack_set_name: String,
        /// The operation's id.
        operation_id: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
}

/// Errors [`instance_streamers`] can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExpansionError {
    /// `InstanceSummaries` failed.
    #[error("describe in progress stack instances for stack set \"{stack_set_name}\": {source}")]
    InstanceSummaries {
        /// The stack set's name.
        stack_set_name: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
    /// `DescribeOperation` failed while re-checking whether to keep polling
    /// for instances.
    #[error("describe operation \"{operation_id}\" for stack set \"{stack_set_name}\": {source}")]
    DescribeOperation {
        /// The stack set's name.
        stack_set_name: String,
        /// The operation's id.
        operation_id: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
}

struct OpState {
    cur_op: Option<StackSetOperation>,
    last_sent_op: Option<StackSetOperation>,
    retries: u32,
}

/// Polls a single stack-set operation, emitting a [`StackSetOpEvent`] each
/// time the observed operation changes.
pub struct StackSetStreamer<D, C = SystemClock, R = SystemRng> {
    client: Arc<D>,
    clock: C,
    rng: R,
    backoff: BackoffConfig,
    stack_set_name: String,
    operation_id: String,
    state: Mutex<OpState>,
    subscribers: Subscribers<StackSetOpEvent>,
}

impl<D> StackSetStreamer<D, SystemClock, SystemRng>
where
    D: StackSetDescriber,
{
    /// Creates a streamer for `operation_id` against `stack_set_name`, using
    /// the system clock and the system RNG.
    pub fn new(client: Arc<D>, stack_set_name: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::with_parts(
            client,
            SystemClock,
            SystemRng,
            BackoffConfig::default(),
            stack_set_name,
            operation_id,
        )
    }
}

impl<D, C, R> StackSetStreamer<D, C, R>
where
    D: StackSetDescriber,
    C: Clock,
    R: Rng,
{
    /// Creates a streamer with every injected dependency made explicit.
    pub fn with_parts(
        client: Arc<D>,
        clock: C,
        rng: R,
        backoff: BackoffConfig,
        stack_set_name: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            clock,
            rng,
            backoff,
            stack_set_name: stack_set_name.into(),
            operation_id: operation_id.into(),
            state: Mutex::new(OpState {
                cur_op: None,
                last_sent_op: None,
                retries: 0,
            }),
            subscribers: Subscribers::new(),
        }
    }

    /// The stack set's name.
    pub fn name(&self) -> &str {
        &self.stack_set_name
    }

    /// Registers a new subscriber. Returns an already-closed channel if
    /// this streamer has already been closed.
    pub fn subscribe(&self) -> mpsc::Receiver<StackSetOpEvent> {
        self.subscribers.subscribe(1)
    }
}

#[async_trait]
impl<D, C, R> Streamer for StackSetStreamer<D, C, R>
where
    D: StackSetDescriber + Send + Sync,
    C: Clock + Send,
    R: Rng + Send,
{
    type Error = FetchError;

    async fn fetch(&mut self) -> Result<FetchOutcome, Self::Error> {
        match self.client.describe_operation(&self.stack_set_name, &self.operation_id).await {
            Err(err) if err.is_throttled() => {
                let mut state = self.state.lock().expect("stack-set streamer state mutex poisoned");
                state.retries += 1;
                let next_at = backoff::next_fetch_at(state.retries, &self.backoff, &self.clock, &mut self.rng);
                tracing::debug!(
                    stack_set_name = %self.stack_set_name,
                    operation_id = %self.operation_id,
                    retries = state.retries,
                    "describe operation throttled"
                );
                Ok(FetchOutcome::pending(next_at))
            }
            Err(source) => Err(FetchError::DescribeOperation {
                stack_set_name: self.stack_set_name.clone(),
                operation_id: self.operation_id.clone(),
                source,
            }),
            Ok(operation) => {
                let done = operation.status.is_completed();
                let mut state = self.state.lock().expect("stack-set streamer state mutex poisoned");
                state.cur_op = Some(operation);
                state.retries = 0;
                let next_at = backoff::next_fetch_at(0, &self.backoff, &self.clock, &mut self.rng);
                Ok(FetchOutcome { next_at, done })
            }
        }
    }

    async fn notify(&mut self) {
        let event = {
            let mut state = self.state.lock().expect("stack-set streamer state mutex poisoned");
            if state.cur_op == state.last_sent_op {
                None
            } else {
                state.last_sent_op = state.cur_op.clone();
                state.cur_op.clone().map(|operation| StackSetOpEvent {
                    name: self.stack_set_name.clone(),
                    operation,
                })
            }
        };

        if let Some(event) = event {
            self.subscribers.notify_all([event]).await;
        }
    }

    async fn close(&mut self) {
        self.subscribers.close();
    }
}

/// Expands a stack-set operation's currently in-progress instances into
/// child stack streamers, one per instance, constructed against the
/// instance's own region via `client_for_region`.
///
/// If no in-progress instance has a stack id yet, re-checks the operation:
/// while it remains in progress, waits `poll_interval` and re-queries
/// instance summaries, since instances can lag the operation's start.
pub async fn instance_streamers<D, F>(
    stack_set_describer: &(impl StackSetDescriber + ?Sized),
    stack_set_name: &str,
    operation_id: &str,
    op_start: SystemTime,
    client_for_region: F,
    poll_interval: Duration,
) -> Result<Vec<StackStreamer<D>>, ExpansionError>
where
    D: cfn::StackEventsDescriber,
    F: Fn(&str) -> Arc<D>,
{
    loop {
        let instances = stack_set_describer
            .instance_summaries(stack_set_name)
            .await
            .map_err(|source| ExpansionError::InstanceSummaries {
                stack_set_name: stack_set_name.to_string(),
                source,
            })?;

        let children: Vec<StackStreamer<D>> = instances
            .into_iter()
            .filter(|instance| instance.status == StackInstanceStatus::InProgress)
            .filter_map(|instance| {
                let stack_id = instance.stack_id.filter(|id| !id.is_empty())?;
                Some(StackStreamer::new(client_for_region(&instance.region), stack_id, op_start))
            })
            .collect();

        if !children.is_empty() {
            return Ok(children);
        }

        let operation = stack_set_describer
            .describe_operation(stack_set_name, operation_id)
            .await
            .map_err(|source| ExpansionError::DescribeOperation {
                stack_set_name: stack_set_name.to_string(),
                operation_id: operation_id.to_string(),
                source,
            })?;

        if operation.status.is_completed() {
            return Ok(Vec::new());
        }

        tracing::debug!(stack_set_name, operation_id, "no in-progress instances yet; retrying");
        tokio::time::sleep(poll_interval).await;
    }
}
