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

//! Polls a single stack's event log, de-duplicates and chronologically
//! orders the events, compresses them by physical resource id, and fans
//! them out to subscribers.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use backoff::{BackoffConfig, Clock, Rng, SystemClock, SystemRng};
use cfn::{DefaultInProgressPredicate, InProgressPredicate, RemoteError, StackEvent, StackEventsDescriber};
use streamer::{FetchOutcome, Streamer, Subscribers};
use tokio::sync::mpsc;

/// Errors a [`StackStreamer`]'s `fetch` can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// `DescribeStackEvents` failed for a reason other than throttling.
    #[error("describe stack events {stack_id}: {source}")]
    DescribeStackEvents {
        /// The stack identifier (bare name or ARN-like id) passed to the call.
        stack_id: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
}

struct FetchState {
    seen: HashSet<String>,
    buffer: Vec<StackEvent>,
    retries: u32,
}

/// Polls one stack's event log.
///
/// Constructed with its remote client, stack identifier, and the
/// change-set creation timestamp (the lower bound in time for events of
/// interest); used by exactly one fetch/notify driver; closed exactly
/// once.
pub struct StackStreamer<D, P = DefaultInProgressPredicate, C = SystemClock, R = SystemRng> {
    client: Arc<D>,
    predicate: P,
    clock: C,
    rng: R,
    backoff: BackoffConfig,
    stack_id: String,
    stack_name: String,
    lower_bound: SystemTime,
    state: Mutex<FetchState>,
    subscribers: Subscribers<StackEvent>,
}

impl<D> StackStreamer<D, DefaultInProgressPredicate, SystemClock, SystemRng>
where
    D: StackEventsDescriber,
{
    /// Creates a streamer for `stack_id_or_name`, only considering events
    /// at or after `lower_bound`, using the default in-progress predicate,
    /// the system clock, and the system RNG.
    pub fn new(client: Arc<D>, stack_id_or_name: impl Into<String>, lower_bound: SystemTime) -> Self {
        Self::with_parts(
            client,
            DefaultInProgressPredicate,
            SystemClock,
            SystemRng,
            BackoffConfig::default(),
            stack_id_or_name,
            lower_bound,
        )
    }
}

impl<D, P, C, R> StackStreamer<D, P, C, R>
where
    D: StackEventsDescriber,
    P: InProgressPredicate,
    C: Clock,
    R: Rng,
{
    /// Creates a streamer with every injected dependency made explicit;
    /// used directly by tests that need a deterministic clock/RNG or a
    /// non-default in-progress predicate.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        client: Arc<D>,
        predicate: P,
        clock: C,
        rng: R,
        backoff: BackoffConfig,
        stack_id_or_name: impl Into<String>,
        lower_bound: SystemTime,
    ) -> Self {
        let stack_id = stack_id_or_name.into();
        let stack_name = cfn::arn::stack_name(&stack_id);
        Self {
            client,
            predicate,
            clock,
            rng,
            backoff,
            stack_id,
            stack_name,
            lower_bound,
            state: Mutex::new(FetchState {
                seen: HashSet::new(),
                buffer: Vec::new(),
                retries: 0,
            }),
            subscribers: Subscribers::new(),
        }
    }

    /// The stack's readable name.
    pub fn name(&self) -> String {
        self.stack_name.clone()
    }

    /// The stack's region, if its identifier was ARN-shaped.
    pub fn region(&self) -> Option<String> {
        cfn::arn::stack_region(&self.stack_id)
    }

    /// Registers a new subscriber. Returns an already-closed channel if
    /// this streamer has already been closed.
    pub fn subscribe(&self) -> mpsc::Receiver<StackEvent> {
        self.subscribers.subscribe(1)
    }
}

#[async_trait]
impl<D, P, C, R> Streamer for StackStreamer<D, P, C, R>
where
    D: StackEventsDescriber + Send + Sync,
    P: InProgressPredicate + Send,
    C: Clock + Send,
    R: Rng + Send,
{
    type Error = FetchError;

    async fn fetch(&mut self) -> Result<FetchOutcome, Self::Error> {
        let (mut seen, retries) = {
            let state = self.state.lock().expect("stack streamer state mutex poisoned");
            (state.seen.clone(), state.retries)
        };

        let mut batch: Vec<StackEvent> = Vec::new();
        let mut next_token: Option<String> = None;
        let mut terminal_on_self = false;

        loop {
            let page = match self
                .client
                .describe_stack_events(&self.stack_id, next_token.clone())
                .await
            {
                Ok(page) => page,
                Err(err) if err.is_throttled() => {
                    let mut state = self.state.lock().expect("stack streamer state mutex poisoned");
                    state.retries += 1;
                    let next_at = backoff::next_fetch_at(state.retries, &self.backoff, &self.clock, &mut self.rng);
                    tracing::debug!(stack_id = %self.stack_id, retries = state.retries, "describe stack events throttled");
                    return Ok(FetchOutcome::pending(next_at));
                }
                Err(source) => {
                    return Err(FetchError::DescribeStackEvents {
                        stack_id: self.stack_id.clone(),
                        source,
                    })
                }
            };

            let mut finished = false;
            for event in page.events {
                if event.timestamp < self.lower_bound || seen.contains(&event.event_id) {
                    finished = true;
                    break;
                }

                if event.logical_resource_id == self.stack_name && !self.predicate.is_in_progress(&event.resource_status)
                {
                    terminal_on_self = true;
                }

                let _ = seen.insert(event.event_id.clone());
                batch.push(event);
            }

            if finished || page.next_token.is_none() {
                break;
            }
            next_token = page.next_token;
        }

        // The remote API returns newest-first; reverse to chronological order.
        batch.reverse();

        {
            let mut state = self.state.lock().expect("stack streamer state mutex poisoned");
            state.seen = seen;
            state.buffer.extend(batch);
            state.retries = 0;
        }

        let next_at = backoff::next_fetch_at(0, &self.backoff, &self.clock, &mut self.rng);
        Ok(FetchOutcome { next_at, done: terminal_on_self })
    }

    async fn notify(&mut self) {
        let batch = {
            let mut state = self.state.lock().expect("stack streamer state mutex poisoned");
            std::mem::take(&mut state.buffer)
        };

        self.subscribers.notify_all(compress(batch)).await;
    }

    async fn close(&mut self) {
        self.subscribers.close();
    }
}

/// Retains only the last (most recent) event per physical resource id,
/// preserving chronological order.
fn compress(batch: Vec<StackEvent>) -> Vec<StackEvent> {
    let mut seen_physical_ids: HashSet<String> = HashSet::new();
    let mut kept: Vec<StackEvent> = Vec::new();

    for event in batch.into_iter().rev() {
        if seen_physical_ids.insert(event.physical_resource_id.clone()) {
            kept.push(event);
        }
    }

    kept.reverse();
    kept
}
