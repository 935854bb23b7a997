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

//! The polymorphic half of the engine: a `Streamer` trait every concrete
//! poller (`cfnstack`, `cfnstackset`, `ecsservice`) implements, a generic
//! subscriber fan-out helper, and the driver loop that repeatedly calls
//! `fetch`/`notify` on a `Streamer` until it is done, errors, or is
//! cancelled.

pub mod subscribers;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
pub use subscribers::Subscribers;
use tokio_util::sync::CancellationToken;

/// The result of a single `fetch`.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    /// The absolute time at which the next `fetch` should be attempted.
    pub next_at: SystemTime,
    /// Whether this streamer has reached a terminal state; `true` means no
    /// more events will ever be produced and the driver should stop.
    pub done: bool,
}

impl FetchOutcome {
    /// Builds an outcome that is not yet done.
    pub fn pending(next_at: SystemTime) -> Self {
        Self { next_at, done: false }
    }

    /// Builds an outcome that has reached a terminal state.
    pub fn done(next_at: SystemTime) -> Self {
        Self { next_at, done: true }
    }
}

/// Capability shared by every concrete poller: fetch fresh events, publish
/// whatever was buffered to subscribers, and release subscribers on exit.
///
/// The driver depends only on this untyped capability; it never touches the
/// typed `Subscribe()` surface each concrete streamer also exposes.
#[async_trait]
pub trait Streamer: Send {
    /// The error a failed remote call surfaces as.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches fresh events from the remote control plane, buffering them
    /// for the next `notify`. Throttling must never surface here as an
    /// error — only as a larger `next_at`.
    async fn fetch(&mut self) -> Result<FetchOutcome, Self::Error>;

    /// Publishes whatever is buffered to current subscribers and clears the
    /// buffer.
    async fn notify(&mut self);

    /// Stops publishing and releases all subscribers. Idempotent.
    async fn close(&mut self);
}

/// Why [`drive`] stopped before its `Streamer` reported `done`.
#[derive(thiserror::Error, Debug)]
pub enum DriveError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The supplied `CancellationToken` was cancelled.
    #[error("stream cancelled")]
    Cancelled,
    /// `fetch` returned an error.
    #[error(transparent)]
    Fetch(#[from] E),
}

/// Repeatedly calls `fetch` then `notify` on `streamer`, honoring the
/// backoff delay `fetch` returns and `cancel`. Closes `streamer` exactly
/// once, on every exit path.
pub async fn drive<S>(cancel: CancellationToken, mut streamer: S) -> Result<(), DriveError<S::Error>>
where
    S: Streamer,
{
    let mut next_at = SystemTime::now();

    loop {
        let delay = next_at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);

        tokio::select! {
            () = cancel.cancelled() => {
                streamer.close().await;
                return Err(DriveError::Cancelled);
            }
            () = tokio::time::sleep(delay) => {}
        }

        match streamer.fetch().await {
            Err(err) => {
                streamer.close().await;
                return Err(DriveError::Fetch(err));
            }
            Ok(outcome) => {
                streamer.notify().await;

                if outcome.done {
                    streamer.close().await;
                    return Ok(());
                }

                next_at = outcome.next_at;
            }
        }
    }
}
