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

//! `deploywatch` tails in-flight cloud deployments and turns their progress
//! into ordered streams of events: a CloudFormation stack update, a
//! stack-set operation fanning out across regions, or a rolling ECS service
//! deployment.
//!
//! Each concrete poller (`cfnstack`, `cfnstackset`, `ecsservice`) implements
//! [`streamer::Streamer`]: fetch fresh events with bounded request rates and
//! jitter ([`backoff`]), de-duplicate and chronologically order them, and
//! fan them out to any number of in-process subscribers. [`streamer::drive`]
//! repeatedly calls fetch/notify on a streamer until it is done, errors, or
//! its cancellation token fires, closing the streamer exactly once on every
//! exit path. A stack-set streamer composes hierarchically: it discovers
//! its currently in-progress instances and spawns one child stack streamer
//! per region, each driven concurrently and independently.
//!
//! The `cfn` and `ecs` crates hold the collaborator traits a caller
//! implements against their actual control-plane client; this workspace
//! never talks to a remote API directly. `deployjobs` is the one
//! non-streaming piece in scope: given an app/env/job triple, it locates
//! the state-machine resource in that job's stack and invokes it.

pub use backoff;
pub use cfn;
pub use cfnstack;
pub use cfnstackset;
pub use deployjobs;
pub use ecs;
pub use ecsservice;
pub use streamer;
