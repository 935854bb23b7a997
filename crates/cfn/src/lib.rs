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

//! Collaborator traits and data model for a CloudFormation-shaped control
//! plane: stack events, stack-set operations, ARN parsing, and in-progress
//! status classification. Consumed, never implemented, by `cfnstack` and
//! `cfnstackset`; concrete clients live outside this repository.

pub mod arn;

use std::time::SystemTime;

use async_trait::async_trait;

/// One resource transition recorded against a stack.
///
/// Ordering key: `timestamp` ascending. Identity key (for de-dup):
/// `event_id`, unique within a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEvent {
    /// Remote-assigned id, unique within a stack.
    pub event_id: String,
    /// The logical name of the resource in the template.
    pub logical_resource_id: String,
    /// The physical id the control plane assigned to the resource.
    pub physical_resource_id: String,
    /// The resource's type (e.g. a provider-specific type name).
    pub resource_type: String,
    /// Free-form status string; interpreted by [`InProgressPredicate`].
    pub resource_status: String,
    /// Optional human-readable reason for the status.
    pub resource_status_reason: Option<String>,
    /// When the control plane recorded this event.
    pub timestamp: SystemTime,
}

/// One page of [`StackEvent`]s, newest-first, as returned by the remote API.
#[derive(Debug, Clone, Default)]
pub struct StackEventsPage {
    /// Events on this page, in reverse chronological order.
    pub events: Vec<StackEvent>,
    /// Opaque continuation token; `None` means this was the last page.
    pub next_token: Option<String>,
}

/// Error returned by a remote describe call.
///
/// Throttling is represented as data (`is_throttled`), not as a distinct
/// error type, so a single `?`-friendly `Result<_, RemoteError>` suffices
/// for every collaborator call.
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

/// Describes a stack's event log.
#[async_trait]
pub trait StackEventsDescriber: Send + Sync {
    /// Fetches one page of events for `stack_id_or_name`, newest-first.
    async fn describe_stack_events(
        &self,
        stack_id_or_name: &str,
        next_token: Option<String>,
    ) -> Result<StackEventsPage, RemoteError>;
}

/// Classifies a resource-status string as "an ongoing transition" or not.
pub trait InProgressPredicate: Send + Sync {
    /// Returns `true` if `resource_status` denotes an in-progress
    /// transition.
    fn is_in_progress(&self, resource_status: &str) -> bool;
}

/// The default predicate: any status whose name ends in `_IN_PROGRESS`,
/// which covers the common CloudFormation cases (`CREATE_IN_PROGRESS`,
/// `UPDATE_IN_PROGRESS`, `DELETE_IN_PROGRESS`, `REVIEW_IN_PROGRESS`,
/// `UPDATE_ROLLBACK_IN_PROGRESS`, …) without hard-coding the exact set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInProgressPredicate;

impl InProgressPredicate for DefaultInProgressPredicate {
    fn is_in_progress(&self, resource_status: &str) -> bool {
        resource_status.ends_with("_IN_PROGRESS")
    }
}

/// Status of a stack-set operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSetOpStatus {
    /// Queued, not yet running.
    Queued,
    /// Currently running.
    Running,
    /// A stop was requested and is being honored.
    Stopping,
    /// Finished, outcome unspecified by this variant.
    Completed,
    /// Stopped before completion.
    Stopped,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

impl StackSetOpStatus {
    /// Whether this status is still in progress (queued/running/stopping).
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Stopping)
    }

    /// Whether this status is a completed-family status
    /// (completed/succeeded/failed/stopped).
    pub fn is_completed(self) -> bool {
        !self.is_in_progress()
    }
}

/// One stack-set operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSetOperation {
    /// The operation's id.
    pub id: String,
    /// The operation's current status.
    pub status: StackSetOpStatus,
    /// Optional human-readable reason for the status.
    pub reason: Option<String>,
}

/// Event emitted by the stack-set streamer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSetOpEvent {
    /// The stack set's name.
    pub name: String,
    /// The operation observed.
    pub operation: StackSetOperation,
}

/// Status of one stack-set instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackInstanceStatus {
    /// The instance's stack is still being updated for this operation.
    InProgress,
    /// The instance's stack has reached a terminal state for this
    /// operation.
    Terminal,
}

/// Summary of one stack-set instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInstanceSummary {
    /// The instance's stack id, if the stack has been created yet.
    pub stack_id: Option<String>,
    /// The region this instance lives in.
    pub region: String,
    /// Whether this instance is still in progress for the operation being
    /// observed.
    pub status: StackInstanceStatus,
}

/// Describes a stack set and its operations.
#[async_trait]
pub trait StackSetDescriber: Send + Sync {
    /// Lists the current instance summaries of `stack_set_name`.
    async fn instance_summaries(&self, stack_set_name: &str) -> Result<Vec<StackInstanceSummary>, RemoteError>;

    /// Describes one operation against `stack_set_name`.
    async fn describe_operation(
        &self,
        stack_set_name: &str,
        operation_id: &str,
    ) -> Result<StackSetOperation, RemoteError>;
}

/// One resource belonging to a stack, as returned by a resource lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackResource {
    /// The resource's logical id in the template.
    pub logical_resource_id: String,
    /// The resource's physical id, as assigned by the control plane.
    pub physical_resource_id: String,
    /// The resource's type.
    pub resource_type: String,
}

/// Lists the resources of a named stack.
#[async_trait]
pub trait StackResourceLister: Send + Sync {
    /// Lists the resources of `stack_name`.
    async fn list_resources(&self, stack_name: &str) -> Result<Vec<StackResource>, RemoteError>;
}

/// Invokes a state machine by its physical identifier.
#[async_trait]
pub trait StateMachineExecutor: Send + Sync {
    /// Starts an execution of the state machine identified by
    /// `state_machine_id`.
    async fn execute(&self, state_machine_id: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_predicate_matches_known_in_progress_statuses() {
        let predicate = DefaultInProgressPredicate;
        for status in [
            "CREATE_IN_PROGRESS",
            "UPDATE_IN_PROGRESS",
            "DELETE_IN_PROGRESS",
            "REVIEW_IN_PROGRESS",
            "UPDATE_ROLLBACK_IN_PROGRESS",
        ] {
            assert!(predicate.is_in_progress(status), "{status} should be in progress");
        }
        for status in ["CREATE_COMPLETE", "UPDATE_FAILED", "DELETE_COMPLETE"] {
            assert!(!predicate.is_in_progress(status), "{status} should not be in progress");
        }
    }

    #[test]
    fn stack_set_status_partitioning() {
        assert!(StackSetOpStatus::Queued.is_in_progress());
        assert!(StackSetOpStatus::Running.is_in_progress());
        assert!(StackSetOpStatus::Stopping.is_in_progress());
        assert!(StackSetOpStatus::Completed.is_completed());
        assert!(StackSetOpStatus::Stopped.is_completed());
        assert!(StackSetOpStatus::Succeeded.is_completed());
        assert!(StackSetOpStatus::Failed.is_completed());
    }
}
