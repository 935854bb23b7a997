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

//! Locates the single state-machine resource inside a job's stack and
//! invokes it. The only piece of this workspace that isn't a streamer, kept
//! here because it exercises the same stack-resource-lister / executor
//! collaborator contract the streamers depend on rather than a contract of
//! its own.

use cfn::{RemoteError, StackResourceLister, StateMachineExecutor};

/// The CloudFormation resource type a job's state machine is expected to
/// have. Resources of any other type are ignored when searching a job's
/// stack.
pub const STATE_MACHINE_RESOURCE_TYPE: &str = "AWS::StepFunctions::StateMachine";

/// Errors running a job can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    /// Listing the job's stack resources failed.
    #[error("list resources for stack \"{stack_name}\": {source}")]
    ListResources {
        /// The stack name derived from `<app>-<env>-<job>`.
        stack_name: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
    /// No resource of type [`STATE_MACHINE_RESOURCE_TYPE`] was found in the
    /// job's stack.
    #[error("no state machine resource found in stack \"{stack_name}\"")]
    NoStateMachineFound {
        /// The stack name derived from `<app>-<env>-<job>`.
        stack_name: String,
    },
    /// Invoking the state machine failed.
    #[error("execute state machine \"{state_machine_id}\": {source}")]
    Execute {
        /// The physical id of the state machine that was invoked.
        state_machine_id: String,
        /// The underlying remote error.
        #[source]
        source: RemoteError,
    },
}

/// Derives the stack name a job's resources live in, by convention
/// `<app>-<env>-<job>`.
pub fn stack_name(app_name: &str, env_name: &str, job_name: &str) -> String {
    format!("{app_name}-{env_name}-{job_name}")
}

/// Lists `app_name`/`env_name`/`job_name`'s stack resources, finds the
/// single resource whose type is [`STATE_MACHINE_RESOURCE_TYPE`], and
/// invokes `executor` with its physical id.
pub async fn run_job(
    lister: &(impl StackResourceLister + ?Sized),
    executor: &(impl StateMachineExecutor + ?Sized),
    app_name: &str,
    env_name: &str,
    job_name: &str,
) -> Result<(), RunError> {
    let stack_name = stack_name(app_name, env_name, job_name);

    let resources = lister
        .list_resources(&stack_name)
        .await
        .map_err(|source| RunError::ListResources {
            stack_name: stack_name.clone(),
            source,
        })?;

    let state_machine = resources
        .into_iter()
        .find(|resource| resource.resource_type == STATE_MACHINE_RESOURCE_TYPE)
        .ok_or_else(|| RunError::NoStateMachineFound {
            stack_name: stack_name.clone(),
        })?;

    executor
        .execute(&state_machine.physical_resource_id)
        .await
        .map_err(|source| RunError::Execute {
            state_machine_id: state_machine.physical_resource_id.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cfn::StackResource;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    struct FakeLister {
        resources: Vec<StackResource>,
    }

    #[async_trait]
    impl StackResourceLister for FakeLister {
        async fn list_resources(&self, _stack_name: &str) -> Result<Vec<StackResource>, RemoteError> {
            Ok(self.resources.clone())
        }
    }

    struct FailingLister;

    #[async_trait]
    impl StackResourceLister for FailingLister {
        async fn list_resources(&self, _stack_name: &str) -> Result<Vec<StackResource>, RemoteError> {
            Err(RemoteError::other(Boom))
        }
    }

    struct RecordingExecutor {
        invoked_with: Mutex<Option<String>>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            Self {
                invoked_with: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StateMachineExecutor for RecordingExecutor {
        async fn execute(&self, state_machine_id: &str) -> Result<(), RemoteError> {
            *self.invoked_with.lock().expect("invoked_with mutex poisoned") = Some(state_machine_id.to_string());
            Ok(())
        }
    }

    fn resource(resource_type: &str, physical_id: &str) -> StackResource {
        StackResource {
            logical_resource_id: "SomeLogicalId".to_string(),
            physical_resource_id: physical_id.to_string(),
            resource_type: resource_type.to_string(),
        }
    }

    #[test]
    fn derives_stack_name_by_convention() {
        assert_eq!(stack_name("myapp", "prod", "nightly-cleanup"), "myapp-prod-nightly-cleanup");
    }

    #[tokio::test]
    async fn invokes_the_state_machine_resource_found_in_the_stack() {
        let lister = FakeLister {
            resources: vec![
                resource("AWS::S3::Bucket", "phys-bucket"),
                resource(STATE_MACHINE_RESOURCE_TYPE, "arn:aws:states:us-east-1:1111:stateMachine:nightly-cleanup"),
            ],
        };
        let executor = RecordingExecutor::new();

        run_job(&lister, &executor, "myapp", "prod", "nightly-cleanup")
            .await
            .expect("run_job should succeed");

        assert_eq!(
            *executor.invoked_with.lock().unwrap(),
            Some("arn:aws:states:us-east-1:1111:stateMachine:nightly-cleanup".to_string())
        );
    }

    #[tokio::test]
    async fn errors_when_no_state_machine_resource_exists() {
        let lister = FakeLister {
            resources: vec![resource("AWS::S3::Bucket", "phys-bucket")],
        };
        let executor = RecordingExecutor::new();

        let err = run_job(&lister, &executor, "myapp", "prod", "nightly-cleanup")
            .await
            .expect_err("missing state machine should be an error");

        assert_eq!(
            err.to_string(),
            "no state machine resource found in stack \"myapp-prod-nightly-cleanup\""
        );
    }

    #[tokio::test]
    async fn wraps_errors_from_listing_resources() {
        let executor = RecordingExecutor::new();
        let err = run_job(&FailingLister, &executor, "myapp", "prod", "nightly-cleanup")
            .await
            .expect_err("listing failure should propagate");

        assert_eq!(
            err.to_string(),
            "list resources for stack \"myapp-prod-nightly-cleanup\": boom"
        );
    }
}
