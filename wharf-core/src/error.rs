//! Platform error abstractions.

use thiserror::Error;

/// Platform error variants.
///
/// Not-found and conflict variants map to 404/409 equivalents at the edge;
/// timeout variants carry the elapsed wait so callers can decide whether to
/// retry; invariant violations fail fast and are never retried.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The requested cluster resource does not exist.
    #[error("resource {kind}/{name} does not exist")]
    ResourceMissing { kind: String, name: String },
    /// A conflicting cluster resource already exists.
    #[error("resource {kind}/{name} already exists")]
    ResourceDuplicate { kind: String, name: String },
    /// Reading the target status of a resource timed out.
    #[error("timed out after {elapsed_seconds}s reading target status of {name}")]
    ReadTargetStatusTimeout { name: String, elapsed_seconds: u64 },
    /// The default ServiceAccount of a namespace did not appear in time.
    #[error("timed out after {elapsed_seconds}s waiting for default ServiceAccount in {namespace}")]
    CreateServiceAccountTimeout { namespace: String, elapsed_seconds: u64 },
    /// The observed pod does not exist.
    #[error("pod {0} does not exist")]
    PodAbsent(String),
    /// The observed pod did not reach a terminal state in time.
    #[error("pod {name} did not reach a terminal state after {elapsed_seconds}s")]
    PodTimeout { name: String, elapsed_seconds: u64 },
    /// The observed pod reached a terminal state other than `Succeeded`.
    #[error("pod {name} finished in phase {phase}")]
    PodNotSucceeded { name: String, phase: String },
    /// The target process instance is not found.
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    /// A release is already in flight for the target environment.
    #[error("an ongoing release already exists for this environment")]
    CannotDeployOngoingExists,
    /// The requested source revision could not be resolved.
    #[error("cannot resolve revision: {0}")]
    CannotGetRevision(String),
    /// The application cannot be deployed in its current state.
    #[error("application cannot be deployed: {0}")]
    CannotDeployApp(String),
    /// Environment protection forbids deploys by the current role.
    #[error("deploys to environment {environment} are restricted")]
    RestrictRoleDeployEnabled { environment: String },
    /// The given input violates a platform invariant.
    #[error("validation error: {0}")]
    InvalidInput(String),
}

impl PlatformError {
    /// Whether this error is a 404-equivalent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ResourceMissing { .. } | Self::PodAbsent(_) | Self::InstanceNotFound(_)
        )
    }

    /// Whether this error is a 409-equivalent conflict, which is never retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ResourceDuplicate { .. } | Self::CannotDeployOngoingExists)
    }
}
