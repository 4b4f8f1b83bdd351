/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    #[cfg(test)]
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    #[cfg(test)]
    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// No object of the given kind is controlled by the owner. This is an
    /// expected state and the signal to take the create branch.
    #[error("{kind} owned by {owner} not found")]
    NotFound { kind: String, owner: String },
    /// A component's desired state is neither `Enabled` nor `Disabled`.
    #[error("unknown component state {state:?} for {component}")]
    UnknownComponentState { component: String, state: String },
    /// The object is being deleted, it can only be replaced once it is gone.
    #[error("{kind} {name} is being deleted")]
    Terminating { kind: String, name: String },
    /// The owner lacks the identity (name, UID) needed for an owner reference.
    #[error("{0}")]
    InvalidOwner(String),
    /// Bootstrapping the root object failed before the controller started.
    #[error("{0}")]
    Bootstrap(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn not_found(kind: &str, owner: &str) -> Self {
        ControllerError::NotFound {
            kind: kind.to_string(),
            owner: owner.to_string(),
        }
    }

    /// `true` for the typed not-found error and for API 404/410 responses.
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound { .. } => true,
            ControllerError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Configuration errors will not go away by retrying quickly.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::UnknownComponentState { .. } => false,
            ControllerError::InvalidOwner(_) => false,
            _ => true,
        }
    }
}
