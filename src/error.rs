//! Error types for the reflection engine

use thiserror::Error;

/// Main error type for reflection operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The configuration watch could not be established or died
    #[error("configuration watch error: {0}")]
    ConfigurationWatch(String),

    /// A reflector failed to start for a desired resource type
    #[error("registration error for {resource}: {message}")]
    Registration {
        /// Resource type that failed to register
        resource: String,
        /// What went wrong
        message: String,
    },

    /// A single mirror create/update/delete failed
    #[error("reflection apply error for {key}: {message}")]
    ReflectionApply {
        /// Key of the source object
        key: String,
        /// What went wrong
        message: String,
    },

    /// The pod provider rejected an operation
    #[error("provider operation error: {0}")]
    ProviderOperation(#[from] ProviderError),

    /// Pushing pod status to the local cluster failed
    #[error("status update error for {key}: {message}")]
    StatusUpdate {
        /// Key of the pod
        key: String,
        /// What went wrong
        message: String,
    },

    /// Invalid configuration or object content
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a configuration watch error with the given message
    pub fn configuration_watch(msg: impl Into<String>) -> Self {
        Self::ConfigurationWatch(msg.into())
    }

    /// Create a registration error for the given resource
    pub fn registration(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a reflection apply error for the given object key
    pub fn reflection_apply(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ReflectionApply {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a status update error for the given pod key
    pub fn status_update(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StatusUpdate {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true if this is a Kubernetes 404 or a provider not-found
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Self::ProviderOperation(e) => e.kind == ProviderErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Closed classification of provider failures
///
/// Providers (or an adapter in front of them) must map their native errors
/// onto one of these kinds; the pod subsystem never inspects raw reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The provider no longer recognizes the pod
    NotFound,
    /// A race that heals on its own (cold remote cache, duplicate create)
    Transient,
    /// Anything else; the pod is marked as failed
    Terminal,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Error returned by a [`crate::pod::Provider`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// Classification driving the error handling path
    pub kind: ProviderErrorKind,
    /// Human-readable message pushed into pod status on terminal failures
    pub message: String,
}

impl ProviderError {
    /// Create a provider error of the given kind
    pub fn new(kind: ProviderErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    /// Create a not-found provider error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, msg)
    }

    /// Create a transient provider error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, msg)
    }

    /// Create a terminal provider error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Terminal, msg)
    }

    /// Classify a Kubernetes API error returned by a cluster-backed provider
    ///
    /// NotFound maps to [`ProviderErrorKind::NotFound`]; ServiceUnavailable and
    /// AlreadyExists map to [`ProviderErrorKind::Transient`]; everything else,
    /// including transport failures, is terminal.
    pub fn from_kube(err: &kube::Error) -> Self {
        let kind = match err {
            kube::Error::Api(resp) if resp.code == 404 || resp.reason == "NotFound" => {
                ProviderErrorKind::NotFound
            }
            kube::Error::Api(resp)
                if resp.code == 503
                    || resp.reason == "ServiceUnavailable"
                    || resp.reason == "AlreadyExists" =>
            {
                ProviderErrorKind::Transient
            }
            _ => ProviderErrorKind::Terminal,
        };
        Self::new(kind, err.to_string())
    }
}
