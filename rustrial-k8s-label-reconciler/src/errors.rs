/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

impl ExtKubeApiError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// A patch claims ownership of label keys outside of the allowed prefixes.
    /// Permanent, the patch is rejected as a whole.
    #[error("ownership not allowed: {0}")]
    RejectedOwnership(String),
    /// An ownership pattern is not a valid regular expression.
    #[error("invalid ownership regex {pattern}: {source}")]
    InvalidOwnershipRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    /// Failed to discover the API Resource of a GroupVersionResource.
    /// This might be a temporary failure caused by not yet installed or
    /// removed CustomResourceDefinitions (CRDs) or by temporary API connectivity
    /// issues.
    #[error("{0}")]
    ApiDiscoveryError(String),
    /// Namespaced resources cannot be addressed without a namespace.
    #[error("{0}")]
    MissingNamespace(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// The object was modified concurrently on every single attempt.
    #[error("giving up after {attempts} conflicting update attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: kube::Error,
    },
    /// Failed to retrieve the desired state.
    #[error("{0}")]
    DesiredState(String),
    /// At least one patch of a batch failed.
    #[error("{failed} out of {attempted} resource patches failed: {details}")]
    BatchFailed {
        failed: usize,
        attempted: usize,
        details: String,
    },
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether retrying the same patch in a later poll cycle might succeed.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::RejectedOwnership(_) => false,
            ControllerError::InvalidOwnershipRegex { .. } => false,
            ControllerError::MissingNamespace(_) => false,
            _ => true,
        }
    }
}

/// Invalid process configuration, fatal at startup.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::api_error;

    #[test]
    fn classify_kube_errors() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(410).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
    }

    #[test]
    fn classify_controller_errors() {
        assert!(ControllerError::from(api_error(404)).is_not_found());
        assert!(ControllerError::from(api_error(409)).is_conflict());
        let exhausted = ControllerError::RetriesExhausted {
            attempts: 3,
            source: api_error(409),
        };
        assert!(!exhausted.is_conflict());
        assert!(exhausted.is_temporary());
        assert!(!ControllerError::RejectedOwnership("x/.*".to_string()).is_temporary());
    }
}
