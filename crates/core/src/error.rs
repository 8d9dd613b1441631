//! Error taxonomy shared by discovery, the dynamic client and both deployers.

use std::time::Duration;

/// Text shown to users for failures whose detail stays in the server log.
pub const GENERIC_USER_MESSAGE: &str = "internal error while applying resources, please contact the administrator";

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// The API server could not be reached.
    #[error("transport: {0}")]
    Transport(String),
    /// Non-2xx response; `message` is the server's status message.
    #[error("api status {code}: {message}")]
    ApiStatus { code: u16, message: String },
    /// Manifest or schema violation. Displayed verbatim.
    #[error("{0}")]
    ConfigValidation(String),
    /// A kind-level apply operation failed for a domain reason. Displayed verbatim.
    #[error("{0}")]
    Apply(String),
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("resource type not found: {0}")]
    ResourceTypeNotFound(String),
    #[error("no rollback operation for kind {0}")]
    Rollback(String),
    #[error("timed out after {waited:?} waiting for {target} to be deleted")]
    WaitTimeout { target: String, waited: Duration },
    #[error("store: {0}")]
    Store(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;

impl ReleaseError {
    pub fn api(code: u16, message: impl Into<String>) -> Self {
        ReleaseError::ApiStatus { code, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReleaseError::ApiStatus { code: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReleaseError::ApiStatus { code: 409, .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ReleaseError::ConfigValidation(_))
    }

    /// Message safe to surface to the user. Validation and domain failures pass through,
    /// API status errors expose the server message, everything else is generic.
    pub fn user_message(&self) -> String {
        match self {
            ReleaseError::ConfigValidation(m) | ReleaseError::Apply(m) => m.clone(),
            ReleaseError::ApiStatus { message, .. } => message.clone(),
            ReleaseError::UnsupportedKind(_) | ReleaseError::ResourceTypeNotFound(_) => self.to_string(),
            _ => GENERIC_USER_MESSAGE.to_string(),
        }
    }
}

impl From<anyhow::Error> for ReleaseError {
    fn from(e: anyhow::Error) -> Self {
        ReleaseError::Store(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for ReleaseError {
    fn from(e: serde_json::Error) -> Self {
        ReleaseError::ConfigValidation(format!("invalid manifest: {}", e))
    }
}
