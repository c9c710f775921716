use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential store error: {0}")]
    Credential(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Auth error: {0}")]
    Auth(String),
    /// A rejection reported by the hosted backend. Displays as the bare message
    /// so it can be shown to the user verbatim.
    #[error("{message}")]
    Backend { status: Option<u16>, message: String },
    #[error("{0}")]
    Validation(String),
    #[error("not signed in")]
    NotAuthenticated,
}

impl InfraError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            status: None,
            message: message.into(),
        }
    }

    /// Text for the dismissable error banner.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend { message, .. } => message.clone(),
            Self::Validation(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_rejected_credential(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                status: Some(400 | 401 | 403),
                ..
            }
        )
    }
}

#[derive(Debug, serde::Deserialize)]
struct BackendErrorPayload {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

/// Builds a [`InfraError::Backend`] from a non-success response, preferring the
/// message the service put in its JSON error body.
pub fn backend_error(status: reqwest::StatusCode, body: &str) -> InfraError {
    let parsed = serde_json::from_str::<BackendErrorPayload>(body).ok();
    let message = parsed
        .and_then(|payload| {
            payload
                .msg
                .or(payload.message)
                .or(payload.error_description)
                .or(payload.error)
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("backend error: http {}", status.as_u16())
            } else {
                format!("backend error: http {}; body={body}", status.as_u16())
            }
        });

    InfraError::Backend {
        status: Some(status.as_u16()),
        message,
    }
}
