use thiserror::Error;

/// Errors surfaced by the authenticated session. `Clone` so the outcome of
/// one login attempt can be handed to every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Retry budget exhausted while the device kept redirecting to its login page.
    #[error("not authenticated: retry budget exhausted")]
    NotAuthenticated,

    /// The device explicitly denied the credentials.
    #[error("login rejected by device: {0}")]
    LoginRejected(String),

    /// Login protocol or parse breakage: missing challenge, missing session
    /// cookie, malformed status JSON.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Transport-level failure (timeout, connect error) talking to the device.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Upstream(e.to_string())
    }
}
