//! Error types for the azure-session crate.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level session error type.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Identity provider error: {0}")]
    Delegate(#[from] DelegateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hook failed: {0}")]
    Hook(String),
}

/// Authentication-related errors raised by the OAuth delegate.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("OAuth2 authorization failed: {0}")]
    OAuthFailed(String),

    #[error("Invalid authorization code")]
    InvalidAuthCode,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("State validation failed (possible CSRF attack)")]
    StateValidationFailed,

    #[error("No sign-in is pending for this callback")]
    NoPendingRedirect,

    #[error("Invalid id token: {0}")]
    InvalidIdToken(String),

    #[error("Failed to open browser: {0}")]
    Browser(String),
}

/// Persistent key-value store errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to read store: {0}")]
    ReadFailed(String),

    #[error("Failed to write store: {0}")]
    WriteFailed(String),

    #[error("Stored value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// OS keychain errors.
#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Failed to store secret: {0}")]
    StoreFailed(String),

    #[error("Failed to retrieve secret: {0}")]
    RetrieveFailed(String),

    #[error("Failed to delete secret: {0}")]
    DeleteFailed(String),
}

/// Microsoft Graph request errors.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Graph API request failed: {0}")]
    GraphRequestFailed(String),

    #[error("Failed to parse API response: {0}")]
    ParseFailed(String),

    #[error("Unauthorized (401): Token may be expired")]
    Unauthorized,

    #[error("Forbidden (403): Insufficient permissions")]
    Forbidden,

    #[error("Rate limited (429): Too many requests")]
    RateLimited,

    #[error("Graph API returned HTTP {0}")]
    Status(u16),
}

/// Error reported by a delegate's silent or redirect acquisition.
///
/// `error_code` carries the identity platform classification
/// (`login_required`, `invalid_grant`, ...) which drives the
/// interactive fallback policy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error_code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct DelegateError {
    pub error_code: String,
    pub message: String,
}

/// Error codes that can only be resolved by user interaction.
const INTERACTION_REQUIRED_CODES: [&str; 3] =
    ["consent_required", "interaction_required", "login_required"];

impl DelegateError {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    /// Returns true if silent acquisition cannot succeed without the user.
    pub fn requires_interaction(&self) -> bool {
        INTERACTION_REQUIRED_CODES.contains(&self.error_code.as_str())
    }
}

impl From<AuthError> for DelegateError {
    fn from(err: AuthError) -> Self {
        let code = match &err {
            AuthError::OAuthFailed(_) => "oauth_failed",
            AuthError::InvalidAuthCode => "invalid_auth_code",
            AuthError::TokenExchangeFailed(_) => "token_exchange_failed",
            AuthError::TokenRefreshFailed(_) => "token_refresh_failed",
            AuthError::StateValidationFailed => "state_mismatch",
            AuthError::NoPendingRedirect => "no_pending_redirect",
            AuthError::InvalidIdToken(_) => "invalid_id_token",
            AuthError::Browser(_) => "browser_unavailable",
        };
        Self::new(code, err.to_string())
    }
}

impl From<StorageError> for DelegateError {
    fn from(err: StorageError) -> Self {
        Self::new("storage_failed", err.to_string())
    }
}

impl From<KeychainError> for DelegateError {
    fn from(err: KeychainError) -> Self {
        Self::new("keychain_failed", err.to_string())
    }
}

impl SessionError {
    /// Returns a user-friendly message for display.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Auth(AuthError::OAuthFailed(_)) => "Sign-in failed. Please try again.",
            Self::Auth(AuthError::TokenRefreshFailed(_)) => {
                "Session expired. Please sign in again."
            }
            Self::Auth(AuthError::StateValidationFailed) => {
                "Security error. Please try signing in again."
            }
            Self::Auth(AuthError::NoPendingRedirect) => "No sign-in in progress.",
            Self::Delegate(e) if e.requires_interaction() => "Please sign in again.",
            Self::Storage(_) => "Failed to access session storage.",
            Self::Graph(GraphError::Unauthorized) => "Authentication expired. Sign in again.",
            Self::Graph(GraphError::Forbidden) => "Insufficient permissions for this operation.",
            Self::Graph(GraphError::RateLimited) => "Too many requests. Please wait a moment.",
            Self::Graph(GraphError::InvalidEndpoint(_)) => "Invalid Graph endpoint.",
            Self::Config(_) => "Configuration error. Please check settings.",
            _ => "An error occurred. Please try again.",
        }
    }
}
