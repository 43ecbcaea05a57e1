//! Boundary between the session and the OAuth library that performs the
//! actual sign-in flows.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DelegateError;
use crate::storage::KeyValueStore;

/// Scopes requested for a login or token acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub scopes: Vec<String>,
}

impl TokenRequest {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Signed-in account as cached by the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Stable identifier (`<oid>.<tid>`).
    pub home_account_id: String,
    pub username: String,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
}

/// Raw id token and its expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    pub raw_id_token: String,
    /// `exp` claim, seconds since the Unix epoch.
    pub expiration: i64,
}

impl IdToken {
    pub fn expires_on(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.expiration, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Debug for IdToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdToken")
            .field("raw_id_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Result of a successful token acquisition.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    /// `access_token` when an access token was issued, `id_token` otherwise.
    pub token_type: String,
    pub access_token: String,
    pub expires_on: DateTime<Utc>,
    pub id_token: IdToken,
    pub scopes: Vec<String>,
    pub account: Option<Account>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("access_token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .field("id_token", &self.id_token)
            .field("scopes", &self.scopes)
            .field("account", &self.account)
            .finish()
    }
}

/// OAuth library the session delegates protocol work to.
///
/// Redirect-based calls are fire-and-forget: they hand control to the
/// browser and complete on a later process start through
/// [`AuthDelegate::handle_redirect_callback`].
#[async_trait]
pub trait AuthDelegate: Send + Sync {
    /// Cached signed-in account, if any.
    fn account(&self) -> Option<Account>;

    /// True while a redirect response is waiting to be processed.
    fn is_callback(&self) -> bool;

    async fn login_redirect(&self, request: &TokenRequest) -> Result<(), DelegateError>;

    async fn acquire_token_redirect(&self, request: &TokenRequest) -> Result<(), DelegateError>;

    async fn acquire_token_silent(
        &self,
        request: &TokenRequest,
    ) -> Result<TokenResponse, DelegateError>;

    /// Process a pending redirect response.
    ///
    /// Returns `None` when this start is not the return leg of a redirect.
    async fn handle_redirect_callback(&self) -> Option<Result<TokenResponse, DelegateError>>;

    async fn logout(&self) -> Result<(), DelegateError>;

    /// Persistent store shared with the session.
    fn store(&self) -> Arc<dyn KeyValueStore>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_debug_is_redacted() {
        let response = TokenResponse {
            token_type: "access_token".into(),
            access_token: "secret-access".into(),
            expires_on: Utc::now(),
            id_token: IdToken {
                raw_id_token: "secret-id".into(),
                expiration: 0,
            },
            scopes: vec!["user.read".into()],
            account: None,
        };

        let debug_output = format!("{:?}", response);
        assert!(!debug_output.contains("secret-access"));
        assert!(!debug_output.contains("secret-id"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_id_token_expiry() {
        let token = IdToken {
            raw_id_token: String::new(),
            expiration: 1_700_000_000,
        };
        assert_eq!(token.expires_on().timestamp(), 1_700_000_000);
    }
}
