//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use std::collections::BTreeMap;
use std::env;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::Deserialize;
use url::Url;

use crate::error::SessionError;
use crate::graph::EndpointInput;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Placeholder client id shipped in config.toml.
const PLACEHOLDER_CLIENT_ID: &str = "YOUR_AZURE_AD_CLIENT_ID";

/// Upper bound for `token.refresh_before_expiry_seconds` (one day).
pub const MAX_REFRESH_BEFORE_EXPIRY_SECONDS: u64 = 86_400;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub request: RequestConfig,
    pub graph: GraphConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// Keychain service name for stored secrets.
    pub bundle_identifier: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "azure-session".into(),
            bundle_identifier: "de.malvik.azuresession".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: String,
    /// Full authority URL. Built from `tenant_name`/`tenant_id` when empty.
    pub authority: String,
    pub tenant_id: String,
    pub tenant_name: String,
    /// Require the authority to be an absolute https URL.
    pub validate_authority: bool,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: String,
    pub navigate_to_login_request_url: bool,
    pub require_auth_on_initialize: bool,
    pub auto_refresh_token: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            authority: String::new(),
            tenant_id: "common".into(),
            tenant_name: "login.microsoftonline.com".into(),
            validate_authority: true,
            redirect_uri: "http://localhost:28491/callback".into(),
            post_logout_redirect_uri: "http://localhost:28491/".into(),
            navigate_to_login_request_url: true,
            require_auth_on_initialize: false,
            auto_refresh_token: true,
        }
    }
}

/// Where the session keeps its durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheLocation {
    #[default]
    #[serde(alias = "localStorage")]
    File,
    #[serde(alias = "sessionStorage")]
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_location: CacheLocation,
    /// Persist the pending sign-in (state, PKCE verifier) in the store so a
    /// later process can complete it. Kept in memory only when false.
    pub store_auth_state_in_cookie: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_location: CacheLocation::File,
            store_auth_state_in_cookie: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub scopes: Vec<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            scopes: vec!["user.read".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Run the initial endpoint fetch as soon as a token is available.
    pub call_after_init: bool,
    /// Endpoints fetched by the initial call, keyed by result id.
    pub endpoints: BTreeMap<String, EndpointInput>,
    pub base_url: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("profile".to_string(), EndpointInput::Url("/me".into()));
        Self {
            call_after_init: false,
            endpoints,
            base_url: "https://graph.microsoft.com/v1.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Renewal offset subtracted from a token's expiry, at most
    /// [`MAX_REFRESH_BEFORE_EXPIRY_SECONDS`].
    pub refresh_before_expiry_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_before_expiry_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_toml(CONFIG_TOML)?;

        // Apply environment variable overrides
        if let Ok(client_id) = env::var("AZURE_CLIENT_ID") {
            config.auth.client_id = client_id;
        }

        if let Ok(tenant) = env::var("AZURE_TENANT_ID") {
            config.auth.tenant_id = tenant;
        }

        if let Ok(redirect_uri) = env::var("AZURE_REDIRECT_URI") {
            config.auth.redirect_uri = redirect_uri;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML text without validating it.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.auth.client_id.is_empty() || self.auth.client_id == PLACEHOLDER_CLIENT_ID {
            return Err(SessionError::Config(
                "auth.client_id is required. Set AZURE_CLIENT_ID environment variable \
                 or update config.toml"
                    .into(),
            ));
        }

        if self.auth.authority.is_empty() && self.auth.tenant_id.is_empty() {
            return Err(SessionError::Config(
                "auth.tenant_id must be set when auth.authority is empty".into(),
            ));
        }

        if self.auth.validate_authority {
            let authority = self.authority();
            let valid = Url::parse(&authority)
                .map(|url| url.scheme() == "https" && url.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                return Err(SessionError::Config(format!(
                    "auth.authority must be an https URL, got '{}'",
                    authority
                )));
            }
        }

        if self.app.bundle_identifier.is_empty() {
            return Err(SessionError::Config(
                "app.bundle_identifier must not be empty".into(),
            ));
        }

        if self.token.refresh_before_expiry_seconds > MAX_REFRESH_BEFORE_EXPIRY_SECONDS {
            return Err(SessionError::Config(format!(
                "token.refresh_before_expiry_seconds must be at most {}",
                MAX_REFRESH_BEFORE_EXPIRY_SECONDS
            )));
        }

        Ok(())
    }

    /// How long before expiry a token is renewed. Values above
    /// [`MAX_REFRESH_BEFORE_EXPIRY_SECONDS`] are clamped.
    pub fn renewal_offset(&self) -> TimeDelta {
        let seconds = self
            .token
            .refresh_before_expiry_seconds
            .min(MAX_REFRESH_BEFORE_EXPIRY_SECONDS);
        TimeDelta::try_seconds(seconds as i64).unwrap_or(TimeDelta::zero())
    }

    /// The authority URL, e.g. `https://login.microsoftonline.com/common`.
    pub fn authority(&self) -> String {
        if !self.auth.authority.is_empty() {
            return self.auth.authority.trim_end_matches('/').to_string();
        }
        format!("https://{}/{}", self.auth.tenant_name, self.auth.tenant_id)
    }

    /// Get the authorization URL for Azure AD.
    pub fn auth_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority())
    }

    /// Get the token URL for Azure AD.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    /// Get the end-session URL for Azure AD.
    pub fn logout_url(&self) -> String {
        format!("{}/oauth2/v2.0/logout", self.authority())
    }
}
