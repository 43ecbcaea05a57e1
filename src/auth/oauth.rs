//! OAuth2 authorization-code flow with PKCE against the Microsoft identity
//! platform, exposed as an [`AuthDelegate`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use url::Url;
use zeroize::Zeroizing;

use super::delegate::{Account, AuthDelegate, IdToken, TokenRequest, TokenResponse};
use crate::config::Config;
use crate::error::{AuthError, DelegateError};
use crate::keychain::SecretStore;
use crate::storage::{self, KeyValueStore};

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PKCE verifier and state of the sign-in in progress.
pub const PENDING_KEY: &str = "msal.pending";
pub const ACCOUNT_KEY: &str = "msal.account";
pub const ID_TOKEN_KEY: &str = "msal.idtoken";

/// Keychain account holding the refresh token.
pub const REFRESH_TOKEN_SECRET: &str = "refresh_token";

/// Scopes added to every request so an id token and a refresh token are issued.
const OIDC_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (stored locally, sent in token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, sent in auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let verifier = random_token(32);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign-in started by a redirect call, waiting for its callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingRedirect {
    state: String,
    verifier: String,
    scopes: Vec<String>,
}

/// Opens a URL for the user.
pub type Browser = Arc<dyn Fn(&str) -> Result<(), AuthError> + Send + Sync>;

fn open_browser(url: &str) -> Result<(), AuthError> {
    open::that(url).map_err(|e| AuthError::Browser(e.to_string()))
}

/// Token endpoint response.
#[derive(Deserialize)]
struct AadTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    refresh_token: Option<String>,
    id_token: Option<String>,
    #[serde(default)]
    scope: String,
}

/// Error body returned by the token endpoint.
#[derive(Debug, Default, Deserialize)]
struct AadErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Id token claims used to describe the account.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    exp: i64,
    name: Option<String>,
    preferred_username: Option<String>,
    oid: Option<String>,
    tid: Option<String>,
}

/// [`AuthDelegate`] talking to the Microsoft identity platform v2 endpoints.
pub struct OAuthDelegate {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    secrets: Arc<dyn SecretStore>,
    http_client: reqwest::Client,
    browser: Browser,
    redirect_url: Mutex<Option<String>>,
    /// Pending sign-in when `cache.store_auth_state_in_cookie` is off.
    pending: Mutex<Option<PendingRedirect>>,
    refresh_token: Mutex<Option<Zeroizing<String>>>,
}

impl OAuthDelegate {
    /// The refresh token goes to `secrets`; everything else to `store`.
    pub fn new(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::OAuthFailed(e.to_string()))?;

        let refresh_token = match secrets.get_secret(REFRESH_TOKEN_SECRET) {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to load refresh token: {}", e);
                None
            }
        };

        Ok(Self {
            config: config.clone(),
            store,
            secrets,
            http_client,
            browser: Arc::new(open_browser),
            redirect_url: Mutex::new(None),
            pending: Mutex::new(None),
            refresh_token: Mutex::new(refresh_token),
        })
    }

    /// Replace the function used to open authorize and logout URLs.
    pub fn with_browser(mut self, browser: Browser) -> Self {
        self.browser = browser;
        self
    }

    /// Supply the URL the identity platform redirected to. It is processed
    /// by the next [`AuthDelegate::handle_redirect_callback`].
    pub fn set_redirect_url(&self, url: impl Into<String>) {
        *lock(&self.redirect_url) = Some(url.into());
    }

    /// Build the authorize URL for `pending`.
    fn authorize_url(&self, pending: &PendingRedirect, pkce: &PkceChallenge) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.config.auth_url())
            .map_err(|e| AuthError::OAuthFailed(format!("invalid authority: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.auth.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.auth.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &self.scope_string(&pending.scopes))
            .append_pair("state", &pending.state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("client-request-id", &uuid::Uuid::new_v4().to_string());

        Ok(url)
    }

    /// Persist a fresh PKCE pair and state, then send the user to sign in.
    async fn start_redirect(&self, request: &TokenRequest) -> Result<(), DelegateError> {
        let pkce = PkceChallenge::new();
        let pending = PendingRedirect {
            state: random_token(16),
            verifier: pkce.verifier.clone(),
            scopes: request.scopes.clone(),
        };

        let url = self.authorize_url(&pending, &pkce)?;
        self.save_pending(pending)?;

        info!("Sign in at: {}", url);
        if self.config.auth.navigate_to_login_request_url {
            (self.browser)(url.as_str())?;
        }
        Ok(())
    }

    async fn complete_redirect(&self, callback_url: &str) -> Result<TokenResponse, DelegateError> {
        let pending = self.take_pending()?.ok_or(AuthError::NoPendingRedirect)?;

        let (code, state) = parse_callback_url(callback_url)?;
        if state != pending.state {
            return Err(AuthError::StateValidationFailed.into());
        }

        debug!("Exchanging authorization code");
        let code_verifier = Zeroizing::new(pending.verifier);
        let redirect_uri = self.config.auth.redirect_uri.clone();
        let scope = self.scope_string(&pending.scopes);
        let response = self
            .post_token(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", code_verifier.as_str()),
                ("scope", scope.as_str()),
            ])
            .await?;

        let response = self.handle_token_response(response, &pending.scopes)?;
        info!("Signed in");
        Ok(response)
    }

    /// POST a grant to the token endpoint.
    async fn post_token(&self, grant: &[(&str, &str)]) -> Result<AadTokenResponse, DelegateError> {
        let mut params = vec![("client_id", self.config.auth.client_id.as_str())];
        params.extend_from_slice(grant);

        let response = self
            .http_client
            .post(self.config.token_url())
            .header("client-request-id", uuid::Uuid::new_v4().to_string())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = token_error(status.as_u16(), &body);
            error!("Token request failed: HTTP {} ({})", status, err.error_code);
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()).into())
    }

    /// Turn a token endpoint response into a [`TokenResponse`], persisting
    /// the refresh token, id token and account.
    fn handle_token_response(
        &self,
        response: AadTokenResponse,
        requested_scopes: &[String],
    ) -> Result<TokenResponse, DelegateError> {
        if let Some(refresh_token) = response.refresh_token {
            self.secrets.set_secret(REFRESH_TOKEN_SECRET, &refresh_token)?;
            *lock(&self.refresh_token) = Some(Zeroizing::new(refresh_token));
        }

        let id_token = match response.id_token {
            Some(raw_id_token) => {
                let claims = decode_id_token(&raw_id_token)?;
                let id_token = IdToken {
                    raw_id_token,
                    expiration: claims.exp,
                };
                storage::save_json(self.store.as_ref(), ID_TOKEN_KEY, &id_token)?;
                storage::save_json(self.store.as_ref(), ACCOUNT_KEY, &account_from(&claims))?;
                id_token
            }
            None => storage::load_json(self.store.as_ref(), ID_TOKEN_KEY)?
                .ok_or_else(|| AuthError::InvalidIdToken("no id token issued".into()))?,
        };

        let scopes = if response.scope.is_empty() {
            requested_scopes.to_vec()
        } else {
            response.scope.split_whitespace().map(String::from).collect()
        };

        let token_type = if response.access_token.is_empty() {
            "id_token"
        } else {
            "access_token"
        };

        Ok(TokenResponse {
            token_type: token_type.to_string(),
            access_token: response.access_token,
            expires_on: expires_on(Utc::now(), response.expires_in)?,
            id_token,
            scopes,
            account: self.account(),
        })
    }

    fn save_pending(&self, pending: PendingRedirect) -> Result<(), DelegateError> {
        if self.config.cache.store_auth_state_in_cookie {
            storage::save_json(self.store.as_ref(), PENDING_KEY, &pending)?;
        } else {
            *lock(&self.pending) = Some(pending);
        }
        Ok(())
    }

    fn take_pending(&self) -> Result<Option<PendingRedirect>, DelegateError> {
        if let Some(pending) = lock(&self.pending).take() {
            return Ok(Some(pending));
        }
        let pending = storage::load_json(self.store.as_ref(), PENDING_KEY)?;
        self.store.remove_item(PENDING_KEY)?;
        Ok(pending)
    }

    /// Requested scopes plus the OpenID scopes. The client id stands for
    /// the id token alone and is not sent as a scope.
    fn scope_string(&self, scopes: &[String]) -> String {
        scope_string(scopes, &self.config.auth.client_id)
    }

    fn clear_cache(&self) -> Result<(), DelegateError> {
        *lock(&self.refresh_token) = None;
        *lock(&self.redirect_url) = None;
        *lock(&self.pending) = None;
        self.secrets.delete_secret(REFRESH_TOKEN_SECRET)?;
        for key in [PENDING_KEY, ACCOUNT_KEY, ID_TOKEN_KEY] {
            self.store.remove_item(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthDelegate for OAuthDelegate {
    fn account(&self) -> Option<Account> {
        match storage::load_json(self.store.as_ref(), ACCOUNT_KEY) {
            Ok(account) => account,
            Err(e) => {
                warn!("Failed to read cached account: {}", e);
                None
            }
        }
    }

    fn is_callback(&self) -> bool {
        lock(&self.redirect_url).is_some()
    }

    async fn login_redirect(&self, request: &TokenRequest) -> Result<(), DelegateError> {
        self.start_redirect(request).await
    }

    async fn acquire_token_redirect(&self, request: &TokenRequest) -> Result<(), DelegateError> {
        self.start_redirect(request).await
    }

    async fn acquire_token_silent(
        &self,
        request: &TokenRequest,
    ) -> Result<TokenResponse, DelegateError> {
        let Some(refresh_token) = lock(&self.refresh_token).clone() else {
            return Err(DelegateError::new(
                "login_required",
                "No refresh token is cached for this account",
            ));
        };

        debug!("Refreshing token for scopes: {:?}", request.scopes);
        let scope = self.scope_string(&request.scopes);
        let response = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", scope.as_str()),
            ])
            .await?;

        self.handle_token_response(response, &request.scopes)
    }

    async fn handle_redirect_callback(&self) -> Option<Result<TokenResponse, DelegateError>> {
        let callback_url = lock(&self.redirect_url).clone()?;
        let result = self.complete_redirect(&callback_url).await;
        *lock(&self.redirect_url) = None;

        if let Err(e) = &result {
            warn!("Redirect callback failed: {}", e);
        }
        Some(result)
    }

    async fn logout(&self) -> Result<(), DelegateError> {
        self.clear_cache()?;

        let mut url = Url::parse(&self.config.logout_url())
            .map_err(|e| AuthError::OAuthFailed(format!("invalid authority: {}", e)))?;
        url.query_pairs_mut().append_pair(
            "post_logout_redirect_uri",
            &self.config.auth.post_logout_redirect_uri,
        );

        info!("Signed out");
        (self.browser)(url.as_str())?;
        Ok(())
    }

    fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<(String, String), AuthError> {
    let url = Url::parse(url_string).map_err(|_| AuthError::InvalidAuthCode)?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|s| s.to_string())
            .unwrap_or_else(|| error.to_string());
        return Err(AuthError::OAuthFailed(description));
    }

    let code = params
        .get("code")
        .ok_or(AuthError::InvalidAuthCode)?
        .to_string();

    let state = params
        .get("state")
        .ok_or(AuthError::StateValidationFailed)?
        .to_string();

    Ok((code, state))
}

/// Map a failed token endpoint response to a delegate error.
fn token_error(status: u16, body: &str) -> DelegateError {
    let parsed: AadErrorResponse = serde_json::from_str(body).unwrap_or_default();

    let code = match parsed.error.as_str() {
        "" => format!("http_{}", status),
        "invalid_grant" => "interaction_required".to_string(),
        other => other.to_string(),
    };
    let message = if parsed.error_description.is_empty() {
        format!("Token endpoint returned HTTP {}", status)
    } else {
        parsed.error_description
    };

    DelegateError::new(code, message)
}

/// Read the claims of an id token. The signature is not checked.
fn decode_id_token(raw: &str) -> Result<IdTokenClaims, AuthError> {
    let payload = raw
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::InvalidIdToken("not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidIdToken(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidIdToken(e.to_string()))
}

fn account_from(claims: &IdTokenClaims) -> Account {
    let oid = claims.oid.as_deref().unwrap_or_default();
    let tid = claims.tid.as_deref().unwrap_or_default();
    Account {
        home_account_id: format!("{}.{}", oid, tid),
        username: claims.preferred_username.clone().unwrap_or_default(),
        name: claims.name.clone(),
        tenant_id: claims.tid.clone(),
    }
}

/// Requested scopes without `client_id`, plus the OpenID scopes, space
/// separated.
fn scope_string(scopes: &[String], client_id: &str) -> String {
    let mut all: Vec<&str> = scopes
        .iter()
        .map(String::as_str)
        .filter(|scope| !scope.eq_ignore_ascii_case(client_id))
        .collect();
    for scope in OIDC_SCOPES {
        if !all.contains(&scope) {
            all.push(scope);
        }
    }
    all.join(" ")
}

/// Absolute expiry of a token issued at `now` for `expires_in` seconds.
fn expires_on(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, AuthError> {
    TimeDelta::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            AuthError::TokenExchangeFailed(format!("expires_in out of range: {}", expires_in))
        })
}

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
