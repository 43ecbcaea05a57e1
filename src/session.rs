//! Authentication session controller.
//!
//! A [`Session`] owns the token store, the durable callback queue and the
//! Graph client, and drives the delegate through sign-in, redirect
//! handling, silent renewal and sign-out.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::{try_join, try_join_all};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{
    Account, AuthDelegate, TokenKind, TokenMessage, TokenRecord, TokenRequest, TokenResponse,
    TokenStore,
};
use crate::config::Config;
use crate::error::{GraphError, SessionError};
use crate::graph::endpoint::batch_target;
use crate::graph::{
    categorize, Endpoint, GraphClient, GraphRequest, GraphResult, GraphResultCache,
    GraphTransport,
};
use crate::queue::{CallbackQueue, Hook, HookFuture, HookKind, Hooks, PendingCallback};
use crate::storage::{self, KeyValueStore, CUSTOM_DATA_KEY};

/// Wait between silent acquisition retries.
pub const TOKEN_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Retries used when an expiration timer renews a token.
const AUTO_REFRESH_RETRIES: u32 = 3;

/// Hook receiving the session handle and the event arguments.
pub type SessionHook = Hook<Session>;

/// Hook awaited before signing out.
pub type SignOutHook = Arc<dyn Fn(Session) -> HookFuture + Send + Sync>;

/// Application hooks of a session.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// `(error, response)` after a redirect that did not sign the user in.
    pub on_authentication: Option<SessionHook>,
    /// `(null, response)` whenever a token value changes.
    pub on_token: Option<SessionHook>,
    /// `(results)` after the initial Graph call.
    pub on_graph_response: Option<SessionHook>,
    pub before_sign_out: Option<SignOutHook>,
}

/// Wrap an async closure as a [`SignOutHook`].
pub fn sign_out_hook<F, Fut>(f: F) -> SignOutHook
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// Where the session stands in the sign-in flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// A redirect response is being processed.
    RedirectInFlight,
    Authenticated,
}

/// Read-only snapshot of the session state.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub is_authenticated: bool,
    pub access_token: String,
    pub id_token: String,
    pub user: Option<Account>,
    pub graph: Map<String, Value>,
    pub custom: Map<String, Value>,
}

struct SessionInner {
    config: Config,
    delegate: Arc<dyn AuthDelegate>,
    store: Arc<dyn KeyValueStore>,
    tokens: TokenStore,
    queue: CallbackQueue<Session>,
    graph: GraphClient,
    before_sign_out: Option<SignOutHook>,
    user: Mutex<Option<Account>>,
    graph_data: Mutex<Map<String, Value>>,
    custom: Mutex<Map<String, Value>>,
    shutdown: CancellationToken,
}

/// Handle to an authentication session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build the session and run its start-up sequence.
    ///
    /// Pending callbacks from a previous run are delivered, a redirect
    /// response is processed, and if the user is signed in a token is
    /// acquired (followed by the initial Graph call when configured).
    /// Only configuration errors fail construction.
    pub async fn new(
        config: Config,
        hooks: SessionHooks,
        delegate: Arc<dyn AuthDelegate>,
        transport: Arc<dyn GraphTransport>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let store = delegate.store();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let renewal_offset = config.renewal_offset();

        let queue = CallbackQueue::new(
            Arc::clone(&store),
            Hooks {
                on_authentication: hooks.on_authentication,
                on_token: hooks.on_token,
                on_graph_response: hooks.on_graph_response,
            },
        );
        let custom = load_custom_data(store.as_ref());
        let graph = GraphClient::new(transport, config.graph.base_url.clone());

        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                delegate,
                store,
                tokens: TokenStore::new(renewal_offset, events_tx),
                queue,
                graph,
                before_sign_out: hooks.before_sign_out,
                user: Mutex::new(None),
                graph_data: Mutex::new(Map::new()),
                custom: Mutex::new(custom),
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(run_token_events(Arc::downgrade(&session.inner), events_rx));
        session.start().await;

        Ok(session)
    }

    async fn start(&self) {
        self.inner.queue.drain(self).await;

        if let Some(outcome) = self.inner.delegate.handle_redirect_callback().await {
            if !self.is_authenticated() {
                let (error, response) = match outcome {
                    Ok(response) => (Value::Null, to_json(&response)),
                    Err(e) => (to_json(&e), Value::Null),
                };
                self.inner
                    .queue
                    .enqueue(self, HookKind::OnAuthentication, vec![error, response])
                    .await;
            } else {
                self.acquire_token(None, 0).await;
            }
        }

        if self.inner.config.auth.require_auth_on_initialize && !self.is_authenticated() {
            if let Err(e) = self.sign_in().await {
                error!("Sign-in on initialize failed: {}", e);
            }
        }

        if self.is_authenticated() {
            *lock(&self.inner.user) = self.inner.delegate.account();
            self.acquire_token(None, 0).await;
            if self.inner.config.graph.call_after_init {
                self.initial_graph_call().await;
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        if self.inner.delegate.is_callback() {
            SessionState::RedirectInFlight
        } else if self.inner.delegate.account().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// True when no redirect is being processed and an account is cached.
    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Start an interactive sign-in.
    ///
    /// Does nothing while a redirect is processed or when already signed
    /// in. Completion arrives on a later start, through the redirect.
    pub async fn sign_in(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Unauthenticated {
            debug!("Sign-in skipped: {:?}", self.state());
            return Ok(());
        }

        info!("Starting sign-in redirect");
        self.inner
            .delegate
            .login_redirect(&self.default_request())
            .await?;
        Ok(())
    }

    /// Run the `before_sign_out` hook, then sign out through the delegate.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        if let Some(hook) = &self.inner.before_sign_out {
            hook(self.clone())
                .await
                .map_err(|e| SessionError::Hook(e.to_string()))?;
        }

        info!("Signing out");
        self.inner.tokens.cancel_timers();
        self.inner.tokens.clear(TokenKind::AccessToken);
        self.inner.tokens.clear(TokenKind::IdToken);
        *lock(&self.inner.user) = None;

        self.inner.delegate.logout().await?;
        Ok(())
    }

    /// Acquire a token silently, falling back to an interactive redirect
    /// when the identity provider requires it.
    ///
    /// Other failures are retried `retries` times, [`TOKEN_RETRY_BACKOFF`]
    /// apart. Returns `None` when no token could be obtained.
    pub async fn acquire_token(
        &self,
        request: Option<TokenRequest>,
        retries: u32,
    ) -> Option<TokenResponse> {
        let request = request.unwrap_or_else(|| self.default_request());
        let mut remaining = retries;

        loop {
            match self.inner.delegate.acquire_token_silent(&request).await {
                Ok(response) => {
                    self.handle_token_response(&response).await;
                    return Some(response);
                }
                Err(e) if e.requires_interaction() => {
                    info!(
                        "Silent token acquisition requires interaction ({}), redirecting",
                        e.error_code
                    );
                    if let Err(e) = self.inner.delegate.acquire_token_redirect(&request).await {
                        error!("Token redirect failed: {}", e);
                    }
                    return None;
                }
                Err(e) if remaining > 0 => {
                    remaining -= 1;
                    warn!(
                        "Silent token acquisition failed: {}. Retrying in {:?} ({} retries left)",
                        e, TOKEN_RETRY_BACKOFF, remaining
                    );
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => {
                            debug!("Token retry cancelled by shutdown");
                            return None;
                        }
                        _ = tokio::time::sleep(TOKEN_RETRY_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    warn!("Silent token acquisition failed: {}", e);
                    return None;
                }
            }
        }
    }

    /// Store changed tokens and notify `on_token` if anything changed.
    async fn handle_token_response(&self, response: &TokenResponse) {
        let tokens = &self.inner.tokens;
        let mut changed = false;

        if response.token_type == "access_token"
            && tokens.value(TokenKind::AccessToken).as_deref() != Some(response.access_token.as_str())
        {
            tokens.set_token(
                TokenKind::AccessToken,
                &response.access_token,
                response.expires_on,
                response.scopes.clone(),
            );
            changed = true;
        }

        if tokens.value(TokenKind::IdToken).as_deref() != Some(response.id_token.raw_id_token.as_str()) {
            tokens.set_token(
                TokenKind::IdToken,
                &response.id_token.raw_id_token,
                response.id_token.expires_on(),
                vec![self.inner.config.auth.client_id.clone()],
            );
            changed = true;
        }

        if changed {
            self.inner
                .queue
                .enqueue(self, HookKind::OnToken, vec![Value::Null, to_json(response)])
                .await;
        }
    }

    async fn on_token_expired(&self, kind: TokenKind, scopes: Vec<String>) {
        if self.inner.config.auth.auto_refresh_token {
            debug!("Renewing {}", kind);
            self.acquire_token(Some(TokenRequest { scopes }), AUTO_REFRESH_RETRIES)
                .await;
        } else {
            self.inner.tokens.clear(kind);
        }
    }

    /// Call Microsoft Graph with the current access token.
    pub async fn ms_graph(
        &self,
        request: impl Into<GraphRequest>,
        batch_url: Option<&str>,
    ) -> Result<GraphResult, GraphError> {
        let token = self.access_token();
        self.inner
            .graph
            .ms_graph(&token, request.into(), batch_url)
            .await
    }

    /// Fetch the configured endpoints, reusing cached results.
    ///
    /// Failures are logged and leave both `data.graph` and the cache
    /// untouched. The `on_graph_response` hook is notified either way.
    pub async fn initial_graph_call(&self) {
        if self.inner.config.graph.endpoints.is_empty() {
            return;
        }

        match self.fetch_graph_endpoints().await {
            Ok(results) => {
                info!("Initial Graph call returned {} results", results.len());
                *lock(&self.inner.graph_data) = results;
            }
            Err(e) => error!("Initial Graph call failed: {}", e),
        }

        if self.inner.queue.has_hook(HookKind::OnGraphResponse) {
            let results = lock(&self.inner.graph_data).clone();
            self.inner
                .queue
                .enqueue(self, HookKind::OnGraphResponse, vec![Value::Object(results)])
                .await;
        }
    }

    async fn fetch_graph_endpoints(&self) -> Result<Map<String, Value>, SessionError> {
        let endpoints = self
            .inner
            .config
            .graph
            .endpoints
            .iter()
            .map(|(id, input)| Endpoint::normalize(input.clone()).map(|e| (id.clone(), e)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let forced: HashSet<String> = endpoints
            .iter()
            .filter(|(_, endpoint)| endpoint.force)
            .map(|(id, _)| id.clone())
            .collect();

        let token = self.access_token();
        let mut cache = GraphResultCache::load(self.inner.store.as_ref(), &token)?;
        let categorized = categorize(&endpoints, &cache.fresh_ids(&forced));

        let graph = &self.inner.graph;
        let token = token.as_str();

        let singles = categorized.singles.iter().map(|endpoint| async move {
            let response = graph.send_endpoint(token, endpoint).await?;
            let id = endpoint.id.clone().unwrap_or_default();
            Ok::<_, GraphError>(BTreeMap::from([(id, response.body)]))
        });

        let batches = categorized.batches.iter().map(|(key, group)| async move {
            let keyed = graph.batch_keyed(token, group, batch_target(key)).await?;
            Ok::<_, GraphError>(
                keyed
                    .into_iter()
                    .map(|(id, response)| (id, response.get("body").cloned().unwrap_or_default()))
                    .collect::<BTreeMap<_, _>>(),
            )
        });

        let (single_results, batch_results) =
            try_join(try_join_all(singles), try_join_all(batches)).await?;

        for results in single_results.into_iter().chain(batch_results) {
            cache.merge(results);
        }
        cache.save(self.inner.store.as_ref(), &forced)?;

        Ok(cache.into_entries().into_iter().collect())
    }

    /// Set an application value and persist the whole custom data blob.
    pub fn save_custom_data(&self, key: impl Into<String>, value: Value) -> Result<(), SessionError> {
        let mut custom = lock(&self.inner.custom);
        custom.insert(key.into(), value);

        if custom.is_empty() {
            self.inner.store.remove_item(CUSTOM_DATA_KEY)?;
        } else {
            storage::save_json(self.inner.store.as_ref(), CUSTOM_DATA_KEY, &*custom)?;
        }
        Ok(())
    }

    /// Snapshot of the host-visible state.
    pub fn data(&self) -> SessionData {
        SessionData {
            is_authenticated: self.is_authenticated(),
            access_token: self.access_token(),
            id_token: self
                .inner
                .tokens
                .value(TokenKind::IdToken)
                .unwrap_or_default(),
            user: lock(&self.inner.user).clone(),
            graph: lock(&self.inner.graph_data).clone(),
            custom: lock(&self.inner.custom).clone(),
        }
    }

    pub fn token_record(&self, kind: TokenKind) -> Option<TokenRecord> {
        self.inner.tokens.record(kind)
    }

    /// Callbacks still waiting for delivery.
    pub fn pending_callbacks(&self) -> Vec<PendingCallback> {
        self.inner.queue.pending()
    }

    /// Cancel expiration timers and in-flight retry waits.
    pub fn shutdown(&self) {
        info!("Shutting down session");
        self.inner.shutdown.cancel();
        self.inner.tokens.cancel_timers();
    }

    fn access_token(&self) -> String {
        self.inner
            .tokens
            .value(TokenKind::AccessToken)
            .unwrap_or_default()
    }

    fn default_request(&self) -> TokenRequest {
        TokenRequest {
            scopes: self.inner.config.request.scopes.clone(),
        }
    }
}

/// Forward expiration timer events to the session while it is alive.
async fn run_token_events(
    session: Weak<SessionInner>,
    mut events: mpsc::UnboundedReceiver<TokenMessage>,
) {
    while let Some(message) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        let session = Session { inner };

        match message {
            TokenMessage::Expired { kind, scopes } => {
                tokio::spawn(async move {
                    session.on_token_expired(kind, scopes).await;
                });
            }
        }
    }
}

fn load_custom_data(store: &dyn KeyValueStore) -> Map<String, Value> {
    match storage::load_json(store, CUSTOM_DATA_KEY) {
        Ok(custom) => custom.unwrap_or_default(),
        Err(e) => {
            error!("Failed to load custom data: {}", e);
            Map::new()
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        error!("Failed to serialize hook argument: {}", e);
        Value::Null
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
