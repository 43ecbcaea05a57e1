//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;

use crate::auth::{Account, AuthDelegate, IdToken, TokenRequest, TokenResponse};
use crate::error::{DelegateError, GraphError};
use crate::graph::{GraphResponse, GraphTransport, HttpRequest};
use crate::storage::{KeyValueStore, MemoryStore};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<GraphResponse, GraphError> + Send + Sync>;

/// Transport answering every request through a closure.
pub struct FakeTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<GraphResponse, GraphError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with `200` and `body`.
    pub fn ok(body: Value) -> Self {
        Self::new(move |_| {
            Ok(GraphResponse {
                status: 200,
                headers: Default::default(),
                body: body.clone(),
            })
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphTransport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<GraphResponse, GraphError> {
        let result = (self.handler)(&request);
        self.requests.lock().unwrap().push(request);
        result
    }
}

pub fn account() -> Account {
    Account {
        home_account_id: "oid.tid".into(),
        username: "ada@contoso.com".into(),
        name: Some("Ada Lovelace".into()),
        tenant_id: Some("tid".into()),
    }
}

/// Token response whose tokens expire in `expires_in`.
pub fn token_response(access_token: &str, expires_in: Duration) -> TokenResponse {
    let expires_on = Utc::now() + expires_in;
    TokenResponse {
        token_type: "access_token".into(),
        access_token: access_token.into(),
        expires_on,
        id_token: IdToken {
            raw_id_token: format!("id-{}", access_token),
            expiration: expires_on.timestamp(),
        },
        scopes: vec!["user.read".into()],
        account: Some(account()),
    }
}

/// Scripted delegate recording every call.
#[derive(Default)]
pub struct FakeDelegate {
    pub store: Arc<MemoryStore>,
    pub account: Mutex<Option<Account>>,
    pub callback: AtomicBool,
    pub redirect_outcome: Mutex<Option<Result<TokenResponse, DelegateError>>>,
    pub silent_responses: Mutex<VecDeque<Result<TokenResponse, DelegateError>>>,
    pub silent_requests: Mutex<Vec<TokenRequest>>,
    pub login_redirects: AtomicUsize,
    pub token_redirects: AtomicUsize,
    pub logouts: AtomicUsize,
}

impl FakeDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in() -> Self {
        let delegate = Self::new();
        *delegate.account.lock().unwrap() = Some(account());
        delegate
    }

    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn push_silent(&self, result: Result<TokenResponse, DelegateError>) {
        self.silent_responses.lock().unwrap().push_back(result);
    }

    pub fn silent_calls(&self) -> usize {
        self.silent_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AuthDelegate for FakeDelegate {
    fn account(&self) -> Option<Account> {
        self.account.lock().unwrap().clone()
    }

    fn is_callback(&self) -> bool {
        self.callback.load(Ordering::SeqCst)
    }

    async fn login_redirect(&self, _request: &TokenRequest) -> Result<(), DelegateError> {
        self.login_redirects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acquire_token_redirect(&self, _request: &TokenRequest) -> Result<(), DelegateError> {
        self.token_redirects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acquire_token_silent(
        &self,
        request: &TokenRequest,
    ) -> Result<TokenResponse, DelegateError> {
        self.silent_requests.lock().unwrap().push(request.clone());
        self.silent_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(DelegateError::new("no_response", "nothing scripted")))
    }

    async fn handle_redirect_callback(&self) -> Option<Result<TokenResponse, DelegateError>> {
        let outcome = self.redirect_outcome.lock().unwrap().take()?;
        self.callback.store(false, Ordering::SeqCst);
        if let Ok(response) = &outcome {
            *self.account.lock().unwrap() = response.account.clone();
        }
        Some(outcome)
    }

    async fn logout(&self) -> Result<(), DelegateError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        *self.account.lock().unwrap() = None;
        Ok(())
    }

    fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }
}
