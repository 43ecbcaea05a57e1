//! Token state with expiration-driven renewal timers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Kind of token held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenKind {
    AccessToken,
    IdToken,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessToken => f.write_str("access token"),
            Self::IdToken => f.write_str("id token"),
        }
    }
}

/// The live token of one kind.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub kind: TokenKind,
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl TokenRecord {
    /// Remaining time until expiry, `None` once expired.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = Utc::now();
        if self.expires_at > now {
            Some(self.expires_at - now)
        } else {
            None
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("kind", &self.kind)
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Message emitted by the expiration timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMessage {
    /// The token of `kind` reached its renewal point.
    Expired { kind: TokenKind, scopes: Vec<String> },
}

/// Holds the current token values and one expiration timer per kind.
///
/// Timers do not act on their own: when one fires the store sends a
/// [`TokenMessage::Expired`] to the owning session, which decides between
/// renewal and clearing.
pub struct TokenStore {
    records: Mutex<HashMap<TokenKind, TokenRecord>>,
    timers: Mutex<HashMap<TokenKind, AbortHandle>>,
    renewal_offset: Duration,
    events: mpsc::UnboundedSender<TokenMessage>,
}

impl TokenStore {
    /// Create a store that renews tokens `renewal_offset` before they expire.
    pub fn new(renewal_offset: Duration, events: mpsc::UnboundedSender<TokenMessage>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            renewal_offset,
            events,
        }
    }

    /// Current value of `kind`, if one is stored.
    pub fn value(&self, kind: TokenKind) -> Option<String> {
        self.record(kind).map(|record| record.value)
    }

    pub fn record(&self, kind: TokenKind) -> Option<TokenRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&kind).cloned()
    }

    /// Store a token and (re)schedule its expiration timer.
    ///
    /// The value is only stored when it differs from the current one and is
    /// not already past its renewal point. The timer is replaced in every
    /// case; a token past its renewal point fires immediately.
    ///
    /// Must be called from within a tokio runtime. Returns whether the
    /// stored value changed.
    pub fn set_token(
        &self,
        kind: TokenKind,
        value: &str,
        expires_at: DateTime<Utc>,
        scopes: Vec<String>,
    ) -> bool {
        let renew_in = expires_at - Utc::now() - self.renewal_offset;

        let stored = if renew_in >= Duration::zero() {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = records.get(&kind).map(|r| r.value.as_str()) != Some(value);
            records.insert(
                kind,
                TokenRecord {
                    kind,
                    value: value.to_string(),
                    expires_at,
                    scopes: scopes.clone(),
                },
            );
            changed
        } else {
            debug!("New {} is already past its renewal point, not storing it", kind);
            false
        };

        self.schedule(kind, renew_in, scopes);
        stored
    }

    /// Drop the stored value of `kind`. The timer is left untouched.
    pub fn clear(&self, kind: TokenKind) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.remove(&kind).is_some() {
            info!("Cleared expired {}", kind);
        }
    }

    /// True if a timer for `kind` is scheduled and has not fired yet.
    pub fn has_pending_timer(&self, kind: TokenKind) -> bool {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.get(&kind).is_some_and(|handle| !handle.is_finished())
    }

    /// Abort every outstanding expiration timer.
    pub fn cancel_timers(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    fn schedule(&self, kind: TokenKind, renew_in: Duration, scopes: Vec<String>) {
        let delay = renew_in.to_std().unwrap_or(std::time::Duration::ZERO);
        let events = self.events.clone();

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.remove(&kind) {
            previous.abort();
        }

        info!(
            "Renewal of {} scheduled in {}",
            kind,
            format_duration(renew_in.max(Duration::zero()))
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TokenMessage::Expired { kind, scopes });
        });
        timers.insert(kind, handle.abort_handle());
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Format duration as human-readable string (e.g., "45 min", "1 hour").
pub fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn store() -> (TokenStore, mpsc::UnboundedReceiver<TokenMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TokenStore::new(Duration::minutes(5), tx), rx)
    }

    fn scopes() -> Vec<String> {
        vec!["user.read".to_string()]
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "< 1 min");
        assert_eq!(format_duration(Duration::minutes(5)), "5 min");
        assert_eq!(format_duration(Duration::minutes(45)), "45 min");
        assert_eq!(format_duration(Duration::hours(1)), "1 hour");
        assert_eq!(format_duration(Duration::hours(2)), "2 hours");
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_token_stores_value() {
        let (store, _rx) = store();
        let stored = store.set_token(
            TokenKind::AccessToken,
            "abc",
            Utc::now() + Duration::hours(1),
            scopes(),
        );

        assert!(stored);
        assert_eq!(store.value(TokenKind::AccessToken).as_deref(), Some("abc"));
        assert!(store.value(TokenKind::IdToken).is_none());
        assert!(store.has_pending_timer(TokenKind::AccessToken));

        let remaining = store
            .record(TokenKind::AccessToken)
            .and_then(|r| r.time_until_expiry())
            .unwrap();
        assert!(remaining.num_minutes() > 55);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_value_is_not_reported_as_change() {
        let (store, _rx) = store();
        let expires = Utc::now() + Duration::hours(1);

        assert!(store.set_token(TokenKind::IdToken, "same", expires, scopes()));
        assert!(!store.set_token(TokenKind::IdToken, "same", expires, scopes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_timer_fires() {
        let (store, mut rx) = store();

        // Renewal point after 5 minutes
        store.set_token(
            TokenKind::AccessToken,
            "first",
            Utc::now() + Duration::minutes(10),
            scopes(),
        );
        // Replaces it with a renewal point after 15 minutes
        store.set_token(
            TokenKind::AccessToken,
            "second",
            Utc::now() + Duration::minutes(20),
            vec!["mail.read".to_string()],
        );

        let early = timeout(std::time::Duration::from_secs(6 * 60), rx.recv()).await;
        assert!(early.is_err(), "superseded timer must not fire");

        let message = rx.recv().await.unwrap();
        assert_eq!(
            message,
            TokenMessage::Expired {
                kind: TokenKind::AccessToken,
                scopes: vec!["mail.read".to_string()],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_not_stored_but_renews_immediately() {
        let (store, mut rx) = store();

        // Expires within the renewal offset
        let stored = store.set_token(
            TokenKind::AccessToken,
            "stale",
            Utc::now() + Duration::minutes(1),
            scopes(),
        );

        assert!(!stored);
        assert!(store.value(TokenKind::AccessToken).is_none());

        let message = timeout(std::time::Duration::from_millis(1), rx.recv())
            .await
            .expect("renewal should fire immediately")
            .unwrap();
        assert!(matches!(
            message,
            TokenMessage::Expired {
                kind: TokenKind::AccessToken,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_independent_per_kind() {
        let (store, mut rx) = store();
        let expires = Utc::now() + Duration::minutes(10);

        store.set_token(TokenKind::AccessToken, "a", expires, scopes());
        store.set_token(TokenKind::IdToken, "i", expires, scopes());

        let mut kinds = vec![];
        for _ in 0..2 {
            if let Some(TokenMessage::Expired { kind, .. }) = rx.recv().await {
                kinds.push(kind);
            }
        }
        assert!(kinds.contains(&TokenKind::AccessToken));
        assert!(kinds.contains(&TokenKind::IdToken));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_timers() {
        let (store, mut rx) = store();
        store.set_token(
            TokenKind::AccessToken,
            "a",
            Utc::now() + Duration::minutes(10),
            scopes(),
        );

        store.cancel_timers();
        assert!(!store.has_pending_timer(TokenKind::AccessToken));

        let fired = timeout(std::time::Duration::from_secs(3600), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_keeps_other_kind() {
        let (store, _rx) = store();
        let expires = Utc::now() + Duration::hours(1);
        store.set_token(TokenKind::AccessToken, "a", expires, scopes());
        store.set_token(TokenKind::IdToken, "i", expires, scopes());

        store.clear(TokenKind::AccessToken);

        assert!(store.value(TokenKind::AccessToken).is_none());
        assert_eq!(store.value(TokenKind::IdToken).as_deref(), Some("i"));
    }
}
