//! Durable callback queue.
//!
//! Application hooks are not invoked directly. Each event is first written
//! to the persistent store and only removed once its hook has completed,
//! so notifications raised right before a redirect (or a crash) are
//! delivered on the next start. Delivery is at-least-once: hooks must
//! tolerate being invoked twice for the same entry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::storage::{self, KeyValueStore, CALLBACK_QUEUE_KEY};

/// Future returned by a hook.
pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Application hook, invoked with a session handle and the event arguments.
pub type Hook<H> = Arc<dyn Fn(H, Vec<Value>) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a [`Hook`].
pub fn hook<H, F, Fut>(f: F) -> Hook<H>
where
    F: Fn(H, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |handle, arguments| Box::pin(f(handle, arguments)))
}

/// Events that can carry an application hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    #[serde(rename = "auth.onAuthentication")]
    OnAuthentication,
    #[serde(rename = "auth.onToken")]
    OnToken,
    #[serde(rename = "graph.onResponse")]
    OnGraphResponse,
}

impl HookKind {
    /// Persisted name of the hook.
    pub fn path(&self) -> &'static str {
        match self {
            Self::OnAuthentication => "auth.onAuthentication",
            Self::OnToken => "auth.onToken",
            Self::OnGraphResponse => "graph.onResponse",
        }
    }
}

/// Hooks resolved once at configuration time.
pub struct Hooks<H> {
    pub on_authentication: Option<Hook<H>>,
    pub on_token: Option<Hook<H>>,
    pub on_graph_response: Option<Hook<H>>,
}

impl<H> Hooks<H> {
    pub fn get(&self, kind: HookKind) -> Option<&Hook<H>> {
        match kind {
            HookKind::OnAuthentication => self.on_authentication.as_ref(),
            HookKind::OnToken => self.on_token.as_ref(),
            HookKind::OnGraphResponse => self.on_graph_response.as_ref(),
        }
    }
}

impl<H> Default for Hooks<H> {
    fn default() -> Self {
        Self {
            on_authentication: None,
            on_token: None,
            on_graph_response: None,
        }
    }
}

impl<H> Clone for Hooks<H> {
    fn clone(&self) -> Self {
        Self {
            on_authentication: self.on_authentication.clone(),
            on_token: self.on_token.clone(),
            on_graph_response: self.on_graph_response.clone(),
        }
    }
}

/// A hook invocation waiting for successful delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallback {
    pub id: String,
    pub callback: HookKind,
    pub arguments: Vec<Value>,
}

/// Queue of pending hook invocations, mirrored to the persistent store.
pub struct CallbackQueue<H> {
    store: Arc<dyn KeyValueStore>,
    hooks: Hooks<H>,
    entries: Mutex<Vec<PendingCallback>>,
    next_id: AtomicU64,
}

impl<H: Clone> CallbackQueue<H> {
    /// Create the queue and rehydrate it from the store.
    ///
    /// Nothing is delivered here; call [`CallbackQueue::drain`] once the
    /// session handle exists.
    pub fn new(store: Arc<dyn KeyValueStore>, hooks: Hooks<H>) -> Self {
        let mut entries = Vec::new();

        match storage::load_json::<Vec<PendingCallback>>(store.as_ref(), CALLBACK_QUEUE_KEY) {
            Ok(Some(saved)) => {
                info!("Restored {} pending callbacks", saved.len());
                entries.extend(saved);
            }
            Ok(None) => {}
            Err(e) => error!("Failed to load callback queue: {}", e),
        }

        let next_id = entries
            .iter()
            .filter_map(|entry| id_sequence(&entry.id))
            .max()
            .map_or(1, |max| max + 1);

        Self {
            store,
            hooks,
            entries: Mutex::new(entries),
            next_id: AtomicU64::new(next_id),
        }
    }

    /// Snapshot of the entries still waiting for delivery.
    pub fn pending(&self) -> Vec<PendingCallback> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.hooks.get(kind).is_some()
    }

    /// Persist an event for `kind` and try to deliver it right away.
    ///
    /// Does nothing when no hook is configured for `kind`.
    pub async fn enqueue(&self, handle: &H, kind: HookKind, arguments: Vec<Value>) {
        if !self.has_hook(kind) {
            return;
        }

        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = PendingCallback {
            id: format!("cb-{}{}", kind.path(), sequence),
            callback: kind,
            arguments,
        };

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|existing| existing.id != entry.id);
            entries.push(entry.clone());
            self.persist(&entries);
        }

        debug!("Queued callback '{}'", entry.id);
        self.deliver(handle, vec![entry]).await;
    }

    /// Attempt delivery of every queued entry, in queue order.
    pub async fn drain(&self, handle: &H) {
        let entries = self.pending();
        if !entries.is_empty() {
            self.deliver(handle, entries).await;
        }
    }

    /// Invoke the hook of each entry once. Delivered entries are removed;
    /// failed ones stay queued for the next drain.
    async fn deliver(&self, handle: &H, entries: Vec<PendingCallback>) {
        for entry in entries {
            let Some(hook) = self.hooks.get(entry.callback) else {
                warn!(
                    "Callback '{}' has no configured hook, keeping it queued",
                    entry.id
                );
                continue;
            };

            match hook(handle.clone(), entry.arguments.clone()).await {
                Ok(()) => {
                    let mut queued = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                    queued.retain(|existing| existing.id != entry.id);
                    self.persist(&queued);
                    debug!("Delivered callback '{}'", entry.id);
                }
                Err(e) => {
                    warn!("Callback '{}' failed with error: {}", entry.id, e);
                }
            }
        }
    }

    fn persist(&self, entries: &[PendingCallback]) {
        let result = if entries.is_empty() {
            self.store.remove_item(CALLBACK_QUEUE_KEY)
        } else {
            storage::save_json(self.store.as_ref(), CALLBACK_QUEUE_KEY, entries)
        };

        if let Err(e) = result {
            error!("Failed to persist callback queue: {}", e);
        }
    }
}

/// Trailing sequence number of a callback id (`cb-auth.onToken12` -> 12).
fn id_sequence(id: &str) -> Option<u64> {
    let digits = id.len() - id.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    id[id.len() - digits..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook(calls: Arc<AtomicUsize>, fail: bool) -> Hook<()> {
        hook(move |_, _| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    anyhow::bail!("hook failed");
                }
                Ok(())
            }
        })
    }

    fn stored_queue(store: &MemoryStore) -> Vec<PendingCallback> {
        storage::load_json(store, CALLBACK_QUEUE_KEY)
            .unwrap()
            .unwrap_or_default()
    }

    #[test]
    fn test_hook_paths() {
        assert_eq!(HookKind::OnToken.path(), "auth.onToken");
        assert_eq!(
            serde_json::to_value(HookKind::OnGraphResponse).unwrap(),
            json!("graph.onResponse")
        );
    }

    #[test]
    fn test_id_sequence() {
        assert_eq!(id_sequence("cb-auth.onToken12"), Some(12));
        assert_eq!(id_sequence("cb-auth.onToken"), None);
    }

    #[tokio::test]
    async fn test_enqueue_without_hook_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue: CallbackQueue<()> = CallbackQueue::new(store.clone(), Hooks::default());

        queue.enqueue(&(), HookKind::OnToken, vec![json!(1)]).await;

        assert!(queue.pending().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_successful_delivery_removes_entry() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Hooks {
            on_token: Some(counting_hook(Arc::clone(&calls), false)),
            ..Hooks::default()
        };
        let queue = CallbackQueue::new(store.clone(), hooks);

        queue
            .enqueue(&(), HookKind::OnToken, vec![Value::Null, json!({"a": 1})])
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.pending().is_empty());
        assert!(store.get_item(CALLBACK_QUEUE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_hook_keeps_entry_across_drains() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Hooks {
            on_authentication: Some(counting_hook(Arc::clone(&calls), true)),
            ..Hooks::default()
        };
        let queue = CallbackQueue::new(store.clone(), hooks.clone());

        queue
            .enqueue(&(), HookKind::OnAuthentication, vec![json!("boom")])
            .await;
        let persisted = stored_queue(&store);
        assert_eq!(persisted.len(), 1);
        let id = persisted[0].id.clone();

        queue.drain(&()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(stored_queue(&store)[0].id, id);

        // Next start: same id is rehydrated and retried
        let reloaded = CallbackQueue::new(store.clone(), hooks);
        assert_eq!(reloaded.pending()[0].id, id);
        reloaded.drain(&()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stored_queue(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_reload_delivers_entries_saved_before_redirect() {
        let store = Arc::new(MemoryStore::new());
        let saved = vec![
            PendingCallback {
                id: "cb-auth.onToken4".into(),
                callback: HookKind::OnToken,
                arguments: vec![json!(1)],
            },
            PendingCallback {
                id: "cb-graph.onResponse7".into(),
                callback: HookKind::OnGraphResponse,
                arguments: vec![json!({})],
            },
        ];
        storage::save_json(store.as_ref(), CALLBACK_QUEUE_KEY, &saved).unwrap();

        // Only the token hook is configured after the reload
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Hooks {
            on_token: Some(counting_hook(Arc::clone(&calls), false)),
            ..Hooks::default()
        };
        let queue = CallbackQueue::new(store.clone(), hooks);
        queue.drain(&()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let remaining = stored_queue(&store);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "cb-graph.onResponse7");
    }

    #[tokio::test]
    async fn test_ids_continue_after_restored_entries() {
        let store = Arc::new(MemoryStore::new());
        let saved = vec![PendingCallback {
            id: "cb-auth.onToken7".into(),
            callback: HookKind::OnToken,
            arguments: vec![],
        }];
        storage::save_json(store.as_ref(), CALLBACK_QUEUE_KEY, &saved).unwrap();

        let hooks = Hooks {
            on_token: Some(counting_hook(Arc::new(AtomicUsize::new(0)), true)),
            ..Hooks::default()
        };
        let queue = CallbackQueue::new(store, hooks);
        queue.enqueue(&(), HookKind::OnToken, vec![]).await;

        let ids: Vec<String> = queue.pending().into_iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec!["cb-auth.onToken7", "cb-auth.onToken8"]);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Hooks {
            on_token: Some(counting_hook(Arc::clone(&calls), true)),
            ..Hooks::default()
        };
        let queue = CallbackQueue::new(store, hooks);

        queue.enqueue(&(), HookKind::OnToken, vec![]).await;
        queue.enqueue(&(), HookKind::OnToken, vec![]).await;

        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_ne!(pending[0].id, pending[1].id);
    }
}
