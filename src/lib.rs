//! Azure AD session management for Microsoft Graph.
//!
//! A [`Session`] signs the user in through an [`AuthDelegate`], keeps
//! access and id tokens fresh, delivers application hooks through a
//! durable queue, and fetches Microsoft Graph resources with caching and
//! `$batch` grouping.

#![deny(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod graph;
pub mod keychain;
pub mod queue;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use auth::{AuthDelegate, OAuthDelegate, TokenRequest, TokenResponse};
pub use config::{CacheLocation, Config};
pub use error::{DelegateError, GraphError, SessionError};
pub use graph::{GraphRequest, GraphResult, ReqwestTransport};
pub use keychain::{KeyringStore, MemorySecretStore, SecretStore};
pub use queue::hook;
pub use session::{sign_out_hook, Session, SessionData, SessionHooks, SessionState};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
