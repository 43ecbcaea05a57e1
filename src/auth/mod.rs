//! Azure AD authentication module.
//!
//! Provides the delegate boundary, the OAuth2 PKCE delegate and the
//! token store with its expiration timers.

pub mod delegate;
pub mod oauth;
pub mod token_store;

pub use delegate::{Account, AuthDelegate, IdToken, TokenRequest, TokenResponse};
pub use oauth::OAuthDelegate;
pub use token_store::{TokenKind, TokenMessage, TokenRecord, TokenStore};
