//! iFlow account and credential library
//!
//! Provides the account data model, the persisted account snapshot, and the
//! OAuth token refresh exchange for the iFlow API. This crate has no
//! knowledge of selection policy or retries; those live in `iflow-pool`.
//!
//! Credential flow:
//! 1. An onboarding flow produces an `Account` (static API key or OAuth tokens)
//! 2. The pool persists it through a `Persistence` implementation (`AccountStore`)
//! 3. When an OAuth access token nears expiry, `TokenExchange::refresh()` obtains
//!    a new token pair and the API key bound to it
//! 4. The pool applies the result and persists the snapshot again

pub mod constants;
pub mod credentials;
pub mod error;
pub mod legacy;
pub mod token;

pub use constants::*;
pub use credentials::{
    Account, AccountStorage, AccountStore, AuthMethod, Persistence, STORAGE_VERSION,
    generate_account_id,
};
pub use error::{Error, Result};
pub use legacy::decode_refresh_parts;
pub use token::{
    HttpTokenExchange, RefreshedToken, TokenExchange, TokenResponse, access_token_expired,
    now_millis,
};
