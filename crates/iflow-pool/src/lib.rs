//! Credential pool and resilient dispatch for iFlow accounts
//!
//! Manages multiple iFlow accounts with sticky or round-robin selection,
//! rate-limit holds, lazy health recovery, and request-time token refresh.
//! The `Dispatcher` turns one logical request into a bounded sequence of
//! attempts across the pool.
//!
//! Account lifecycle:
//! 1. An onboarding flow hands a complete `Account` to `Pool::add`
//! 2. `Pool::select_account` picks an available account per strategy
//! 3. Expired OAuth access tokens are refreshed before use, then persisted
//! 4. Upstream 429 → account held until `now + retry-after`
//! 5. Upstream 401/403, repeated 5xx, or a failed refresh → unhealthy for 5 minutes
//! 6. The next selection after the hold or cooldown ends clears it in place

pub mod classify;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod transport;

pub use classify::{backoff_delay, classify_status, is_transient_network_error, parse_retry_after};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchConfig, Dispatcher, OutboundRequest};
pub use error::{Budget, Error, Result};
pub use lifecycle::{CredentialUpdate, is_expired, refresh, refresh_if_expired};
pub use pool::{Pool, SelectionStrategy};
pub use transport::{
    PreparedRequest, ReqwestTransport, Transport, TransportError, TransportErrorKind,
    UpstreamResponse,
};
