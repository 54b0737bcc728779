//! iFlow API and OAuth constants
//!
//! Public OAuth client configuration of the iFlow CLI. These values identify
//! the public client application and are not user secrets; the user's
//! tokens and API keys are managed by the account store.

/// Base URL of the OpenAI-compatible inference API
pub const BASE_URL: &str = "https://apis.iflow.cn/v1";

/// Token endpoint for code exchange and token refresh
pub const OAUTH_TOKEN_URL: &str = "https://iflow.cn/oauth/token";

/// User info endpoint, returns the API key bound to an access token
pub const USER_INFO_URL: &str = "https://iflow.cn/api/oauth/getUserInfo";

/// Public OAuth client ID
pub const CLIENT_ID: &str = "10009311001";

/// Public OAuth client secret (shipped with the iFlow CLI)
pub const CLIENT_SECRET: &str = "4Z3YjXycVsQvyGF1etiNlIBB4RsqSDtW";

/// Client identity sent upstream on every inference request
pub const USER_AGENT: &str = "OpenCode-iFlow";

/// Access tokens are refreshed this long before their recorded expiry
pub const TOKEN_EXPIRY_SKEW_MILLIS: u64 = 60_000;
