//! Decoding of the legacy packed refresh credential
//!
//! Older clients stored the refresh token and auth method as a single
//! base64-encoded JSON blob (`{"refreshToken": "...", "authMethod": "oauth"}`).
//! Importing such a blob yields the equivalent `AuthMethod`. Corrupt blobs are
//! an error, never silently treated as a static-key account.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use serde::Deserialize;

use crate::credentials::AuthMethod;
use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshParts {
    #[serde(default)]
    refresh_token: Option<String>,
    auth_method: String,
}

/// Decode a legacy packed refresh credential into an `AuthMethod`.
///
/// The returned OAuth variant carries only the refresh token; access token
/// and expiry are unknown, so the account refreshes on first use once the
/// caller records an expiry.
pub fn decode_refresh_parts(encoded: &str) -> Result<AuthMethod> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::RefreshDecode(format!("invalid base64: {e}")))?;
    let parts: RefreshParts = serde_json::from_slice(&bytes)
        .map_err(|e| Error::RefreshDecode(format!("invalid JSON payload: {e}")))?;

    match parts.auth_method.as_str() {
        "oauth" => Ok(AuthMethod::OAuth {
            refresh_token: parts.refresh_token.map(Secret::new),
            access_token: None,
            expires_at: None,
        }),
        "apikey" => Ok(AuthMethod::ApiKey),
        other => Err(Error::RefreshDecode(format!("unknown auth method: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn decodes_oauth_blob() {
        let encoded = encode(r#"{"refreshToken":"rt_abc","authMethod":"oauth"}"#);
        match decode_refresh_parts(&encoded).unwrap() {
            AuthMethod::OAuth {
                refresh_token,
                access_token,
                expires_at,
            } => {
                assert_eq!(refresh_token.unwrap().expose(), "rt_abc");
                assert!(access_token.is_none());
                assert!(expires_at.is_none());
            }
            other => panic!("expected oauth, got {other:?}"),
        }
    }

    #[test]
    fn decodes_api_key_blob() {
        let encoded = encode(r#"{"authMethod":"apikey"}"#);
        assert_eq!(decode_refresh_parts(&encoded).unwrap(), AuthMethod::ApiKey);
    }

    #[test]
    fn corrupt_base64_is_an_error() {
        let err = decode_refresh_parts("!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::RefreshDecode(_)), "got: {err}");
    }

    #[test]
    fn corrupt_json_is_an_error_not_a_static_key_fallback() {
        let err = decode_refresh_parts(&encode("{broken")).unwrap_err();
        assert!(matches!(err, Error::RefreshDecode(_)), "got: {err}");
    }

    #[test]
    fn unknown_method_is_an_error() {
        let err = decode_refresh_parts(&encode(r#"{"authMethod":"saml"}"#)).unwrap_err();
        assert!(err.to_string().contains("saml"), "got: {err}");
    }
}
