//! Auth scheme configuration and outbound header computation.
//!
//! `AuthConfig` is a tagged union keyed by `type` — each variant carries only
//! the fields its scheme needs, so header computation is an exhaustive match
//! instead of a chain of optional-field checks. The JSON form matches the
//! stored data-source records (`{"type": "api_key", "api_key": "...", ...}`).
//!
//! Secret fields (`api_key`, `password`, `token`, `client_secret`) are
//! persisted only in encrypted form; an in-memory `AuthConfig` may hold
//! either encrypted or decrypted values — callers track which (the connector
//! manager decrypts exactly once when it constructs a connector).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header used for API-key auth when none is configured
const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Authentication scheme for one data source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// API key in a configurable header, optionally prefixed.
    ApiKey {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_header: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_prefix: Option<String>,
    },
    /// `Authorization: Basic base64(username:password)`.
    Basic { username: String, password: String },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// OAuth2 client credentials. The token exchange itself lives outside
    /// the connector; this variant produces no outbound headers.
    Oauth2 {
        client_id: String,
        client_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Arbitrary headers merged verbatim into each request.
    CustomHeader { custom_headers: HashMap<String, String> },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

impl AuthConfig {
    /// Computes the outbound auth headers for this scheme.
    ///
    /// Schemes with an empty secret produce no headers rather than sending a
    /// malformed credential.
    pub fn auth_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        match self {
            AuthConfig::None => {}
            AuthConfig::ApiKey {
                api_key,
                api_key_header,
                api_key_prefix,
            } => {
                if !api_key.is_empty() {
                    let name = api_key_header
                        .as_deref()
                        .unwrap_or(DEFAULT_API_KEY_HEADER)
                        .to_string();
                    let prefix = api_key_prefix.as_deref().unwrap_or("");
                    headers.insert(name, format!("{}{}", prefix, api_key));
                }
            }
            AuthConfig::Basic { username, password } => {
                if !username.is_empty() && !password.is_empty() {
                    let encoded = BASE64.encode(format!("{}:{}", username, password));
                    headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
                }
            }
            AuthConfig::Bearer { token } => {
                if !token.is_empty() {
                    headers.insert("Authorization".to_string(), format!("Bearer {}", token));
                }
            }
            AuthConfig::Oauth2 { .. } => {}
            AuthConfig::CustomHeader { custom_headers } => {
                headers.extend(custom_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        headers
    }

    /// Runs `f` over every populated secret field, in place.
    ///
    /// The connector manager uses this to pass secrets through the vault
    /// without per-variant knowledge. The field name given to `f` is safe to
    /// log; the value is not.
    pub fn try_visit_secrets_mut<E, F>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&'static str, &mut String) -> Result<(), E>,
    {
        match self {
            AuthConfig::None | AuthConfig::CustomHeader { .. } => {}
            AuthConfig::ApiKey { api_key, .. } => {
                if !api_key.is_empty() {
                    f("api_key", api_key)?;
                }
            }
            AuthConfig::Basic { password, .. } => {
                if !password.is_empty() {
                    f("password", password)?;
                }
            }
            AuthConfig::Bearer { token } => {
                if !token.is_empty() {
                    f("token", token)?;
                }
            }
            AuthConfig::Oauth2 {
                client_secret,
                token,
                ..
            } => {
                if !client_secret.is_empty() {
                    f("client_secret", client_secret)?;
                }
                if let Some(token) = token {
                    if !token.is_empty() {
                        f("token", token)?;
                    }
                }
            }
        }
        Ok(())
    }
}
