//! Authentication strategies.
//!
//! # Design
//! A strategy is plain data applied per-request as header material; nothing
//! here touches the network. The strategy also selects the API version
//! segment: bearer tokens are only honored by the newer surface, so they
//! force `v2` while every other strategy stays on `v1`.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// API version segment of the base endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of authenticating against the hosted account.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Personal API key, sent as `x-api-key`.
    ApiKey(String),
    /// OAuth bearer token, sent as `Authorization: Bearer …`.
    Bearer(String),
    /// Login session, sent as `Authorization: Session base64(login:user_id:key)`.
    Session {
        login: String,
        user_id: i64,
        key: String,
    },
}

impl Auth {
    pub fn api_key(key: impl Into<String>) -> Auth {
        Auth::ApiKey(key.into())
    }

    pub fn bearer(token: impl Into<String>) -> Auth {
        Auth::Bearer(token.into())
    }

    pub fn session(login: impl Into<String>, user_id: i64, key: impl Into<String>) -> Auth {
        Auth::Session {
            login: login.into(),
            user_id,
            key: key.into(),
        }
    }

    /// Header name and value carrying this strategy.
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Auth::ApiKey(key) => ("x-api-key", key.clone()),
            Auth::Bearer(token) => ("Authorization", format!("Bearer {token}")),
            Auth::Session {
                login,
                user_id,
                key,
            } => {
                let packed = BASE64.encode(format!("{login}:{user_id}:{key}"));
                ("Authorization", format!("Session {packed}"))
            }
        }
    }

    /// Version segment this strategy is served under.
    pub fn api_version(&self) -> ApiVersion {
        match self {
            Auth::Bearer(_) => ApiVersion::V2,
            _ => ApiVersion::V1,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::ApiKey(_) => f.write_str("Auth::ApiKey(…)"),
            Auth::Bearer(_) => f.write_str("Auth::Bearer(…)"),
            Auth::Session { login, user_id, .. } => f
                .debug_struct("Auth::Session")
                .field("login", login)
                .field("user_id", user_id)
                .finish_non_exhaustive(),
        }
    }
}
