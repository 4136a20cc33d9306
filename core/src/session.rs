//! Transport session bound to one hosted account.
//!
//! # Design
//! `Session` owns everything a remote call needs: the host computed from the
//! account, the optional auth strategy (which also picks the API version
//! segment), the default context merged into every call, the typed codec,
//! and the transport. Request building stays here and in the proxies;
//! classification of every response goes through one `classify_response` so
//! the error taxonomy cannot drift between operations.

use std::fmt;

use serde::Deserialize;
use tracing::debug;

use crate::auth::{ApiVersion, Auth};
use crate::codec::{encode_to_string, Codec, Value, ValueMap};
use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Transport, UreqTransport};
use crate::model::Model;
use crate::report::Report;
use crate::wizard::Wizard;

/// Hosted domain the account subdomain hangs off.
const VENDOR_DOMAIN: &str = "stockline.io";

/// Entity type answering the "current user preferences" call.
const USER_ENTITY: &str = "user";

/// Per-call key-value map transmitted with every request.
pub type Context = ValueMap;

pub struct Session {
    account: String,
    host: String,
    auth: Option<Auth>,
    context: Context,
    codec: Codec,
    transport: Box<dyn Transport>,
    user_agent: String,
}

impl Session {
    /// Session for an account, unauthenticated.
    ///
    /// The account `localhost` targets a local development server instead of
    /// the hosted domain.
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        let host = if account == "localhost" {
            "http://localhost:8000".to_string()
        } else {
            format!("https://{account}.{VENDOR_DOMAIN}")
        };
        Session {
            account,
            host,
            auth: None,
            context: Context::new(),
            codec: Codec::default(),
            transport: Box::new(UreqTransport::default()),
            user_agent: concat!("stockline-core/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Point the session at an explicit host URL (local mock servers).
    pub fn with_endpoint(mut self, url: &str) -> Self {
        self.host = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    /// Switch strategies; every subsequent request uses the new headers and
    /// version segment.
    pub fn set_auth(&mut self, auth: Option<Auth>) {
        self.auth = auth;
    }

    pub fn api_version(&self) -> ApiVersion {
        self.auth
            .as_ref()
            .map(Auth::api_version)
            .unwrap_or(ApiVersion::V1)
    }

    /// Versioned base endpoint, e.g. `https://acme.stockline.io/api/v1`.
    pub fn base_url(&self) -> String {
        format!("{}/api/{}", self.host, self.api_version())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Mutable codec access, for registering custom envelope kinds.
    pub fn codec_mut(&mut self) -> &mut Codec {
        &mut self.codec
    }

    /// Default context overlaid with call-site entries; call-site wins.
    pub(crate) fn merged_context(&self, overrides: Option<&Context>) -> Context {
        let mut merged = self.context.clone();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Proxy for one entity type.
    pub fn model(&self, name: impl Into<String>) -> Model<'_> {
        Model::new(self, name.into())
    }

    /// Proxy for one named wizard.
    pub fn wizard(&self, name: impl Into<String>) -> Wizard<'_> {
        Wizard::new(self, name.into())
    }

    /// Proxy for one named report.
    pub fn report(&self, name: impl Into<String>) -> Report<'_> {
        Report::new(self, name.into())
    }

    /// Replace the default context with the server's current user
    /// preferences. Never called implicitly.
    pub fn refresh_context(&mut self) -> Result<&Context> {
        let preferences = self
            .model(USER_ENTITY)
            .call("get_preferences", &[Value::Bool(true)], None)?;
        match preferences {
            Value::Map(map) => {
                self.context = map;
                Ok(&self.context)
            }
            other => Err(Error::Codec(crate::error::CodecError::malformed(
                "preferences",
                format!("expected a map, got {}", other.kind_name()),
            ))),
        }
    }

    /// Exchange credentials for a login session.
    ///
    /// A refusal (null reply) returns `Ok(None)`; on success the session
    /// adopts the returned credentials as its auth strategy and the
    /// `(user_id, session_key)` pair is handed back.
    pub fn login(&mut self, login: &str, password: &str) -> Result<Option<(i64, String)>> {
        #[derive(Deserialize)]
        struct LoginReply {
            result: Option<(i64, String)>,
        }

        let body = serde_json::json!({
            "method": "common.db.login",
            "params": [login, password],
        });
        let mut request = HttpRequest::new(HttpMethod::Post, format!("{}/", self.host));
        request.body = Some(body.to_string());
        request
            .headers
            .push(("User-Agent".to_string(), self.user_agent.clone()));

        debug!(account = %self.account, login, "login");
        let response = self.transport.execute(&request)?;
        if !(200..300).contains(&response.status) {
            return Err(classify_failure(&response));
        }
        let reply: LoginReply = serde_json::from_str(&response.body)
            .map_err(|e| Error::Codec(crate::error::CodecError::Json(e)))?;
        match reply.result {
            Some((user_id, key)) => {
                self.auth = Some(Auth::session(login, user_id, key.clone()));
                Ok(Some((user_id, key)))
            }
            None => Ok(None),
        }
    }

    /// Cheap probe telling whether the current credentials are still
    /// honored. Authentication failures map to `false`; anything else
    /// propagates.
    pub fn is_auth_alive(&self) -> Result<bool> {
        let probe = self
            .model(USER_ENTITY)
            .search(&crate::model::Domain::all(), None, Some(1), None, None);
        match probe {
            Ok(_) => Ok(true),
            Err(err) if err.is_authentication() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Execute a prepared request: attach session headers, run it through
    /// the transport, classify, and decode the success body.
    pub(crate) fn execute(&self, mut request: HttpRequest) -> Result<Value> {
        request
            .headers
            .push(("User-Agent".to_string(), self.user_agent.clone()));
        if let Some(auth) = &self.auth {
            let (name, value) = auth.header();
            request.headers.push((name.to_string(), value));
        }
        debug!(method = ?request.method, url = %request.url, "dispatch");
        let response = self.transport.execute(&request)?;
        classify_response(&self.codec, &response)
    }

    /// Attach the merged context to a request as the `context` query param.
    pub(crate) fn attach_context(&self, request: &mut HttpRequest, overrides: Option<&Context>) {
        let merged = self.merged_context(overrides);
        request.query.push((
            "context".to_string(),
            encode_to_string(&Value::Map(merged)),
        ));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("host", &self.host)
            .field("auth", &self.auth)
            .field("api_version", &self.api_version())
            .finish_non_exhaustive()
    }
}

/// Fixed shape of vendor error bodies; every field is optional because
/// plain-text bodies exist in the wild.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
    code: Option<serde_json::Value>,
    description: Option<String>,
}

fn parse_error_body(body: &str) -> ErrorBody {
    serde_json::from_str(body).unwrap_or(ErrorBody {
        kind: None,
        message: None,
        code: None,
        description: None,
    })
}

fn code_text(code: Option<serde_json::Value>) -> Option<String> {
    match code? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Map a non-2xx response to the error taxonomy.
fn classify_failure(response: &HttpResponse) -> Error {
    let parsed = parse_error_body(&response.body);
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| response.body.clone());
    match response.status {
        400 if parsed.kind.as_deref() == Some("UserError") => Error::User {
            message,
            code: code_text(parsed.code),
            description: parsed.description,
        },
        401 => Error::Authentication {
            message,
            status: 401,
        },
        status if (400..500).contains(&status) => Error::Client { message, status },
        status => Error::Server {
            message,
            status,
            incident_id: response.header("X-Sentry-ID").map(|s| s.to_string()),
        },
    }
}

/// Decode a 2xx body through the codec; everything else classifies.
pub(crate) fn classify_response(codec: &Codec, response: &HttpResponse) -> Result<Value> {
    if (200..300).contains(&response.status) {
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(codec.decode_str(&response.body)?);
    }
    Err(classify_failure(response))
}
