//! Adapter for the client's WebUI API (qBittorrent v2 endpoints).

use crate::config::{Credentials, WebUiConfig};
use crate::error::ApiError;
use async_trait::async_trait;
use common::{ClientPortState, MIN_CLIENT_PORT};
use reqwest::header::{COOKIE, REFERER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const LOGIN: &str = "/api/v2/auth/login";
pub const VERSION: &str = "/api/v2/app/version";
pub const PREFERENCES: &str = "/api/v2/app/preferences";
pub const SET_PREFERENCES: &str = "/api/v2/app/setPreferences";
pub const MAINDATA: &str = "/api/v2/sync/maindata";

const LOGIN_OK: &str = "Ok.";
const SESSION_COOKIE: &str = "SID";
/// Field names holding the listening port, in order of preference.
static PORT_FIELDS: [&str; 2] = ["listen_port", "port"];
const RANDOM_PORT_FIELD: &str = "use_random_port";

/// The operations the reconciler needs from the client.
#[async_trait]
pub trait ClientApi: Send + Sync {
    /// Lightweight liveness probe; returns the client version.
    async fn version(&self) -> Result<String, ApiError>;

    /// Log in if credentials are configured, otherwise do nothing.
    async fn authenticate(&self) -> Result<(), ApiError>;

    async fn preferences(&self) -> Result<Value, ApiError>;

    async fn runtime_status(&self) -> Result<Value, ApiError>;

    /// Write the listening port and turn random-port mode off in one request.
    async fn set_port(&self, port: u16) -> Result<(), ApiError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    fn cookie(&self) -> String {
        format!("{SESSION_COOKIE}={}", self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

pub struct WebUiClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    session: RwLock<Option<SessionToken>>,
}

impl WebUiClient {
    pub fn new(config: &WebUiConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
            session: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST the credentials and capture the session cookie.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionToken, ApiError> {
        let resp = self
            .http
            .post(self.url(LOGIN))
            .header(REFERER, &self.base_url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(LOGIN, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Auth(format!("login returned {status}")));
        }

        let token = session_cookie(&resp);
        let body = resp.text().await.map_err(|e| ApiError::from_reqwest(LOGIN, e))?;
        if body != LOGIN_OK {
            return Err(ApiError::Auth(format!("login rejected: {}", body.trim())));
        }

        token.ok_or_else(|| ApiError::Auth("login succeeded without a session cookie".to_string()))
    }

    async fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.read().await.as_ref() {
            Some(token) => request.header(COOKIE, token.cookie()),
            None => request,
        }
    }

    /// Send a request, logging in again once if the session was rejected.
    async fn execute<F>(&self, endpoint: &'static str, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut resp = self
            .with_session(build())
            .await
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(endpoint, e))?;

        if resp.status() == StatusCode::FORBIDDEN && self.credentials.is_some() {
            debug!(endpoint, "session rejected, logging in again");
            self.authenticate().await?;
            resp = self
                .with_session(build())
                .await
                .send()
                .await
                .map_err(|e| ApiError::from_reqwest(endpoint, e))?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status { endpoint, status });
        }
        Ok(resp)
    }

    async fn get_json(&self, endpoint: &'static str) -> Result<Value, ApiError> {
        let resp = self.execute(endpoint, || self.http.get(self.url(endpoint))).await?;
        let body = resp.text().await.map_err(|e| ApiError::from_reqwest(endpoint, e))?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode { endpoint, source })
    }
}

#[async_trait]
impl ClientApi for WebUiClient {
    async fn version(&self) -> Result<String, ApiError> {
        let resp = self.execute(VERSION, || self.http.get(self.url(VERSION))).await?;
        let body = resp.text().await.map_err(|e| ApiError::from_reqwest(VERSION, e))?;
        Ok(body.trim().to_string())
    }

    async fn authenticate(&self) -> Result<(), ApiError> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let token = self.login(credentials).await?;
        info!(username = %credentials.username, "logged in to WebUI");
        *self.session.write().await = Some(token);
        Ok(())
    }

    async fn preferences(&self) -> Result<Value, ApiError> {
        self.get_json(PREFERENCES).await
    }

    async fn runtime_status(&self) -> Result<Value, ApiError> {
        self.get_json(MAINDATA).await
    }

    async fn set_port(&self, port: u16) -> Result<(), ApiError> {
        let payload = port_payload(port).to_string();
        self.execute(SET_PREFERENCES, || {
            self.http
                .post(self.url(SET_PREFERENCES))
                .form(&[("json", payload.as_str())])
        })
        .await?;
        Ok(())
    }
}

fn session_cookie(resp: &Response) -> Option<SessionToken> {
    resp.cookies()
        .find(|cookie| cookie.name() == SESSION_COOKIE && !cookie.value().is_empty())
        .map(|cookie| SessionToken(cookie.value().to_string()))
}

/// Body of the `json` form field sent to `setPreferences`.
pub fn port_payload(port: u16) -> Value {
    json!({ "listen_port": port, "use_random_port": false })
}

/// Find the listening port in a preferences or maindata payload.
///
/// Fields are tried in order; the first integer in `[1024, 65535]` wins.
/// Anything else counts as absent: the WebUI reports 0 or omits the field
/// while it is still starting up. Maindata nests the value under
/// `server_state`, which is searched after the top level.
pub fn extract_port(payload: &Value) -> Option<u16> {
    [Some(payload), payload.get("server_state")]
        .into_iter()
        .flatten()
        .flat_map(|object| PORT_FIELDS.iter().filter_map(move |field| object.get(field)))
        .find_map(|value| {
            value
                .as_u64()
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port >= MIN_CLIENT_PORT)
        })
}

/// `None` when the payload does not carry the flag.
pub fn random_port_flag(payload: &Value) -> Option<bool> {
    payload.get(RANDOM_PORT_FIELD).and_then(Value::as_bool)
}

pub fn client_port_state(preferences: &Value, runtime: Option<&Value>) -> ClientPortState {
    ClientPortState {
        configured_port: extract_port(preferences),
        runtime_port: runtime.and_then(extract_port),
        random_port: random_port_flag(preferences),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_primary_field() {
        assert_eq!(extract_port(&json!({ "listen_port": 51820, "port": 6881 })), Some(51820));
    }

    #[test]
    fn falls_back_to_alternate_field() {
        assert_eq!(extract_port(&json!({ "port": 48392 })), Some(48392));
        assert_eq!(extract_port(&json!({ "listen_port": 0, "port": 48392 })), Some(48392));
    }

    #[test]
    fn out_of_range_counts_as_absent() {
        assert_eq!(extract_port(&json!({ "listen_port": 0 })), None);
        assert_eq!(extract_port(&json!({ "listen_port": 1023 })), None);
        assert_eq!(extract_port(&json!({ "listen_port": 70000 })), None);
        assert_eq!(extract_port(&json!({ "listen_port": -5 })), None);
        assert_eq!(extract_port(&json!({})), None);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert_eq!(extract_port(&json!({ "listen_port": 1024 })), Some(1024));
        assert_eq!(extract_port(&json!({ "listen_port": 65535 })), Some(65535));
    }

    #[test]
    fn wrong_types_count_as_absent() {
        assert_eq!(extract_port(&json!({ "listen_port": "51820" })), None);
        assert_eq!(extract_port(&json!({ "listen_port": 51820.5 })), None);
        assert_eq!(extract_port(&json!([51820])), None);
    }

    #[test]
    fn reads_nested_server_state() {
        let maindata = json!({ "rid": 3, "server_state": { "listen_port": 51820 } });
        assert_eq!(extract_port(&maindata), Some(51820));
    }

    #[test]
    fn random_port_flag_is_tri_state() {
        assert_eq!(random_port_flag(&json!({ "use_random_port": true })), Some(true));
        assert_eq!(random_port_flag(&json!({ "use_random_port": false })), Some(false));
        assert_eq!(random_port_flag(&json!({})), None);
    }

    #[test]
    fn payload_disables_random_port() {
        assert_eq!(
            port_payload(51820),
            json!({ "listen_port": 51820, "use_random_port": false })
        );
    }

    #[test]
    fn state_combines_sources() {
        let prefs = json!({ "listen_port": 48392, "use_random_port": true });
        let runtime = json!({ "server_state": { "listen_port": 48000 } });
        let state = client_port_state(&prefs, Some(&runtime));
        assert_eq!(state.configured_port, Some(48392));
        assert_eq!(state.runtime_port, Some(48000));
        assert_eq!(state.random_port, Some(true));
    }

    #[test]
    fn session_token_is_redacted() {
        let token = SessionToken("secret-sid".to_string());
        assert!(!format!("{token:?}").contains("secret-sid"));
        assert_eq!(token.cookie(), "SID=secret-sid");
    }
}
