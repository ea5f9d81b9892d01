//! OAuth2 login flow
//!
//! The gate only needs three things from the login machinery: the grant held
//! by the current session, a redirect that starts a login, and someone to
//! answer the flow's own endpoints. [`LoginFlow`] is that seam;
//! [`OAuthFlow`] implements it with the authorization-code grant and an
//! in-memory session store.

use crate::config::{ConfigError, Conf, Service};
use crate::response::{ProxyBody, redirect_response, text_response};
use crate::session::{SessionStore, session_cookie, session_id};
use async_trait::async_trait;
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::{HeaderMap, Response, StatusCode, Uri};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use url::form_urlencoded;

pub const LOGIN_PATH: &str = "/login";
pub const LOGOUT_PATH: &str = "/logout";
pub const DEFAULT_CALLBACK_PATH: &str = "/oauth2callback";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";

/// An OAuth2 grant as returned by the provider's token endpoint
#[derive(Debug, Clone, Default)]
pub struct Tokens {
    pub access: String,
    pub refresh: Option<String>,
    pub expiry: Option<Instant>,
    /// Every other string field of the token response, e.g. `id_token`
    pub extra: HashMap<String, String>,
}

impl Tokens {
    pub fn new(access: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| Instant::now() >= expiry)
    }

    /// A grant the gate accepts as "logged in"
    pub fn is_valid(&self) -> bool {
        !self.access.is_empty() && !self.expired()
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("no login in progress for this session")]
    NoSession,

    #[error("state mismatch")]
    StateMismatch,

    #[error("authorization code missing")]
    MissingCode,

    #[error("provider refused the login: {0}")]
    Provider(String),

    #[error("token exchange failed: {0}")]
    Exchange(#[from] reqwest::Error),

    #[error("token endpoint answered with status {0}")]
    ExchangeStatus(u16),

    #[error("failed to decode token response: {0}")]
    TokenBody(serde_json::Error),

    #[error("token response has no access_token")]
    MissingAccessToken,
}

impl OAuthError {
    fn status(&self) -> StatusCode {
        match self {
            OAuthError::Exchange(_) | OAuthError::ExchangeStatus(_) | OAuthError::TokenBody(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// What the gate needs from the login machinery
#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Answer the flow's own endpoints; `None` for every other request
    async fn handle(&self, uri: &Uri, headers: &HeaderMap) -> Option<Response<ProxyBody>>;

    /// The session's grant, when it holds a valid one
    fn tokens(&self, headers: &HeaderMap) -> Option<Tokens>;

    /// Response that sends the user through login and back to `uri`
    fn login_redirect(&self, uri: &Uri) -> Response<ProxyBody>;
}

/// Endpoints and client credentials of the identity provider
#[derive(Debug, Clone)]
pub struct Provider {
    pub auth_url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

impl Provider {
    pub fn from_config(conf: &Conf) -> Result<Self, ConfigError> {
        let info = &conf.auth.info;
        let (auth_url, token_url, scopes) = match conf.service()? {
            Service::Google => (
                GOOGLE_AUTH_URL.to_string(),
                GOOGLE_TOKEN_URL.to_string(),
                vec!["openid", "email"],
            ),
            Service::GitHub => {
                let endpoint = info.endpoint.trim_end_matches('/');
                (
                    format!("{}/login/oauth/authorize", endpoint),
                    format!("{}/login/oauth/access_token", endpoint),
                    vec!["read:org"],
                )
            }
        };

        let parse = |url: String| {
            Url::parse(&url).map_err(|e| ConfigError::InvalidEndpoint {
                url: url.clone(),
                reason: e.to_string(),
            })
        };

        Ok(Self {
            auth_url: parse(auth_url)?,
            token_url: parse(token_url)?,
            client_id: info.client_id.clone(),
            client_secret: info.client_secret.clone(),
            redirect_url: info.redirect_url.clone(),
            scopes: scopes.into_iter().map(str::to_string).collect(),
        })
    }

    /// Provider URL that starts the authorization-code grant
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "online");
        url.to_string()
    }

    /// Path of `redirect_url` the provider sends the user back to
    pub fn callback_path(&self) -> String {
        Url::parse(&self.redirect_url)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| DEFAULT_CALLBACK_PATH.to_string())
    }
}

/// Turn a token endpoint response into a grant
pub fn parse_token_response(body: &[u8]) -> Result<Tokens, OAuthError> {
    let fields: Map<String, Value> = serde_json::from_slice(body).map_err(OAuthError::TokenBody)?;

    if let Some(error) = fields.get("error").and_then(Value::as_str) {
        return Err(OAuthError::Provider(error.to_string()));
    }

    let access = fields
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|access| !access.is_empty())
        .ok_or(OAuthError::MissingAccessToken)?;

    let mut tokens = Tokens::new(access);
    tokens.refresh = fields
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    tokens.expiry = fields
        .get("expires_in")
        .and_then(Value::as_u64)
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    for (key, value) in fields {
        if key == "access_token" || key == "refresh_token" {
            continue;
        }
        if let Value::String(value) = value {
            tokens.extra.insert(key, value);
        }
    }
    Ok(tokens)
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Only same-site paths are followed after login
fn local_target(next: Option<String>) -> String {
    match next {
        Some(next) if next.starts_with('/') && !next.starts_with("//") && !next.starts_with("/\\") => next,
        _ => "/".to_string(),
    }
}

/// Authorization-code login backed by [`SessionStore`]
pub struct OAuthFlow {
    provider: Provider,
    client: Client,
    sessions: SessionStore,
    callback_path: String,
    cookie_domain: String,
    secure_cookie: bool,
}

impl OAuthFlow {
    pub fn new(provider: Provider, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            callback_path: provider.callback_path(),
            provider,
            client,
            sessions: SessionStore::default(),
            cookie_domain: String::new(),
            secure_cookie: false,
        })
    }

    pub fn from_config(conf: &Conf) -> anyhow::Result<Self> {
        let provider = Provider::from_config(conf)?;
        let mut flow = Self::new(provider, conf.api_timeout())?;
        flow.cookie_domain = conf.auth.session.cookie_domain.clone();
        flow.secure_cookie = conf.tls_enabled();
        Ok(flow)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn callback_path(&self) -> &str {
        &self.callback_path
    }

    /// Exchange an authorization code for a grant
    pub async fn exchange(&self, code: &str) -> Result<Tokens, OAuthError> {
        let response = self
            .client
            .post(self.provider.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.provider.redirect_url.as_str()),
                ("client_id", self.provider.client_id.as_str()),
                ("client_secret", self.provider.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OAuthError::ExchangeStatus(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        parse_token_response(&body)
    }

    fn login(&self, uri: &Uri, headers: &HeaderMap) -> Response<ProxyBody> {
        let next = local_target(query_param(uri, "next"));

        let (id, fresh) = match session_id(headers).filter(|id| self.sessions.contains(id)) {
            Some(id) => (id, false),
            None => (self.sessions.create(), true),
        };

        let Some(state) = self.sessions.begin_login(&id, &next) else {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Session unavailable");
        };

        let mut response = redirect_response(&self.provider.authorize_url(&state));
        if fresh {
            let cookie = session_cookie(&id, &self.cookie_domain, self.secure_cookie);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(SET_COOKIE, value);
            }
        }
        response
    }

    async fn callback(&self, uri: &Uri, headers: &HeaderMap) -> Result<Response<ProxyBody>, OAuthError> {
        let id = session_id(headers)
            .filter(|id| self.sessions.contains(id))
            .ok_or(OAuthError::NoSession)?;

        let state = query_param(uri, "state").unwrap_or_default();
        let next = self
            .sessions
            .finish_login(&id, &state)
            .ok_or(OAuthError::StateMismatch)?;

        if let Some(error) = query_param(uri, "error") {
            return Err(OAuthError::Provider(error));
        }
        let code = query_param(uri, "code").ok_or(OAuthError::MissingCode)?;

        let tokens = self.exchange(&code).await?;
        self.sessions.set_tokens(&id, tokens);

        info!("login completed, continuing to {}", next);
        Ok(redirect_response(&next))
    }

    fn logout(&self, headers: &HeaderMap) -> Response<ProxyBody> {
        if let Some(id) = session_id(headers) {
            self.sessions.clear_tokens(&id);
            info!("session logged out");
        }
        redirect_response("/")
    }
}

#[async_trait]
impl LoginFlow for OAuthFlow {
    async fn handle(&self, uri: &Uri, headers: &HeaderMap) -> Option<Response<ProxyBody>> {
        let path = uri.path();
        if path == LOGIN_PATH {
            Some(self.login(uri, headers))
        } else if path == LOGOUT_PATH {
            Some(self.logout(headers))
        } else if path == self.callback_path {
            Some(match self.callback(uri, headers).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("OAuth2 callback failed: {}", e);
                    text_response(e.status(), "OAuth2 login failed")
                }
            })
        } else {
            None
        }
    }

    fn tokens(&self, headers: &HeaderMap) -> Option<Tokens> {
        let id = session_id(headers)?;
        self.sessions.tokens(&id).filter(Tokens::is_valid)
    }

    fn login_redirect(&self, uri: &Uri) -> Response<ProxyBody> {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let next: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        redirect_response(&format!("{}?next={}", LOGIN_PATH, next))
    }
}
