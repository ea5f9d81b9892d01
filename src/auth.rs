//! Identity verification
//!
//! Two authenticators share one contract: given the configured restriction
//! list and the session's OAuth2 grant, produce an [`Identity`] or refuse.
//!
//! - [`DomainAuth`] reads the email claim out of the provider's id_token and
//!   matches it against exact addresses or `@domain` suffixes.
//! - [`OrgAuth`] asks the provider API which organizations the token's owner
//!   belongs to. Any failure talking to the API is a denial.

use crate::config::{Conf, Service};
use crate::oauth::Tokens;
use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Password sent with the access token when calling the organization API
pub const ORG_API_PASSWORD: &str = "x-oauth-basic";

/// Authenticated principal, attached to the request extensions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub email: Option<String>,
    /// Organization that granted access, for organization-restricted gates
    pub organization: Option<String>,
}

impl Identity {
    pub fn from_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            organization: None,
        }
    }

    pub fn from_organization(organization: impl Into<String>) -> Self {
        Self {
            email: None,
            organization: Some(organization.into()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.email, &self.organization) {
            (Some(email), _) => f.write_str(email),
            (None, Some(org)) => write!(f, "member of {}", org),
            (None, None) => f.write_str("authenticated user"),
        }
    }
}

/// Broad class of an [`AuthError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Token material missing or malformed
    Extraction,
    /// Valid identity that the restriction list doesn't admit
    Decision,
    /// Provider API unreachable or answered nonsense
    Upstream,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("id_token not found")]
    MissingIdToken,

    #[error("invalid id_token")]
    MalformedIdToken,

    #[error("failed to decode base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to decode json: {0}")]
    Claims(serde_json::Error),

    #[error("email not found")]
    MissingEmail,

    #[error("email doesn't allow: {0}")]
    EmailNotAllowed(String),

    #[error("not a member of designated organizations")]
    NotAMember,

    #[error("failed to retrieve organizations: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("organization API answered with status {0}")]
    UpstreamStatus(u16),

    #[error("failed to decode organizations: {0}")]
    OrganizationsBody(serde_json::Error),
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::MissingIdToken
            | AuthError::MalformedIdToken
            | AuthError::Base64(_)
            | AuthError::Claims(_)
            | AuthError::MissingEmail => AuthErrorKind::Extraction,
            AuthError::EmailNotAllowed(_) | AuthError::NotAMember => AuthErrorKind::Decision,
            AuthError::Upstream(_)
            | AuthError::UpstreamStatus(_)
            | AuthError::OrganizationsBody(_) => AuthErrorKind::Upstream,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify the grant against `restrictions`. An empty list admits any
    /// identity the variant can establish.
    async fn authenticate(&self, restrictions: &[String], tokens: &Tokens) -> Result<Identity, AuthError>;
}

/// Build the authenticator for the configured service
pub fn from_config(conf: &Conf) -> anyhow::Result<Arc<dyn Authenticator>> {
    let authenticator: Arc<dyn Authenticator> = match conf.service()? {
        Service::Google => Arc::new(DomainAuth),
        Service::GitHub => Arc::new(OrgAuth::new(&conf.auth.info.api_endpoint, conf.api_timeout())?),
    };
    Ok(authenticator)
}

/// Restore the padding stripped from a base64url segment
pub fn pad_base64url(segment: &str) -> String {
    let mut padded = segment.to_string();
    match segment.len() % 4 {
        2 => padded.push_str("=="),
        3 => padded.push('='),
        _ => {}
    }
    padded
}

/// base64url that tolerates non-zero bits after the last full byte, as
/// some issuers emit them
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Decode an unpadded base64url segment
pub fn base64_decode(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_LENIENT.decode(pad_base64url(segment))
}

/// Pull the email claim out of the grant's id_token
pub fn extract_email(tokens: &Tokens) -> Result<String, AuthError> {
    let id_token = tokens.extra("id_token").ok_or(AuthError::MissingIdToken)?;

    let segments: Vec<&str> = id_token.split('.').collect();
    if segments.len() < 2 {
        return Err(AuthError::MalformedIdToken);
    }

    let payload = base64_decode(segments[1])?;
    let claims: Map<String, Value> = serde_json::from_slice(&payload).map_err(AuthError::Claims)?;

    claims
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(AuthError::MissingEmail)
}

/// Case-sensitive match of `email` against exact addresses (entries holding
/// an `@`) and bare domains
pub fn email_allowed(restrictions: &[String], email: &str) -> bool {
    if restrictions.is_empty() {
        return true;
    }

    restrictions.iter().any(|restriction| {
        if restriction.contains('@') {
            restriction == email
        } else {
            email
                .strip_suffix(restriction.as_str())
                .is_some_and(|local| local.ends_with('@'))
        }
    })
}

/// Email/domain restricted authenticator backed by the id_token
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainAuth;

#[async_trait]
impl Authenticator for DomainAuth {
    async fn authenticate(&self, restrictions: &[String], tokens: &Tokens) -> Result<Identity, AuthError> {
        let email = extract_email(tokens)?;
        if !email_allowed(restrictions, &email) {
            return Err(AuthError::EmailNotAllowed(email));
        }

        debug!("user {} logged in", email);
        Ok(Identity::from_email(email))
    }
}

/// Organization-membership restricted authenticator
#[derive(Debug, Clone)]
pub struct OrgAuth {
    client: Client,
    api_endpoint: String,
}

impl OrgAuth {
    pub fn new(api_endpoint: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Logins of the organizations the token's owner belongs to
    pub async fn organizations(&self, access_token: &str) -> Result<Vec<String>, AuthError> {
        let response = self
            .client
            .get(format!("{}/user/orgs", self.api_endpoint))
            .basic_auth(access_token, Some(ORG_API_PASSWORD))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::UpstreamStatus(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        let entries: Vec<Map<String, Value>> =
            serde_json::from_slice(&body).map_err(AuthError::OrganizationsBody)?;

        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("login").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Authenticator for OrgAuth {
    async fn authenticate(&self, restrictions: &[String], tokens: &Tokens) -> Result<Identity, AuthError> {
        if restrictions.is_empty() {
            return Ok(Identity::default());
        }

        let organizations = self.organizations(&tokens.access).await?;
        organizations
            .into_iter()
            .find(|org| restrictions.contains(org))
            .map(Identity::from_organization)
            .ok_or(AuthError::NotAMember)
    }
}
