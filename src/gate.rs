//! Authorization gate
//!
//! Every request that reaches the proxy stage passes [`Gate::check`] first:
//!
//! 1. WebSocket upgrade requests bound for a proxied backend skip both
//!    stages. Such requests never replay the interactive login, so a tunneled
//!    endpoint is only protected if its backend enforces access control
//!    itself, or if it is only ever reached from pages that were already
//!    served through the gate. Upgrade requests no proxy rule claims get no
//!    bypass.
//! 2. Require login: a session without a valid grant is redirected to the
//!    login flow and nothing else runs.
//! 3. Authenticate: the configured [`Authenticator`] checks the grant against
//!    the restriction list. An accepted [`Identity`] is attached to the
//!    request extensions for the proxy stage.

use crate::auth::{AuthError, Authenticator, Identity};
use crate::oauth::LoginFlow;
use crate::response::{ProxyBody, forbidden};
use crate::tunnel::is_websocket_upgrade;
use hyper::{Request, Response};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of the gate for one request
#[derive(Debug)]
pub enum Verdict {
    /// WebSocket upgrade, neither stage ran
    Bypass,
    /// Authenticated and admitted by the restriction list
    Allow(Identity),
    /// No valid grant; answer with the login redirect
    Redirect(Response<ProxyBody>),
    /// Authentication or authorization failed
    Deny(AuthError),
}

impl Verdict {
    /// The terminal response for a request that may not continue
    pub fn into_response(self) -> Option<Response<ProxyBody>> {
        match self {
            Verdict::Bypass | Verdict::Allow(_) => None,
            Verdict::Redirect(response) => Some(response),
            Verdict::Deny(_) => Some(forbidden()),
        }
    }
}

pub struct Gate {
    login: Arc<dyn LoginFlow>,
    authenticator: Arc<dyn Authenticator>,
    restrictions: Vec<String>,
}

impl Gate {
    pub fn new(login: Arc<dyn LoginFlow>, authenticator: Arc<dyn Authenticator>, restrictions: Vec<String>) -> Self {
        Self {
            login,
            authenticator,
            restrictions,
        }
    }

    /// Run the stages in order for `req`. `tunnel_bound` tells whether a
    /// proxy rule claims the request, so an upgrade would be tunneled.
    pub async fn check<B>(&self, req: &mut Request<B>, tunnel_bound: bool) -> Verdict
    where
        B: Send,
    {
        if tunnel_bound && is_websocket_upgrade(req.headers()) {
            debug!("websocket upgrade for {} bypasses the gate", req.uri().path());
            return Verdict::Bypass;
        }

        let Some(tokens) = self.login.tokens(req.headers()) else {
            debug!("no valid session for {}, redirecting to login", req.uri().path());
            return Verdict::Redirect(self.login.login_redirect(req.uri()));
        };

        match self.authenticator.authenticate(&self.restrictions, &tokens).await {
            Ok(identity) => {
                debug!("{} admitted to {}", identity, req.uri().path());
                req.extensions_mut().insert(identity.clone());
                Verdict::Allow(identity)
            }
            Err(e) => {
                warn!("access denied to {} ({:?}): {}", req.uri().path(), e.kind(), e);
                Verdict::Deny(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::Tokens;
    use crate::response::redirect_response;
    use async_trait::async_trait;
    use hyper::header::LOCATION;
    use hyper::{HeaderMap, StatusCode, Uri};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Logged in whenever the request carries `x-test-token`
    struct HeaderLogin;

    #[async_trait]
    impl LoginFlow for HeaderLogin {
        async fn handle(&self, _uri: &Uri, _headers: &HeaderMap) -> Option<Response<ProxyBody>> {
            None
        }

        fn tokens(&self, headers: &HeaderMap) -> Option<Tokens> {
            let token = headers.get("x-test-token")?.to_str().ok()?;
            Some(Tokens::new(token))
        }

        fn login_redirect(&self, _uri: &Uri) -> Response<ProxyBody> {
            redirect_response("/login")
        }
    }

    /// Admits the access token "good" and counts calls
    #[derive(Default)]
    struct CountingAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn authenticate(&self, _restrictions: &[String], tokens: &Tokens) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if tokens.access == "good" {
                Ok(Identity::from_email("alice@example.com"))
            } else {
                Err(AuthError::EmailNotAllowed("mallory@example.com".to_string()))
            }
        }
    }

    fn gate() -> (Gate, Arc<CountingAuth>) {
        let auth = Arc::new(CountingAuth::default());
        let gate = Gate::new(Arc::new(HeaderLogin), auth.clone(), vec!["example.com".to_string()]);
        (gate, auth)
    }

    fn request(token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/foo/");
        if let Some(token) = token {
            builder = builder.header("x-test-token", token);
        }
        builder.body(()).unwrap()
    }

    #[tokio::test]
    async fn test_allow_attaches_identity() {
        let (gate, auth) = gate();
        let mut req = request(Some("good"));

        let verdict = gate.check(&mut req, true).await;
        assert!(matches!(&verdict, Verdict::Allow(identity) if identity.email.as_deref() == Some("alice@example.com")));
        assert_eq!(
            req.extensions().get::<Identity>(),
            Some(&Identity::from_email("alice@example.com"))
        );
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_required_before_authenticate() {
        let (gate, auth) = gate();
        let mut req = request(None);

        let verdict = gate.check(&mut req, true).await;
        let response = verdict.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/login");
        // halted before the authenticator ran
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
        assert!(req.extensions().get::<Identity>().is_none());
    }

    #[tokio::test]
    async fn test_denied_is_forbidden() {
        let (gate, _) = gate();
        let mut req = request(Some("bad"));

        let verdict = gate.check(&mut req, true).await;
        assert!(matches!(verdict, Verdict::Deny(AuthError::EmailNotAllowed(_))));
        let response = verdict.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(req.extensions().get::<Identity>().is_none());
    }

    #[tokio::test]
    async fn test_unrouted_websocket_upgrade_needs_login() {
        let (gate, auth) = gate();
        let mut req = Request::builder()
            .uri("/secret.txt")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();

        let verdict = gate.check(&mut req, false).await;
        let response = verdict.into_response().unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);

        let mut req = Request::builder()
            .uri("/secret.txt")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("x-test-token", "bad")
            .body(())
            .unwrap();
        let verdict = gate.check(&mut req, false).await;
        assert!(matches!(verdict, Verdict::Deny(_)));
    }

    #[tokio::test]
    async fn test_websocket_upgrade_bypasses_both_stages() {
        let (gate, auth) = gate();
        let mut req = Request::builder()
            .uri("/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "WebSocket")
            .body(())
            .unwrap();

        let verdict = gate.check(&mut req, true).await;
        assert!(matches!(verdict, Verdict::Bypass));
        assert!(verdict.into_response().is_none());
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }
}
