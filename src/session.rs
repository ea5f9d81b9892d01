//! In-memory login sessions keyed by a random cookie

use crate::oauth::Tokens;
use dashmap::DashMap;
use hyper::HeaderMap;
use hyper::header::COOKIE;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "authgate_session";

/// Sessions older than this are dropped
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of a session that never completed a login
pub const PENDING_LOGIN_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct PendingLogin {
    state: String,
    next: String,
}

#[derive(Debug)]
struct Session {
    created: Instant,
    tokens: Option<Tokens>,
    pending: Option<PendingLogin>,
}

impl Session {
    /// Sessions holding a grant live for `ttl`, the rest for `pending_ttl`
    fn live(&self, ttl: Duration, pending_ttl: Duration) -> bool {
        let limit = if self.tokens.is_some() { ttl } else { pending_ttl.min(ttl) };
        self.created.elapsed() < limit
    }
}

/// Concurrent session map shared by every connection
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
    pending_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            pending_ttl: PENDING_LOGIN_TTL,
        }
    }

    /// Override how long a session without a grant survives
    pub fn with_pending_ttl(mut self, pending_ttl: Duration) -> Self {
        self.pending_ttl = pending_ttl;
        self
    }

    /// Start a new, empty session and return its id
    pub fn create(&self) -> String {
        self.purge_expired();

        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                created: Instant::now(),
                tokens: None,
                pending: None,
            },
        );
        id
    }

    /// Whether `id` names a live session
    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.live(self.ttl, self.pending_ttl))
            .unwrap_or(false)
    }

    /// The grant stored for `id`, if the session is still live
    pub fn tokens(&self, id: &str) -> Option<Tokens> {
        let session = self.sessions.get(id)?;
        if session.created.elapsed() >= self.ttl {
            return None;
        }
        session.tokens.clone()
    }

    pub fn set_tokens(&self, id: &str, tokens: Tokens) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.tokens = Some(tokens);
                true
            }
            None => false,
        }
    }

    pub fn clear_tokens(&self, id: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.tokens = None;
        }
    }

    /// Record a login in progress and return the `state` to send to the
    /// provider
    pub fn begin_login(&self, id: &str, next: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(id)?;
        let state = Uuid::new_v4().simple().to_string();
        session.pending = Some(PendingLogin {
            state: state.clone(),
            next: next.to_string(),
        });
        Some(state)
    }

    /// Complete the pending login if `state` matches, returning where to
    /// send the user. The pending login is consumed either way.
    pub fn finish_login(&self, id: &str, state: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(id)?;
        let pending = session.pending.take()?;
        if !session.live(self.ttl, self.pending_ttl) {
            return None;
        }
        (pending.state == state).then_some(pending.next)
    }

    /// Drop sessions past their lifetime. Anonymous visits to the login
    /// endpoint only hold a pending login and go after `pending_ttl`.
    fn purge_expired(&self) {
        let (ttl, pending_ttl) = (self.ttl, self.pending_ttl);
        self.sessions.retain(|_, session| session.live(ttl, pending_ttl));
    }
}

/// Session id carried in the request's cookies
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value for a session id
pub fn session_cookie(id: &str, domain: &str, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, id);
    if !domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_session_lifecycle() {
        let store = SessionStore::default();
        let id = store.create();
        assert!(store.contains(&id));
        assert!(store.tokens(&id).is_none());

        assert!(store.set_tokens(&id, Tokens::new("abc")));
        assert_eq!(store.tokens(&id).unwrap().access, "abc");

        store.clear_tokens(&id);
        assert!(store.tokens(&id).is_none());

        assert!(!store.set_tokens("unknown", Tokens::new("abc")));
    }

    #[test]
    fn test_login_state() {
        let store = SessionStore::default();
        let id = store.create();

        let state = store.begin_login(&id, "/foo/").unwrap();
        assert_eq!(store.finish_login(&id, "wrong"), None);
        // consumed by the failed attempt
        assert_eq!(store.finish_login(&id, &state), None);

        let state = store.begin_login(&id, "/foo/").unwrap();
        assert_eq!(store.finish_login(&id, &state).as_deref(), Some("/foo/"));
    }

    #[test]
    fn test_expired_sessions() {
        let store = SessionStore::new(Duration::ZERO);
        let id = store.create();
        assert!(!store.contains(&id));
        store.set_tokens(&id, Tokens::new("abc"));
        assert!(store.tokens(&id).is_none());

        // creating another session purges the stale one
        let other = store.create();
        assert!(store.sessions.get(&id).is_none());
        assert!(store.sessions.get(&other).is_some());
    }

    #[test]
    fn test_stale_pending_logins_dropped() {
        let store = SessionStore::default().with_pending_ttl(Duration::ZERO);

        let anonymous = store.create();
        assert!(store.begin_login(&anonymous, "/foo/").is_some());
        assert!(!store.contains(&anonymous));

        let logged_in = store.create();
        assert!(store.set_tokens(&logged_in, Tokens::new("abc")));

        store.create();
        assert!(store.sessions.get(&anonymous).is_none());
        assert!(store.contains(&logged_in));
        assert_eq!(store.tokens(&logged_in).unwrap().access, "abc");
    }

    #[test]
    fn test_stale_pending_login_cannot_finish() {
        let store = SessionStore::default().with_pending_ttl(Duration::ZERO);
        let id = store.create();
        let state = store.begin_login(&id, "/foo/").unwrap();
        assert_eq!(store.finish_login(&id, &state), None);
    }

    #[test]
    fn test_session_id_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; authgate_session=1234; other=x"),
        );
        assert_eq!(session_id(&headers).as_deref(), Some("1234"));

        assert_eq!(session_id(&HeaderMap::new()), None);
    }

    #[test]
    fn test_session_cookie() {
        assert_eq!(
            session_cookie("id", "", false),
            "authgate_session=id; Path=/; HttpOnly; SameSite=Lax"
        );
        assert_eq!(
            session_cookie("id", "example.com", true),
            "authgate_session=id; Path=/; HttpOnly; SameSite=Lax; Domain=example.com; Secure"
        );
    }
}
