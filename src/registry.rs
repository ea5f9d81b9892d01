//! Backend registry and request director
//!
//! Proxy rules are grouped by their normalized path prefix. Each group holds
//! one backend per virtual host plus a default, and the director picks the
//! backend for a request and computes where and how it is forwarded.

use crate::config::{ConfigError, ProxyConf};
use hyper::Uri;
use std::collections::HashMap;
use tracing::{info, warn};
use url::Url;

/// Normalize a configured path into the prefix the group is matched and
/// stripped by: leading and trailing `/`, any `**` suffix dropped.
pub fn normalize_prefix(path: &str) -> String {
    let mut prefix = path.trim_end_matches("**").to_string();
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Lower-cased host without port, used as the virtual host key
pub fn host_key(host: &str) -> String {
    let host = if host.starts_with('[') {
        // [v6]:port
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    host.to_ascii_lowercase()
}

/// Remove `prefix` from `path`; a path that doesn't carry the prefix is
/// returned unchanged. The result always starts with `/`.
pub fn strip_path(path: &str, prefix: &str) -> String {
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{}", rest),
        None => path.to_string(),
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Resolved runtime form of one proxy rule
#[derive(Debug, Clone)]
pub struct Backend {
    /// Virtual host this backend answers for, empty for the wildcard
    pub host: String,
    pub dest: Url,
    pub strip: bool,
    pub strip_prefix: String,
    authority: String,
    server_name: String,
}

/// Where and how a single request is forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `host:port` to dial
    pub authority: String,
    /// Host name for TLS server name indication
    pub server_name: String,
    pub tls: bool,
    /// Rewritten origin-form request target
    pub path_and_query: String,
    /// Virtual host of the backend that was picked, empty for the wildcard
    pub vhost: String,
}

impl Backend {
    pub fn new(rule: &ProxyConf) -> Result<Self, ConfigError> {
        let dest = rule.destination()?;
        let host = dest.host_str().unwrap_or("localhost").to_string();
        let port = dest.port_or_known_default().unwrap_or(80);

        Ok(Self {
            host: host_key(&rule.host),
            authority: format!("{}:{}", host, port),
            server_name: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            strip: rule.strip,
            strip_prefix: normalize_prefix(&rule.path),
            dest,
        })
    }

    /// Rewrite the request target for this backend
    pub fn rewrite(&self, uri: &Uri) -> Route {
        let path = if self.strip {
            strip_path(uri.path(), &self.strip_prefix)
        } else {
            uri.path().to_string()
        };
        let path = join_paths(self.dest.path(), &path);

        let dest_query = self.dest.query().filter(|q| !q.is_empty());
        let path_and_query = match (dest_query, uri.query()) {
            (Some(a), Some(b)) => format!("{}?{}&{}", path, a, b),
            (Some(q), None) | (None, Some(q)) => format!("{}?{}", path, q),
            (None, None) => path,
        };

        Route {
            authority: self.authority.clone(),
            server_name: self.server_name.clone(),
            tls: self.dest.scheme() == "https",
            path_and_query,
            vhost: self.host.clone(),
        }
    }
}

/// All backends registered under one path prefix
#[derive(Debug)]
pub struct PathGroup {
    prefix: String,
    backends: Vec<Backend>,
    by_host: HashMap<String, usize>,
    default: usize,
}

impl PathGroup {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            backends: Vec::new(),
            by_host: HashMap::new(),
            default: 0,
        }
    }

    /// Registration pattern, e.g. `/foo/**`
    pub fn pattern(&self) -> String {
        format!("{}**", self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    fn insert(&mut self, backend: Backend) {
        let key = backend.host.clone();
        let idx = match self.by_host.get(&key) {
            Some(&idx) => {
                // Same (path, host) twice: the later rule replaces the earlier
                warn!(
                    "proxy rule for path:{} host:{} overrides an earlier rule",
                    self.prefix, key
                );
                self.backends[idx] = backend;
                idx
            }
            None => {
                self.backends.push(backend);
                let idx = self.backends.len() - 1;
                self.by_host.insert(key.clone(), idx);
                idx
            }
        };

        if key.is_empty() {
            self.default = idx;
        }
    }

    /// Backend for `host`, falling back to the group default
    pub fn select(&self, host: &str) -> &Backend {
        let idx = self
            .by_host
            .get(&host_key(host))
            .copied()
            .unwrap_or(self.default);
        &self.backends[idx]
    }
}

/// Read-only routing table built once at startup
#[derive(Debug, Default)]
pub struct BackendRegistry {
    groups: Vec<PathGroup>,
}

impl BackendRegistry {
    /// Build path groups from the configured rules
    pub fn from_rules(rules: &[ProxyConf]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();

        for rule in rules {
            let backend = Backend::new(rule)?;
            let prefix = backend.strip_prefix.clone();

            info!(
                "register proxy path:{} host:{} dest:{} strip:{}",
                prefix,
                if backend.host.is_empty() { "*" } else { backend.host.as_str() },
                backend.dest,
                backend.strip
            );

            match registry.groups.iter_mut().find(|g| g.prefix == prefix) {
                Some(group) => group.insert(backend),
                None => {
                    let mut group = PathGroup::new(prefix);
                    group.insert(backend);
                    registry.groups.push(group);
                }
            }
        }

        Ok(registry)
    }

    pub fn groups(&self) -> &[PathGroup] {
        &self.groups
    }

    /// Group whose prefix matches `path`, longest prefix first
    pub fn find(&self, path: &str) -> Option<&PathGroup> {
        self.groups
            .iter()
            .filter(|g| path.starts_with(&g.prefix))
            .max_by_key(|g| g.prefix.len())
    }

    /// Pick the backend for a request and compute its route. `None` when no
    /// group matches the path.
    pub fn direct(&self, host: Option<&str>, uri: &Uri) -> Option<Route> {
        let group = self.find(uri.path())?;
        let backend = group.select(host.unwrap_or(""));
        let route = backend.rewrite(uri);

        info!(
            "route {} host:{} -> {}{}",
            uri.path(),
            host.unwrap_or("-"),
            backend.dest.origin().ascii_serialization(),
            route.path_and_query
        );

        Some(route)
    }
}
