//! Gateway configuration
//! Loads the YAML config file and validates it before anything is bound

use crate::registry::{host_key, normalize_prefix};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const GITHUB_ENDPOINT: &str = "https://github.com";
const GITHUB_API_ENDPOINT: &str = "https://api.github.com";

/// Startup configuration errors. Any of these aborts boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0} config is required")]
    Missing(&'static str),

    #[error("unsupported authentication service: {0}")]
    UnsupportedService(String),

    #[error("invalid proxy destination {dest:?}: {reason}")]
    InvalidDestination { dest: String, reason: String },

    #[error("invalid provider endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("duplicate proxy rule for path {path:?} and host {host:?}")]
    DuplicateRule { path: String, host: String },
}

/// Identity provider backing the login flow and the authenticator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Google,
    GitHub,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conf {
    #[serde(default, rename = "address")]
    pub addr: String,
    #[serde(default)]
    pub ssl: SslConf,
    #[serde(default)]
    pub auth: AuthConf,
    #[serde(default)]
    pub restrictions: Vec<String>,
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConf>,
    #[serde(default)]
    pub htdocs: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConf {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConf {
    #[serde(default)]
    pub session: SessionConf,
    #[serde(default)]
    pub info: AuthInfoConf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConf {
    #[serde(default)]
    pub cookie_domain: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfoConf {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_endpoint: String,
    /// Seconds allowed for calls to the provider API
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
}

/// One `proxy:` entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConf {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub dest: String,
    #[serde(default, rename = "strip_path", deserialize_with = "yaml_bool")]
    pub strip: bool,
}

fn default_api_timeout() -> u64 {
    10
}

/// Accepts YAML 1.1 style booleans (`yes`, `no`, `on`, `off`) next to
/// plain `true`/`false`.
fn yaml_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.to_ascii_lowercase().as_str() {
            "yes" | "y" | "on" | "true" => Ok(true),
            "no" | "n" | "off" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean value: {}",
                other
            ))),
        },
    }
}

impl Conf {
    /// Read, parse and validate the config file at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut conf: Conf = serde_yaml::from_str(data)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check required keys, fill defaults and reject bad proxy rules
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::Missing("address"));
        }

        let info = &self.auth.info;
        if info.service.is_empty() {
            return Err(ConfigError::Missing("auth.info.service"));
        }
        if info.client_id.is_empty() {
            return Err(ConfigError::Missing("auth.info.client_id"));
        }
        if info.client_secret.is_empty() {
            return Err(ConfigError::Missing("auth.info.client_secret"));
        }
        if info.redirect_url.is_empty() {
            return Err(ConfigError::Missing("auth.info.redirect_url"));
        }

        if self.service()? == Service::GitHub {
            let info = &mut self.auth.info;
            if info.endpoint.is_empty() {
                info.endpoint = GITHUB_ENDPOINT.to_string();
            }
            if info.api_endpoint.is_empty() {
                info.api_endpoint = GITHUB_API_ENDPOINT.to_string();
            }
        }

        if self.htdocs.is_empty() {
            self.htdocs = ".".to_string();
        }

        let mut seen = HashSet::new();
        for proxy in &self.proxies {
            proxy.destination()?;

            let key = (normalize_prefix(&proxy.path), host_key(&proxy.host));
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateRule {
                    path: proxy.path.clone(),
                    host: proxy.host.clone(),
                });
            }
        }

        Ok(())
    }

    /// The configured identity provider
    pub fn service(&self) -> Result<Service, ConfigError> {
        match self.auth.info.service.as_str() {
            "google" => Ok(Service::Google),
            "github" => Ok(Service::GitHub),
            other => Err(ConfigError::UnsupportedService(other.to_string())),
        }
    }

    /// Whether the listener should terminate TLS
    pub fn tls_enabled(&self) -> bool {
        !self.ssl.cert.is_empty() && !self.ssl.key.is_empty()
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.info.api_timeout)
    }
}

impl ProxyConf {
    /// Parse `dest` into an absolute http(s) URL
    pub fn destination(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDestination {
            dest: self.dest.clone(),
            reason,
        };

        let url = Url::parse(&self.dest).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const AUTH: &str = r#"
auth:
  info:
    service: google
    client_id: dummy
    client_secret: dummy
    redirect_url: "http://example.com/oauth2callback"
"#;

    #[test]
    fn test_parse_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"---
address: ":9999"

htdocs: ./
{}
proxy:
  - path: /foo
    dest: http://example.com/bar
    strip_path: yes
"#,
            AUTH
        )
        .unwrap();

        let conf = Conf::parse(file.path()).unwrap();
        assert_eq!(conf.addr, ":9999");
        assert_eq!(conf.htdocs, "./");
        assert_eq!(conf.proxies.len(), 1);
        assert!(conf.proxies[0].strip);
        assert_eq!(conf.proxies[0].host, "");
        assert_eq!(conf.service().unwrap(), Service::Google);
    }

    #[test]
    fn test_missing_file() {
        let err = Conf::parse("/nonexistent/authgate.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_required_keys() {
        let err = Conf::from_yaml(AUTH).unwrap_err();
        assert_eq!(err.to_string(), "address config is required");

        let err = Conf::from_yaml("address: \":80\"\nauth:\n  info:\n    service: google\n").unwrap_err();
        assert_eq!(err.to_string(), "auth.info.client_id config is required");
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
address: ":80"
auth:
  session:
    key: legacy-and-ignored
  info:
    service: github
    client_id: id
    client_secret: secret
    redirect_url: "http://example.com/oauth2callback"
restrictions:
  - my-org
"#;
        let conf = Conf::from_yaml(yaml).unwrap();
        assert_eq!(conf.htdocs, ".");
        assert_eq!(conf.auth.info.endpoint, "https://github.com");
        assert_eq!(conf.auth.info.api_endpoint, "https://api.github.com");
        assert_eq!(conf.api_timeout(), Duration::from_secs(10));
        assert_eq!(conf.restrictions, vec!["my-org"]);
        assert!(!conf.tls_enabled());
    }

    #[test]
    fn test_unsupported_service() {
        let yaml = AUTH.replace("google", "nothing");
        let err = Conf::from_yaml(&format!("address: \":80\"\n{}", yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedService(s) if s == "nothing"));
    }

    #[test]
    fn test_invalid_destination() {
        let yaml = format!(
            "address: \":80\"\n{}\nproxy:\n  - path: /a\n    dest: \"not a url\"\n",
            AUTH
        );
        assert!(matches!(
            Conf::from_yaml(&yaml).unwrap_err(),
            ConfigError::InvalidDestination { .. }
        ));

        let yaml = format!(
            "address: \":80\"\n{}\nproxy:\n  - path: /a\n    dest: \"ftp://example.com\"\n",
            AUTH
        );
        assert!(matches!(
            Conf::from_yaml(&yaml).unwrap_err(),
            ConfigError::InvalidDestination { .. }
        ));
    }

    #[test]
    fn test_duplicate_path_and_host_rejected() {
        let yaml = format!(
            r#"address: ":80"
{}
proxy:
  - path: /a
    host: h1
    dest: http://127.0.0.1:1
  - path: /a/
    host: h1
    dest: http://127.0.0.1:2
"#,
            AUTH
        );
        let err = Conf::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRule { .. }));

        // A port in the rule host doesn't make it a different virtual host
        let with_port = yaml.replacen("host: h1\n", "host: H1:8080\n", 1);
        assert!(matches!(
            Conf::from_yaml(&with_port).unwrap_err(),
            ConfigError::DuplicateRule { .. }
        ));

        // Same path on different hosts is the virtual host case and is fine
        let yaml = yaml.replacen("host: h1", "host: h2", 1);
        assert_eq!(Conf::from_yaml(&yaml).unwrap().proxies.len(), 2);
    }

    #[test]
    fn test_strip_path_flag_spellings() {
        for (raw, expected) in [("yes", true), ("no", false), ("true", true), ("off", false)] {
            let yaml = format!(
                "address: \":80\"\n{}\nproxy:\n  - path: /a\n    dest: http://x\n    strip_path: {}\n",
                AUTH, raw
            );
            assert_eq!(Conf::from_yaml(&yaml).unwrap().proxies[0].strip, expected, "{}", raw);
        }
    }
}
