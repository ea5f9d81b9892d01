//! authgate - An authenticating reverse proxy
//!
//! Sits in front of backend HTTP services and:
//! - Requires an OAuth2 login (Google or GitHub) before anything is proxied
//! - Restricts access by email/domain or by organization membership
//! - Routes by path prefix and virtual host, optionally stripping the prefix
//! - Tunnels WebSocket upgrades straight to the backend
//! - Serves local documents for paths no proxy rule claims

pub mod auth;
pub mod certificate;
pub mod config;
pub mod gate;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod response;
pub mod session;
pub mod static_files;
pub mod tunnel;
pub mod upstream;

pub use auth::{AuthError, Authenticator, DomainAuth, Identity, OrgAuth};
pub use config::{Conf, ConfigError, ProxyConf};
pub use gate::{Gate, Verdict};
pub use oauth::{LoginFlow, OAuthFlow, Tokens};
pub use proxy::ProxyServer;
pub use registry::{Backend, BackendRegistry, Route};
pub use tunnel::Tunnel;
