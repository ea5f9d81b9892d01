//! Backend connections
//! Dials the backend a route points at, over TLS for https destinations

use crate::certificate::client_connector;
use crate::registry::Route;
use hyper::HeaderMap;
use rustls::pki_types::ServerName;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Time allowed for the TCP (and TLS) handshake with a backend
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only apply to a single connection and are never forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// A byte stream to a backend, plain or TLS
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

pub type BackendStream = Box<dyn BackendIo>;

/// Opens connections to backends
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            tls: client_connector(),
            connect_timeout,
        }
    }

    /// Dial the backend for `route`
    pub async fn connect(&self, route: &Route) -> io::Result<BackendStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(route.authority.as_str()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out"))??;
        stream.set_nodelay(true)?;

        if !route.tls {
            debug!("Connected to backend {}", route.authority);
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(route.server_name.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .to_owned();
        let stream = timeout(self.connect_timeout, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend TLS handshake timed out"))??;

        debug!("Connected to backend {} over TLS", route.authority);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use tokio::net::TcpListener;

    fn route(authority: String) -> Route {
        Route {
            authority,
            server_name: "127.0.0.1".to_string(),
            tls: false,
            path_and_query: "/".to_string(),
            vhost: String::new(),
        }
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Custom"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = Connector::default();
        assert!(connector.connect(&route(addr.to_string())).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Connector::default();
        assert!(connector.connect(&route(addr.to_string())).await.is_err());
    }
}
