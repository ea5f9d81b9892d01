//! WebSocket tunnel
//!
//! Upgrade requests are not proxied as request/response pairs. The client's
//! request is replayed on a fresh connection to the backend, the backend's
//! handshake answer is handed back to the client, and once hyper releases the
//! client connection the two sockets are spliced together until either side
//! stops.

use crate::registry::Route;
use crate::response::{ProxyBody, empty_body, text_response};
use crate::upstream::Connector;
use bytes::{Bytes, BytesMut};
use hyper::header::{CONNECTION, HOST, HeaderName, HeaderValue, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Upper bound on the backend's handshake response head
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// True when `Connection` mentions `upgrade` and `Upgrade` is `websocket`,
/// both compared case-insensitively
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection && upgrade
}

/// Serialize a request head the way it goes out on the wire
pub fn serialize_request(method: &Method, target: &str, headers: &HeaderMap, host: Option<&str>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1024);
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.push(b' ');
    if !target.starts_with('/') {
        buf.push(b'/');
    }
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(HOST) {
        if let Some(host) = host {
            buf.extend_from_slice(b"Host: ");
            buf.extend_from_slice(host.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }

    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Parse an HTTP/1.x response head (status line and headers, without the
/// terminating blank line)
pub fn parse_response_head(head: &[u8]) -> io::Result<(StatusCode, HeaderMap)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let text = std::str::from_utf8(head).map_err(|_| invalid("response head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.") {
        return Err(invalid("malformed status line"));
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid("malformed status code"))?;

    let mut headers = HeaderMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Ok((status, headers))
}

/// Read the backend's response head. Returns the parsed head and any bytes
/// that arrived after it.
async fn read_response_head<S>(stream: &mut S) -> io::Result<(StatusCode, HeaderMap, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            let (status, headers) = parse_response_head(&buf[..end])?;
            return Ok((status, headers, rest.freeze()));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed before answering the upgrade",
            ));
        }
    }
}

/// Which side of a tunnel stopped first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Client,
    Backend,
}

/// Copy bytes in both directions until either direction ends, then shut
/// down and drop both connections. The direction still running is cancelled.
pub async fn pipe<C, B>(client: C, backend: B) -> (Closed, io::Result<u64>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (closed, result) = tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut backend_write) => (Closed::Client, res),
        res = tokio::io::copy(&mut backend_read, &mut client_write) => (Closed::Backend, res),
    };

    let _ = client_write.shutdown().await;
    let _ = backend_write.shutdown().await;

    (closed, result)
}

/// Opens WebSocket tunnels to backends
#[derive(Clone, Default)]
pub struct Tunnel {
    connector: Connector,
}

impl Tunnel {
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    /// Run the upgrade handshake against the backend picked by `route` and,
    /// when it agrees to switch protocols, splice the connections once the
    /// 101 response has been sent to the client.
    pub async fn open<B>(&self, req: Request<B>, route: &Route) -> Response<ProxyBody>
    where
        B: Send,
    {
        let (mut parts, _body) = req.into_parts();
        info!("proxy ws request: {} -> {}", route.path_and_query, route.authority);

        let mut backend = match self.connector.connect(route).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error dialing websocket backend {}: {}", route.authority, e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Error contacting backend server.");
            }
        };

        let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
            error!("Connection for {} cannot be taken over", route.path_and_query);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Connection cannot be upgraded.");
        };

        let head = serialize_request(
            &parts.method,
            &route.path_and_query,
            &parts.headers,
            parts.uri.authority().map(|a| a.as_str()),
        );
        if let Err(e) = backend.write_all(&head).await {
            error!("Error copying request to websocket backend {}: {}", route.authority, e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Error contacting backend server.");
        }

        let (status, headers, leftover) = match read_response_head(&mut backend).await {
            Ok(head) => head,
            Err(e) => {
                error!("Error reading websocket handshake from {}: {}", route.authority, e);
                return text_response(StatusCode::BAD_GATEWAY, "WebSocket upgrade failed");
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!("WebSocket upgrade rejected by backend {} with {}", route.authority, status);
            return text_response(StatusCode::BAD_GATEWAY, "WebSocket upgrade failed");
        }

        let authority = route.authority.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!("Hijack error: {}", e);
                    return;
                }
            };

            let mut client = TokioIo::new(upgraded);
            if !leftover.is_empty() {
                if let Err(e) = client.write_all(&leftover).await {
                    debug!("Failed to relay early websocket bytes: {}", e);
                    return;
                }
            }

            debug!("websocket tunnel to {} open", authority);
            match pipe(client, backend).await {
                (closed, Ok(bytes)) => {
                    debug!("websocket tunnel to {} closed by {:?} after {} bytes", authority, closed, bytes)
                }
                (closed, Err(e)) => {
                    debug!("websocket tunnel to {} closed by {:?}: {}", authority, closed, e)
                }
            }
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = headers;
        response
    }
}
