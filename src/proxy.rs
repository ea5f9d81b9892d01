//! Proxy server implementation
//! Accepts client connections, runs the gate and hands admitted requests to
//! the matching backend, the WebSocket tunnel or the static file server

use crate::auth::{self, Authenticator};
use crate::certificate::server_acceptor;
use crate::config::Conf;
use crate::gate::Gate;
use crate::oauth::{LoginFlow, OAuthFlow};
use crate::registry::{BackendRegistry, Route};
use crate::response::{ProxyBody, text_response};
use crate::static_files::StaticFiles;
use crate::tunnel::{Tunnel, is_websocket_upgrade};
use crate::upstream::{Connector, strip_hop_by_hop};
use anyhow::{Context, Result, anyhow};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// `:8080` style addresses listen on every interface
pub fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Proxy server
pub struct ProxyServer {
    addr: String,
    registry: BackendRegistry,
    gate: Gate,
    login: Arc<dyn LoginFlow>,
    files: StaticFiles,
    connector: Connector,
    tunnel: Tunnel,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    /// Build the server with the OAuth2 login flow and the authenticator of
    /// the configured service
    pub fn from_config(conf: &Conf) -> Result<Self> {
        let login: Arc<dyn LoginFlow> = Arc::new(OAuthFlow::from_config(conf)?);
        let authenticator = auth::from_config(conf)?;
        Self::new(conf, authenticator, login)
    }

    /// Create a new proxy server
    pub fn new(conf: &Conf, authenticator: Arc<dyn Authenticator>, login: Arc<dyn LoginFlow>) -> Result<Self> {
        let registry = BackendRegistry::from_rules(&conf.proxies)?;

        let tls = if conf.tls_enabled() {
            Some(server_acceptor(&conf.ssl.cert, &conf.ssl.key)?)
        } else {
            None
        };

        let connector = Connector::default();
        info!("starting static file server for: {}", conf.htdocs);

        Ok(Self {
            addr: listen_addr(&conf.addr),
            registry,
            gate: Gate::new(login.clone(), authenticator, conf.restrictions.clone()),
            login,
            files: StaticFiles::new(&conf.htdocs),
            tunnel: Tunnel::new(connector.clone()),
            connector,
            tls,
        })
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            "starting server at {} ({})",
            local,
            if self.tls.is_some() { "https" } else { "http" }
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single client connection
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        match self.tls.clone() {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| anyhow!("TLS handshake failed: {}", e))?;
                self.serve_io(stream, remote_addr, true).await
            }
            None => self.serve_io(stream, remote_addr, false).await,
        }
    }

    async fn serve_io<I>(self: Arc<Self>, io: I, remote_addr: SocketAddr, https: bool) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                TokioIo::new(io),
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr, https).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        https: bool,
    ) -> Result<Response<ProxyBody>, Infallible> {
        match self.process_request(req, remote_addr, https).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {}", e);
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    /// Login endpoints, then the gate, then dispatch. The route is resolved
    /// before the gate so only upgrades bound for a backend skip it
    async fn process_request(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        https: bool,
    ) -> Result<Response<ProxyBody>> {
        debug!("{} {} from {}", req.method(), req.uri().path(), remote_addr);

        if let Some(response) = self.login.handle(req.uri(), req.headers()).await {
            return Ok(response);
        }

        let host = req.headers().get(HOST).and_then(|h| h.to_str().ok());
        let route = self.registry.direct(host, req.uri());

        if let Some(response) = self.gate.check(&mut req, route.is_some()).await.into_response() {
            return Ok(response);
        }

        let Some(route) = route else {
            return Ok(self.files.serve(req.method(), req.uri().path()).await);
        };

        if is_websocket_upgrade(req.headers()) {
            return Ok(self.tunnel.open(req, &route).await);
        }

        self.forward(req, &route, remote_addr, https).await
    }

    /// Stream the request to the backend picked by `route` and stream its
    /// answer back
    async fn forward(
        &self,
        req: Request<Incoming>,
        route: &Route,
        remote_addr: SocketAddr,
        https: bool,
    ) -> Result<Response<ProxyBody>> {
        let (parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

        let uri: Uri = route.path_and_query.parse().context("Invalid backend URI")?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let client_ip = remote_addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host.clone());
            headers.insert(HOST, host);
        } else {
            headers.insert(HOST, HeaderValue::from_str(&route.authority)?);
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if https { "https" } else { "http" }),
        );

        let mut proxy_req = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .context("Failed to build proxy request")?;
        *proxy_req.headers_mut() = headers;

        debug!("Proxying to: {}{}", route.authority, route.path_and_query);

        let stream = match self.connector.connect(route).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to connect to backend {}: {}", route.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(handshake) => handshake,
            Err(e) => {
                error!("Failed to establish connection to backend {}: {}", route.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let response = match sender.send_request(proxy_req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send request to backend {}: {}", route.authority, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
