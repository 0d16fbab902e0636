//! Origin transport
//!
//! Performs single, non-redirecting round trips and raw TCP dials on behalf
//! of the engine. One instance is shared by every session.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::uri::{Authority, PathAndQuery, Uri};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{PassthruError, Result};

/// Streaming body type used for both requests and responses
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Trait for raw duplex connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Capability the engine uses to reach origins
///
/// Implementations must be safe to call concurrently from many sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute exactly one request/response exchange
    ///
    /// No retries, no redirect following, no header rewriting.
    async fn round_trip(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>>;

    /// Open a raw TCP connection to `host:port`
    async fn dial(&self, addr: &str) -> Result<Box<dyn ProxyConnection>>;
}

/// Transport that talks to origins directly over plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTransport;

impl DirectTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for DirectTransport {
    #[instrument(skip(self, request), fields(method = %request.method(), uri = %request.uri()))]
    async fn round_trip(&self, mut request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        if let Some(scheme) = request.uri().scheme_str() {
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(PassthruError::UnsupportedScheme(scheme.to_string()));
            }
        }

        let (host, port) = parse_target(request.uri(), request.headers())?;
        let addr = format_tcp_addr(&host, port);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| PassthruError::Dial {
                addr: addr.clone(),
                source: e,
            })?;
        enable_nodelay(&stream);

        // The origin sees the request-target in origin-form, everything else as sent
        if !request.headers().contains_key(HOST) {
            let host_value = request
                .uri()
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| addr.clone());
            let value = HeaderValue::from_str(&host_value)
                .map_err(|e| PassthruError::InvalidRequest(format!("Bad host: {}", e)))?;
            request.headers_mut().insert(HOST, value);
        }
        *request.uri_mut() = origin_form(request.uri());

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| PassthruError::RoundTrip(format!("Handshake failed: {}", e)))?;

        // Spawn connection driver; it ends when the response body is done
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection ended: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PassthruError::RoundTrip(e.to_string()))?;

        debug!(status = %response.status(), "Origin responded");
        Ok(response.map(|body| body.map_err(io::Error::other).boxed_unsync()))
    }

    #[instrument(skip(self))]
    async fn dial(&self, addr: &str) -> Result<Box<dyn ProxyConnection>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PassthruError::Dial {
                addr: addr.to_string(),
                source: e,
            })?;
        enable_nodelay(&stream);

        debug!("Dialed {}", addr);
        Ok(Box::new(stream))
    }
}

/// Disable Nagle on a proxied socket, logging failures
pub(crate) fn enable_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Parse host and port of the origin a plain request is addressed to
///
/// The absolute URI wins; an origin-form URI falls back to the Host header.
pub fn parse_target(uri: &Uri, headers: &HeaderMap) -> Result<(String, u16)> {
    if let Some(authority) = uri.authority() {
        return Ok(split_authority(authority, default_port(uri)));
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PassthruError::InvalidRequest("Missing host in URI".to_string()))?;
    let authority: Authority = host
        .parse()
        .map_err(|_| PassthruError::InvalidRequest(format!("Invalid Host header: {}", host)))?;

    Ok(split_authority(&authority, default_port(uri)))
}

/// Parse the `host:port` a CONNECT request asks for, defaulting to 443
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let authority: Authority = authority
        .parse()
        .map_err(|_| PassthruError::InvalidRequest(format!("Invalid authority: {}", authority)))?;

    Ok(split_authority(&authority, 443))
}

/// Format host/port for TCP connect and logging, bracketing IPv6 literals
pub fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn split_authority(authority: &Authority, default: u16) -> (String, u16) {
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    (host, authority.port_u16().unwrap_or(default))
}

fn default_port(uri: &Uri) -> u16 {
    match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    }
}

fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path)
}
