//! Direct engine
//!
//! Forwards plain requests to their origin and turns CONNECT requests into
//! raw tunnels, with no upstream proxy in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::HOST;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, instrument};

use crate::error::{PassthruError, Result};
use crate::proxy::format::{beautify_duration, beautify_size};
use crate::proxy::session::{Session, SessionLog};
use crate::proxy::sink::ResponseSink;
use crate::proxy::transport::{format_tcp_addr, parse_authority, ProxyBody, Transport};
use crate::proxy::tunnel::{self, TunnelState, TunnelSummary};

/// Outcome of a plain request that was relayed completely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub target: String,
    pub status: StatusCode,
    pub elapsed: Duration,
    /// Body bytes received from the origin
    pub received: u64,
}

/// Fetches directly from the origin on behalf of the client
pub struct DirectEngine {
    transport: Arc<dyn Transport>,
}

impl DirectEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Route a session to the operation its method calls for
    pub async fn handle(&self, session: Session) {
        if session.request().method() == Method::CONNECT {
            self.connect(session).await;
        } else {
            self.serve(session).await;
        }
    }

    /// Replay a plain request to its origin and stream the response back
    ///
    /// Returns `None` when the session was aborted; the reason is already on
    /// the session's error log.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn serve(&self, session: Session) -> Option<ResponseSummary> {
        if session.request().method() == Method::CONNECT {
            let e = PassthruError::MethodMismatch("this function can not handle CONNECT method");
            session.error(format_args!("{}", e));
            return None;
        }
        let (request, mut sink, log) = session.into_parts();
        let start = Instant::now();
        let target = target_host(&request);

        let response = match self.transport.round_trip(request).await {
            Ok(response) => response,
            Err(e) => {
                log.error(format_args!("RoundTrip: {}", e));
                return None;
            }
        };
        let (parts, mut body) = response.into_parts();

        // Headers are final before the status line reaches the wire
        copy_headers(sink.headers_mut(), &parts.headers);
        if let Err(e) = sink.write_head(parts.status).await {
            log.error(format_args!("WriteHeader: {}", e));
            return None;
        }

        let received = match copy_body(&mut body, sink.as_mut()).await {
            Ok(n) => n,
            Err(e) => {
                log.error(format_args!("Copy: {}", e));
                return None;
            }
        };

        let elapsed = start.elapsed();
        log.info(format_args!(
            "RESPONSE {} {} in {} <-{}",
            target,
            status_line(parts.status),
            beautify_duration(elapsed),
            beautify_size(received)
        ));

        Some(ResponseSummary {
            target,
            status: parts.status,
            elapsed,
            received,
        })
    }

    /// Hijack the client connection and relay it to the CONNECT target
    ///
    /// Returns `None` when the session was aborted; the reason is already on
    /// the session's error log and no connection is left open.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn connect(&self, session: Session) -> Option<TunnelSummary> {
        let mut state = TunnelState::Start;

        if session.request().method() != Method::CONNECT {
            let e = PassthruError::MethodMismatch("this function can only handle CONNECT method");
            session.error(format_args!("{}", e));
            return None;
        }
        let (request, mut sink, log) = session.into_parts();
        advance(&mut state, TunnelState::PreconditionChecked);
        let start = Instant::now();

        let addr = match connect_addr(&request) {
            Ok(addr) => addr,
            Err(e) => {
                abort(&log, state, format_args!("{}", e));
                return None;
            }
        };
        drop(request);

        let mut client = match sink.hijack() {
            Ok(conn) => conn,
            Err(e) => {
                abort(&log, state, format_args!("Hijack: {}", e));
                return None;
            }
        };
        drop(sink);
        advance(&mut state, TunnelState::Hijacked);

        let origin = match self.transport.dial(&addr).await {
            Ok(conn) => conn,
            Err(e) => {
                drop(client);
                abort(&log, state, format_args!("Dial: {}", e));
                return None;
            }
        };
        advance(&mut state, TunnelState::Dialed);

        if let Err(e) = tunnel::write_ack(&mut client).await {
            abort(&log, state, format_args!("Ack: {}", e));
            return None;
        }
        advance(&mut state, TunnelState::AckSent);

        advance(&mut state, TunnelState::Relaying);
        let (upstream, downstream) = tunnel::relay(client, origin, &log).await;
        advance(&mut state, TunnelState::Closed);

        let elapsed = start.elapsed();
        log.info(format_args!(
            "CLOSE {} after {} ->{} <-{}",
            addr,
            beautify_duration(elapsed),
            beautify_size(upstream.bytes),
            beautify_size(downstream.bytes)
        ));

        Some(TunnelSummary {
            target: addr,
            elapsed,
            upstream,
            downstream,
        })
    }
}

fn advance(state: &mut TunnelState, next: TunnelState) {
    debug!(from = %state, to = %next, "Tunnel state");
    *state = next;
}

fn abort(log: &SessionLog, state: TunnelState, message: std::fmt::Arguments<'_>) {
    debug!(from = %state, to = %TunnelState::Aborted, "Tunnel state");
    log.error(message);
}

/// Copy every origin header into the sink, keeping repeated fields
fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name, value.clone());
    }
}

async fn copy_body(body: &mut ProxyBody, sink: &mut dyn ResponseSink) -> std::io::Result<u64> {
    let mut received = 0u64;

    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            received += data.len() as u64;
            sink.write_body(data).await?;
        }
    }

    sink.finish().await?;
    Ok(received)
}

/// Host the request is addressed to, for logging
fn target_host<B>(request: &Request<B>) -> String {
    request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// `host:port` a CONNECT request wants to reach
fn connect_addr<B>(request: &Request<B>) -> Result<String> {
    let authority = request
        .uri()
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| {
            PassthruError::InvalidRequest(format!("CONNECT target is not an authority: {}", request.uri()))
        })?;

    let (host, port) = parse_authority(authority)?;
    Ok(format_tcp_addr(&host, port))
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_str(), reason),
        None => status.as_str().to_string(),
    }
}
