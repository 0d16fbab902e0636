//! Proxy listener
//!
//! Accepts client connections, reads one request off each, and hands it to
//! the engine as a session.
//!
//! hyper's server is not used here. Its upgrade path sends the response head
//! itself before handing over the connection, while a CONNECT session must
//! hijack the socket, dial the origin, and only then write its own literal
//! acknowledgment (or nothing at all when the dial fails). So the listener
//! parses the head with `httparse` and keeps the socket raw; the origin side
//! still goes through hyper's client.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{PassthruError, Result};
use crate::proxy::codec::{self, BodyFraming};
use crate::proxy::engine::DirectEngine;
use crate::proxy::session::{Session, SessionLogger};
use crate::proxy::sink::{encode_head, ConnSink};
use crate::proxy::transport::{empty_body, enable_nodelay};

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    engine: Arc<DirectEngine>,
    logger: Arc<dyn SessionLogger>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyServerConfig,
        engine: Arc<DirectEngine>,
        logger: Arc<dyn SessionLogger>,
    ) -> Self {
        Self {
            config,
            engine,
            logger,
        }
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);

        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let engine = self.engine.clone();
                            let logger = self.logger.clone();
                            let max_header_bytes = self.config.max_header_bytes;

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    engine,
                                    logger,
                                    max_header_bytes,
                                ).await {
                                    debug!(category = ?e.category(), "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection: one request, then close
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        engine: Arc<DirectEngine>,
        logger: Arc<dyn SessionLogger>,
        max_header_bytes: usize,
    ) -> Result<()> {
        enable_nodelay(&stream);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let head = match codec::read_request_head(&mut reader, max_header_bytes).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!(client = %client_addr, "Client closed before sending a request");
                return Ok(());
            }
            Err(e) => {
                reject(&mut write_half, &e).await;
                return Err(e);
            }
        };

        let framing = match codec::body_framing(&head) {
            Ok(framing) => framing,
            Err(e) => {
                reject(&mut write_half, &e).await;
                return Err(e);
            }
        };

        debug!(
            client = %client_addr,
            method = %head.method,
            uri = %head.uri,
            "Request received"
        );

        let version = head.version;
        let head_request = head.method == Method::HEAD;

        // A bodiless request leaves the read half with the sink for hijacking
        let (reader, body) = match framing {
            BodyFraming::Empty => (Some(reader), empty_body()),
            framing => (None, codec::request_body(reader, framing)),
        };

        let sink = ConnSink::new(reader, write_half, version, head_request);
        let session = Session::new(
            head.into_request(body),
            Box::new(sink),
            logger,
            Some(client_addr),
        );

        engine.handle(session).await;
        Ok(())
    }
}

/// Answer a request the listener could not accept, then let the connection close
async fn reject(writer: &mut OwnedWriteHalf, error: &PassthruError) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    let head = encode_head(Version::HTTP_11, error.status_code(), &headers);
    if let Err(e) = writer.write_all(&head).await {
        debug!("Failed to write error response: {}", e);
        return;
    }
    let _ = writer.shutdown().await;
}
