//! Response sinks
//!
//! A sink receives the origin's response head and body for a plain request,
//! or gives up its raw client connection for a CONNECT tunnel.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{PassthruError, Result};
use crate::proxy::transport::ProxyConnection;

/// Outbound half of a session
#[async_trait]
pub trait ResponseSink: Send {
    /// Headers that `write_head` will send; must be complete before it is called
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the status line and the current headers
    async fn write_head(&mut self, status: StatusCode) -> io::Result<()>;

    /// Send a chunk of response body
    async fn write_body(&mut self, data: &[u8]) -> io::Result<()>;

    /// Terminate the body framing and flush
    async fn finish(&mut self) -> io::Result<()>;

    /// Take exclusive raw ownership of the client connection
    ///
    /// Sinks that cannot yield a raw connection keep the default.
    fn hijack(&mut self) -> Result<Box<dyn ProxyConnection>> {
        Err(PassthruError::HijackUnsupported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Body bytes are written as they come (length or close delimited)
    Passthrough,
    /// Body is re-chunked because the origin declared chunked coding
    Chunked,
    /// No body may follow this head
    Bodyless,
}

/// Sink that writes HTTP/1.1 straight onto the client's socket
///
/// The listener closes every connection after one exchange, so the head
/// always carries `Connection: close`.
pub struct ConnSink {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    headers: HeaderMap,
    version: Version,
    head_request: bool,
    framing: Option<Framing>,
}

impl ConnSink {
    /// `reader` is `None` when the request body already owns the read half
    pub fn new(
        reader: Option<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
        version: Version,
        head_request: bool,
    ) -> Self {
        Self {
            reader,
            writer: Some(writer),
            headers: HeaderMap::new(),
            version,
            head_request,
            framing: None,
        }
    }

    fn writer(&mut self) -> io::Result<&mut OwnedWriteHalf> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection hijacked"))
    }

    fn framing_for(&self, status: StatusCode) -> Framing {
        if self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Framing::Bodyless;
        }

        if is_chunked(&self.headers) {
            Framing::Chunked
        } else {
            Framing::Passthrough
        }
    }
}

#[async_trait]
impl ResponseSink for ConnSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        if self.framing.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response head already written",
            ));
        }

        let mut framing = self.framing_for(status);
        // HTTP/1.0 has no chunked coding; the closing connection ends the body
        if framing == Framing::Chunked && self.version == Version::HTTP_10 {
            self.headers.remove(TRANSFER_ENCODING);
            framing = Framing::Passthrough;
        }
        self.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));

        let head = encode_head(self.version, status, &self.headers);
        self.writer()?.write_all(&head).await?;
        self.framing = Some(framing);
        Ok(())
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        let framing = self.framing.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "body written before head")
        })?;

        match framing {
            Framing::Bodyless => Ok(()),
            Framing::Passthrough => self.writer()?.write_all(data).await,
            Framing::Chunked => {
                // An empty chunk would terminate the body early
                if data.is_empty() {
                    return Ok(());
                }
                let writer = self.writer()?;
                writer
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                writer.write_all(data).await?;
                writer.write_all(b"\r\n").await
            }
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        let framing = self.framing;
        let writer = self.writer()?;
        if framing == Some(Framing::Chunked) {
            writer.write_all(b"0\r\n\r\n").await?;
        }
        writer.flush().await
    }

    fn hijack(&mut self) -> Result<Box<dyn ProxyConnection>> {
        if self.framing.is_some() {
            return Err(PassthruError::Hijack(
                "response head already written".to_string(),
            ));
        }

        let reader = self.reader.take().ok_or_else(|| {
            PassthruError::Hijack("read half is owned by the request body".to_string())
        })?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PassthruError::Hijack("connection already hijacked".to_string()))?;

        Ok(Box::new(ClientConn::new(reader, writer)))
    }
}

pin_project! {
    /// Reunites a buffered read half and a write half into one duplex stream
    ///
    /// Bytes the client sent right behind its request head stay in the
    /// reader's buffer and are delivered first.
    #[derive(Debug)]
    pub struct ClientConn<R, W> {
        #[pin]
        reader: R,
        #[pin]
        writer: W,
    }
}

impl<R, W> ClientConn<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead, W> AsyncRead for ClientConn<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl<R, W: AsyncWrite> AsyncWrite for ClientConn<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

/// Check whether chunked is the final transfer coding
pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .last()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Serialize a status line and headers, terminated by the empty line
pub(crate) fn encode_head(version: Version, status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let version = if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };

    let mut head = format!(
        "{} {} {}\r\n",
        version,
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}
