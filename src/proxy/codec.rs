//! Inbound HTTP/1.x request parsing for the listener

use std::io;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{PassthruError, Result};
use crate::proxy::sink::is_chunked;
use crate::proxy::transport::{empty_body, ProxyBody};

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: u64 = 4096;

/// Parsed request line and headers
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn into_request(self, body: ProxyBody) -> Request<ProxyBody> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        request
    }
}

/// How the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// Read one request head, at most `limit` bytes
///
/// Returns `Ok(None)` when the client closed without sending anything.
pub async fn read_request_head<R>(reader: &mut R, limit: usize) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);

    loop {
        let start = buf.len();
        let budget = (limit + 1).saturating_sub(start) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut buf).await?;

        if buf.len() > limit {
            return Err(PassthruError::HeadTooLarge { limit });
        }
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PassthruError::InvalidRequest(
                "connection closed inside request head".to_string(),
            ));
        }

        let line = &buf[start..];
        if line == b"\r\n" || line == b"\n" {
            // Empty lines ahead of the request line are ignored
            if start == 0 {
                buf.clear();
                continue;
            }
            break;
        }
    }

    parse_head(&buf).map(Some)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(PassthruError::InvalidRequest("incomplete request head".to_string()))
        }
        Err(e) => return Err(PassthruError::InvalidRequest(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| PassthruError::InvalidRequest("missing method".to_string()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes())
                .map_err(|_| PassthruError::InvalidRequest(format!("invalid method: {}", m)))
        })?;

    let path = req
        .path
        .ok_or_else(|| PassthruError::InvalidRequest("missing request target".to_string()))?;
    let uri: Uri = path
        .parse()
        .map_err(|_| PassthruError::InvalidRequest(format!("invalid request target: {}", path)))?;

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
            PassthruError::InvalidRequest(format!("invalid header name: {}", header.name))
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| {
            PassthruError::InvalidRequest(format!("invalid value for header {}", header.name))
        })?;
        header_map.append(name, value);
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers: header_map,
    })
}

/// Decide how the request body is delimited
pub fn body_framing(head: &RequestHead) -> Result<BodyFraming> {
    if head.method == Method::CONNECT {
        return Ok(BodyFraming::Empty);
    }

    if head.headers.contains_key(TRANSFER_ENCODING) {
        if is_chunked(&head.headers) {
            return Ok(BodyFraming::Chunked);
        }
        let coding = head
            .headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        return Err(PassthruError::UnsupportedTransferCoding(coding));
    }

    let mut length: Option<u64> = None;
    for value in head.headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| PassthruError::InvalidRequest("invalid Content-Length".to_string()))?;

        match length {
            Some(existing) if existing != parsed => {
                return Err(PassthruError::InvalidRequest(
                    "conflicting Content-Length values".to_string(),
                ))
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        None | Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
    })
}

/// Stream the request body off the client connection
///
/// Chunked bodies are decoded here; the origin transport frames them again.
pub fn request_body<R>(reader: R, framing: BodyFraming) -> ProxyBody
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    match framing {
        BodyFraming::Empty => empty_body(),
        BodyFraming::Length(n) => {
            let stream = futures::stream::try_unfold((reader, n), |(reader, remaining)| {
                next_length_frame(reader, remaining)
            });
            StreamBody::new(stream).boxed_unsync()
        }
        BodyFraming::Chunked => {
            let stream = futures::stream::try_unfold((reader, 0), |(reader, remaining)| {
                next_chunked_frame(reader, remaining)
            });
            StreamBody::new(stream).boxed_unsync()
        }
    }
}

async fn next_length_frame<R>(
    mut reader: R,
    remaining: u64,
) -> io::Result<Option<(Frame<Bytes>, (R, u64))>>
where
    R: AsyncBufRead + Unpin,
{
    if remaining == 0 {
        return Ok(None);
    }

    let chunk = read_available(&mut reader, remaining).await?;
    let left = remaining - chunk.len() as u64;
    Ok(Some((Frame::data(chunk), (reader, left))))
}

async fn next_chunked_frame<R>(
    mut reader: R,
    mut remaining: u64,
) -> io::Result<Option<(Frame<Bytes>, (R, u64))>>
where
    R: AsyncBufRead + Unpin,
{
    if remaining == 0 {
        let line = read_chunk_line(&mut reader).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        remaining = u64::from_str_radix(size_field, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size: {}", size_field),
            )
        })?;

        if remaining == 0 {
            // Trailers are dropped
            while !read_chunk_line(&mut reader).await?.is_empty() {}
            return Ok(None);
        }
    }

    // Data is forwarded as it arrives, never a whole chunk at once
    let piece = read_available(&mut reader, remaining).await?;
    remaining -= piece.len() as u64;

    if remaining == 0 && !read_chunk_line(&mut reader).await?.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing CRLF after chunk data",
        ));
    }

    Ok(Some((Frame::data(piece), (reader, remaining))))
}

/// Take whatever is buffered, up to `max` bytes
async fn read_available<R>(reader: &mut R, max: u64) -> io::Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let buf = reader.fill_buf().await?;
    if buf.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "request body ended early",
        ));
    }

    let n = buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
    let chunk = Bytes::copy_from_slice(&buf[..n]);
    reader.consume(n);
    Ok(chunk)
}

/// Read one CRLF-terminated line of chunked framing, without the terminator
async fn read_chunk_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 || !line.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunked body ended early",
        ));
    }

    let line = String::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk line is not UTF-8"))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
