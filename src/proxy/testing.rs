//! In-memory fakes for engine and listener tests

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::Mutex;

use crate::error::{PassthruError, Result};
use crate::proxy::session::{Session, SessionLogger, SessionTag};
use crate::proxy::sink::ResponseSink;
use crate::proxy::transport::{ProxyBody, ProxyConnection, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub tag: SessionTag,
    pub message: String,
}

/// Logger that keeps every line in memory
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<LogLine>>,
}

impl RecordingLogger {
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    pub fn infos(&self) -> Vec<String> {
        self.messages(LogLevel::Info)
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(LogLevel::Error)
    }

    fn messages(&self, level: LogLevel) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.level == level)
            .map(|line| line.message.clone())
            .collect()
    }

    fn push(&self, level: LogLevel, tag: &SessionTag, message: fmt::Arguments<'_>) {
        self.lines.lock().push(LogLine {
            level,
            tag: *tag,
            message: message.to_string(),
        });
    }
}

impl SessionLogger for RecordingLogger {
    fn info(&self, tag: &SessionTag, message: fmt::Arguments<'_>) {
        self.push(LogLevel::Info, tag, message);
    }

    fn error(&self, tag: &SessionTag, message: fmt::Arguments<'_>) {
        self.push(LogLevel::Error, tag, message);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Head {
        status: StatusCode,
        headers: HeaderMap,
    },
    Body(Bytes),
    Finish,
}

#[derive(Default)]
struct SinkState {
    events: Vec<SinkEvent>,
    conn: Option<Box<dyn ProxyConnection>>,
    hijacked: bool,
}

/// Sink that records what the engine writes; clones share state
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
    // Snapshotted into the head event by write_head
    headers: HeaderMap,
}

impl RecordingSink {
    /// A sink that yields `conn` when hijacked
    pub fn hijackable<C: ProxyConnection>(conn: C) -> Self {
        let sink = Self::default();
        sink.state.lock().conn = Some(Box::new(conn));
        sink
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().events.clone()
    }

    pub fn head(&self) -> Option<(StatusCode, HeaderMap)> {
        self.state.lock().events.iter().find_map(|event| match event {
            SinkEvent::Head { status, headers } => Some((*status, headers.clone())),
            _ => None,
        })
    }

    pub fn body(&self) -> Vec<u8> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Body(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn finished(&self) -> bool {
        self.state.lock().events.contains(&SinkEvent::Finish)
    }

    pub fn hijacked(&self) -> bool {
        self.state.lock().hijacked
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        self.state.lock().events.push(SinkEvent::Head {
            status,
            headers: self.headers.clone(),
        });
        Ok(())
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.state
            .lock()
            .events
            .push(SinkEvent::Body(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.state.lock().events.push(SinkEvent::Finish);
        Ok(())
    }

    fn hijack(&mut self) -> Result<Box<dyn ProxyConnection>> {
        let mut state = self.state.lock();
        let conn = state.conn.take().ok_or(PassthruError::HijackUnsupported)?;
        state.hijacked = true;
        Ok(conn)
    }
}

/// Transport that replays scripted responses and origin connections
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Response<ProxyBody>>>>,
    origins: Mutex<VecDeque<Box<dyn ProxyConnection>>>,
    dialed: Mutex<Vec<String>>,
    round_trips: AtomicUsize,
}

impl ScriptedTransport {
    pub fn with_response(response: Response<ProxyBody>) -> Self {
        let transport = Self::default();
        transport.set_response(response);
        transport
    }

    pub fn failing_round_trip(error: PassthruError) -> Self {
        let transport = Self::default();
        transport.responses.lock().push_back(Err(error));
        transport
    }

    pub fn with_origin<C: ProxyConnection>(conn: C) -> Self {
        let transport = Self::default();
        transport.origins.lock().push_back(Box::new(conn));
        transport
    }

    /// Every dial is refused
    pub fn failing_dial() -> Self {
        Self::default()
    }

    pub fn set_response(&self, response: Response<ProxyBody>) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.dialed.lock().len()
    }

    pub fn dialed_addrs(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn round_trip(&self, _request: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(PassthruError::RoundTrip("no scripted response".to_string())))
    }

    async fn dial(&self, addr: &str) -> Result<Box<dyn ProxyConnection>> {
        self.dialed.lock().push(addr.to_string());
        self.origins.lock().pop_front().ok_or_else(|| PassthruError::Dial {
            addr: addr.to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        })
    }
}

pub fn session(
    request: Request<ProxyBody>,
    sink: RecordingSink,
    logger: Arc<RecordingLogger>,
) -> Session {
    Session::new(request, Box::new(sink), logger, None)
}
