//! Per-request session context and the logging capability it carries
//!
//! A session is created by the listener for one parsed request, moved into
//! exactly one engine operation and dropped when that operation returns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::Request;
use tracing::{error, info};
use uuid::Uuid;

use crate::proxy::sink::ResponseSink;
use crate::proxy::transport::ProxyBody;

/// Identifies the session a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag {
    pub id: Uuid,
    pub peer: Option<SocketAddr>,
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} {}", self.id, peer),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Logging capability consumed by the engine
///
/// Implementations must return promptly and must not panic; a logging
/// failure is never allowed to change how a session proceeds.
pub trait SessionLogger: Send + Sync {
    /// Record a normal event
    fn info(&self, tag: &SessionTag, message: fmt::Arguments<'_>);

    /// Record a failure event
    fn error(&self, tag: &SessionTag, message: fmt::Arguments<'_>);
}

/// Emits session lines as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl SessionLogger for TracingLogger {
    fn info(&self, tag: &SessionTag, message: fmt::Arguments<'_>) {
        match tag.peer {
            Some(peer) => info!(session = %tag.id, peer = %peer, "{}", message),
            None => info!(session = %tag.id, "{}", message),
        }
    }

    fn error(&self, tag: &SessionTag, message: fmt::Arguments<'_>) {
        match tag.peer {
            Some(peer) => error!(session = %tag.id, peer = %peer, "{}", message),
            None => error!(session = %tag.id, "{}", message),
        }
    }
}

/// A logger bound to one session's tag
///
/// Cheap to clone so each tunnel direction can report on its own.
#[derive(Clone)]
pub struct SessionLog {
    tag: SessionTag,
    logger: Arc<dyn SessionLogger>,
}

impl SessionLog {
    pub fn new(tag: SessionTag, logger: Arc<dyn SessionLogger>) -> Self {
        Self { tag, logger }
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.logger.info(&self.tag, message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.logger.error(&self.tag, message);
    }
}

impl fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLog").field("tag", &self.tag).finish()
    }
}

/// Everything one engine operation needs to process a request
pub struct Session {
    request: Request<ProxyBody>,
    sink: Box<dyn ResponseSink>,
    log: SessionLog,
}

impl Session {
    pub fn new(
        request: Request<ProxyBody>,
        sink: Box<dyn ResponseSink>,
        logger: Arc<dyn SessionLogger>,
        peer: Option<SocketAddr>,
    ) -> Self {
        let tag = SessionTag {
            id: Uuid::new_v4(),
            peer,
        };

        Self {
            request,
            sink,
            log: SessionLog::new(tag, logger),
        }
    }

    pub fn id(&self) -> Uuid {
        self.log.tag.id
    }

    pub fn request(&self) -> &Request<ProxyBody> {
        &self.request
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.log.info(message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.log.error(message);
    }

    /// Split the session so the request body, the sink and the log can be
    /// owned independently
    pub fn into_parts(self) -> (Request<ProxyBody>, Box<dyn ResponseSink>, SessionLog) {
        (self.request, self.sink, self.log)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.log.tag.id)
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{RecordingLogger, RecordingSink};
    use crate::proxy::transport::empty_body;

    #[test]
    fn test_session_log_lines_carry_tag() {
        let logger = Arc::new(RecordingLogger::default());
        let request = Request::get("http://example.com/")
            .body(empty_body())
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let session = Session::new(
            request,
            Box::new(RecordingSink::default()),
            logger.clone(),
            Some(peer),
        );

        session.info(format_args!("hello {}", 1));
        session.error(format_args!("oops"));

        let lines = logger.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].tag.id, session.id());
        assert_eq!(lines[0].tag.peer, Some(peer));
        assert_eq!(lines[0].message, "hello 1");
        assert_eq!(logger.errors(), vec!["oops".to_string()]);
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let logger: Arc<dyn SessionLogger> = Arc::new(TracingLogger);
        let a = Session::new(
            Request::new(empty_body()),
            Box::new(RecordingSink::default()),
            logger.clone(),
            None,
        );
        let b = Session::new(
            Request::new(empty_body()),
            Box::new(RecordingSink::default()),
            logger,
            None,
        );

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_session_tag_display() {
        let tag = SessionTag {
            id: Uuid::nil(),
            peer: Some("10.0.0.1:4000".parse().unwrap()),
        };
        assert_eq!(
            tag.to_string(),
            "00000000-0000-0000-0000-000000000000 10.0.0.1:4000"
        );
    }
}
