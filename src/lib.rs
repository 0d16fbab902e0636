//! Passthru - Direct Forward Proxy
//!
//! A small HTTP forward proxy that talks to origins directly.
//!
//! ## Features
//!
//! - Absolute-form HTTP/1.x request forwarding
//! - CONNECT tunnels with byte-exact acknowledgment
//! - One summary log line per session with duration and transfer size
//! - Pluggable transport and response sink for testing

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{PassthruError, Result};
