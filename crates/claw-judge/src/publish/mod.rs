//! Event publishers.
//!
//! This module provides the [`EventPublisher`] trait and the publishers events
//! can be routed to: a JSON-lines file, an HTTP queue gateway and the log.

mod file;
mod http;
mod log;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, Result};
use crate::event::Event;

pub use file::FilePublisher;
pub use http::HttpPublisher;
pub use log::LogPublisher;

/// Sink for alert and recovery events.
pub trait EventPublisher: Send + Sync {
    /// Returns the name of this publisher.
    fn name(&self) -> &str {
        "publisher"
    }

    /// Delivers (or buffers) one event.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Publish` if the event cannot be accepted.
    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<()>>;

    /// Stops accepting events and drains whatever is buffered.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Which publisher to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// JSON lines in a local file.
    File,
    /// POST to an HTTP queue gateway.
    Http,
    /// Log lines only.
    #[default]
    Log,
}

impl fmt::Display for PublisherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Http => write!(f, "http"),
            Self::Log => write!(f, "log"),
        }
    }
}

/// Settings of the file publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePublisherConfig {
    /// Output file; truncated on open.
    pub path: String,
}

/// Settings of the HTTP publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPublisherConfig {
    /// Gateway URLs; tried in random order per event.
    pub addrs: Vec<String>,
    /// Timeout of one POST.
    pub call_timeout_ms: u64,
    /// Capacity of the send buffer.
    pub buffer_size: usize,
    /// How long `publish` waits for buffer space.
    pub enqueue_timeout_ms: u64,
}

impl Default for HttpPublisherConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            call_timeout_ms: 1000,
            buffer_size: 1024,
            enqueue_timeout_ms: 200,
        }
    }
}

/// The `[publisher]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Selected publisher.
    #[serde(rename = "type")]
    pub kind: PublisherKind,
    /// File publisher settings.
    pub file: FilePublisherConfig,
    /// HTTP publisher settings.
    pub http: HttpPublisherConfig,
}

impl PublisherConfig {
    /// Checks that the selected publisher has a target.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Publish` naming the missing setting.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            PublisherKind::File if self.file.path.is_empty() => Err(JudgeError::Publish {
                reason: "file publisher needs publisher.file.path".to_string(),
            }),
            PublisherKind::Http if self.http.addrs.is_empty() => Err(JudgeError::Publish {
                reason: "http publisher needs publisher.http.addrs".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Builds the configured publisher. The HTTP publisher starts its send loop,
/// so this must run inside a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the configuration is incomplete or the target cannot be opened.
pub fn build_publisher(config: &PublisherConfig) -> Result<Arc<dyn EventPublisher>> {
    config.validate()?;
    Ok(match config.kind {
        PublisherKind::File => Arc::new(FilePublisher::new(&config.file)?),
        PublisherKind::Http => Arc::new(HttpPublisher::new(config.http.clone())?),
        PublisherKind::Log => Arc::new(LogPublisher::default()),
    })
}
