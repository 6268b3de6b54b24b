//! Publisher writing events to the log only.

use futures::future::BoxFuture;
use tracing::{info, warn};

use super::EventPublisher;
use crate::error::Result;
use crate::event::{Event, EventType};

/// Logs every event through `tracing`. Useful for dry runs.
#[derive(Debug, Clone)]
pub struct LogPublisher {
    name: String,
}

impl LogPublisher {
    /// Creates a log publisher.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogPublisher {
    fn default() -> Self {
        Self::new("log")
    }
}

impl EventPublisher for LogPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match event.event_type {
                EventType::Alert => warn!(
                    sid = event.sid,
                    hashid = event.hashid,
                    etime = event.etime,
                    endpoint = %event.endpoint,
                    value = %event.value,
                    partition = %event.partition,
                    info = %event.info,
                    "ALERT"
                ),
                EventType::Recovery => info!(
                    sid = event.sid,
                    hashid = event.hashid,
                    etime = event.etime,
                    endpoint = %event.endpoint,
                    value = %event.value,
                    partition = %event.partition,
                    "RECOVERY"
                ),
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(LogPublisher::default().name(), "log");
        assert_eq!(LogPublisher::new("dry-run").name(), "dry-run");
    }

    #[tokio::test]
    async fn test_publish_always_succeeds() {
        let p = LogPublisher::default();
        let alert = Event::new(1, "/event/p1", EventType::Alert);
        let recovery = Event::new(1, "/event/p1", EventType::Recovery);
        assert!(p.publish(&alert).await.is_ok());
        assert!(p.publish(&recovery).await.is_ok());
        p.close().await;
    }
}
