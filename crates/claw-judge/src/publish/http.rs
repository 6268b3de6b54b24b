//! HTTP queue gateway publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventPublisher, HttpPublisherConfig};
use crate::error::{JudgeError, Result};
use crate::event::Event;

/// Buffers events and POSTs them as JSON to `<addr>?topic=<partition>`.
///
/// Every event is offered to the addresses in random order until one answers
/// with a 2xx status. `close` stops accepting events and waits until the
/// buffer is drained; later events are refused with `JudgeError::Closed`.
#[derive(Debug)]
pub struct HttpPublisher {
    config: HttpPublisherConfig,
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HttpPublisher {
    /// Creates the publisher and starts its send loop.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Publish` without addresses and `JudgeError::Remote`
    /// if the HTTP client cannot be built.
    pub fn new(mut config: HttpPublisherConfig) -> Result<Self> {
        if config.addrs.is_empty() {
            return Err(JudgeError::Publish {
                reason: "empty publish addr".to_string(),
            });
        }
        config.buffer_size = config.buffer_size.max(1);
        let client = reqwest::Client::builder().build()?;
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let worker = tokio::spawn(send_loop(client, config.clone(), rx));

        Ok(Self {
            config,
            sender: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }
}

async fn send_loop(client: reqwest::Client, config: HttpPublisherConfig, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = push(&client, &config, &event).await {
            warn!(sid = event.sid, error = %e, "http publish failed finally");
        }
    }
    debug!("http publish loop stopped");
}

async fn push(client: &reqwest::Client, config: &HttpPublisherConfig, event: &Event) -> Result<()> {
    let mut addrs: Vec<&String> = config.addrs.iter().collect();
    addrs.shuffle(&mut rand::thread_rng());

    for addr in addrs {
        let resp = client
            .post(format!("{addr}?topic={}", event.partition))
            .timeout(Duration::from_millis(config.call_timeout_ms))
            .json(event)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => return Ok(()),
            Ok(r) => debug!(sid = event.sid, addr = %addr, code = r.status().as_u16(), "http publish rejected"),
            Err(e) => debug!(sid = event.sid, addr = %addr, error = %e, "http publish failed"),
        }
    }
    Err(JudgeError::Publish {
        reason: "no publish addr accepted the event".to_string(),
    })
}

impl EventPublisher for HttpPublisher {
    fn name(&self) -> &str {
        "http"
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(JudgeError::Closed);
            }
            let Some(tx) = self.sender.lock().clone() else {
                return Err(JudgeError::Closed);
            };
            let timeout = Duration::from_millis(self.config.enqueue_timeout_ms);
            tx.send_timeout(event.clone(), timeout)
                .await
                .map_err(|_| JudgeError::Publish {
                    reason: "buffer is full".to_string(),
                })
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            // Dropping the last sender ends the loop once the buffer is empty.
            drop(self.sender.lock().take());
            if let Some(worker) = self.worker.lock().await.take() {
                if let Err(e) = worker.await {
                    warn!(error = %e, "http publish loop failed");
                }
            }
            info!("http publish closed");
        })
    }
}
