//! JSON-lines file publisher.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{EventPublisher, FilePublisherConfig};
use crate::error::{JudgeError, Result};
use crate::event::Event;

/// Appends one JSON line per event to a file.
///
/// The file is truncated when the publisher is created and re-created if it
/// disappears (e.g. rotated away). Events published after `close` are refused
/// with `JudgeError::Closed`.
#[derive(Debug)]
pub struct FilePublisher {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

async fn open(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
}

impl FilePublisher {
    /// Opens (and truncates) the output file.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError::Publish` for an empty path and `JudgeError::Io` if
    /// the file cannot be opened.
    pub fn new(config: &FilePublisherConfig) -> Result<Self> {
        if config.path.is_empty() {
            return Err(JudgeError::Publish {
                reason: "empty file name".to_string(),
            });
        }
        let path = PathBuf::from(&config.path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(File::from_std(file))),
        })
    }

    async fn write(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            return Err(JudgeError::Closed);
        }
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            warn!(path = %self.path.display(), "event file removed, re-creating");
            *guard = Some(open(&self.path).await?);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
        }
        Ok(())
    }
}

impl EventPublisher for FilePublisher {
    fn name(&self) -> &str {
        "file"
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(event))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut file) = self.file.lock().await.take() {
                if let Err(e) = file.flush().await {
                    warn!(path = %self.path.display(), error = %e, "event file flush failed");
                }
            }
            info!(path = %self.path.display(), "file publish closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use claw_series::Point;
    use std::collections::BTreeMap;

    fn event(sid: i64) -> Event {
        let mut e = Event::new(sid, "/event/p1", EventType::Alert);
        let tags = BTreeMap::from([("endpoint".to_string(), "h1".to_string())]);
        e.set_points("cpu/h1", "cpu", &tags, 10, vec![Point::new(10, 91.0)]);
        e.finalize();
        e
    }

    fn publisher(dir: &tempfile::TempDir) -> (FilePublisher, PathBuf) {
        let path = dir.path().join("events.log");
        let config = FilePublisherConfig {
            path: path.to_string_lossy().into_owned(),
        };
        (FilePublisher::new(&config).unwrap(), path)
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(FilePublisher::new(&FilePublisherConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (p, path) = publisher(&dir);
        p.publish(&event(1)).await.unwrap();
        p.publish(&event(2)).await.unwrap();
        p.close().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["sid"], 1);
        assert_eq!(first["event_type"], "alert");
    }

    #[tokio::test]
    async fn test_recreates_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let (p, path) = publisher(&dir);
        p.publish(&event(1)).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        p.publish(&event(2)).await.unwrap();
        p.close().await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(r#""sid":2"#));
    }

    #[tokio::test]
    async fn test_publish_after_close_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (p, path) = publisher(&dir);
        p.close().await;
        assert!(matches!(p.publish(&event(1)).await, Err(JudgeError::Closed)));
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }
}
