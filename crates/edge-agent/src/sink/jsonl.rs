//! JSON-lines file sink with a background writer.

use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RecordSink, SinkError};
use crate::events::AgentEvent;

/// One JSON object per line, one file per agent.
///
/// Writes happen on a background task. After `max_failures` consecutive write
/// failures the `fatal` token is cancelled so the process can exit.
pub struct JsonlSink {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlSink {
    pub async fn open(
        path: impl AsRef<Path>,
        max_failures: u32,
        fatal: CancellationToken,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SinkError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
        }
        let file = open_append(&path).await.map_err(|source| SinkError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(
            file,
            path.clone(),
            rx,
            max_failures.max(1),
            fatal,
        ));
        debug!("Record sink writing to {}", path.display());

        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting events and wait until everything queued is written.
    pub async fn close(&self) {
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("Record sink writer ended abnormally: {}", e);
            }
        }
    }
}

impl RecordSink for JsonlSink {
    fn append(&self, event: &AgentEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.type_name(), e);
                return;
            }
        };
        if let Some(tx) = self.tx.lock().as_ref() {
            if tx.send(line).is_err() {
                warn!("Record sink closed, dropping {} event", event.type_name());
            }
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_lines(
    mut file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
    max_failures: u32,
    fatal: CancellationToken,
) {
    let mut failures = 0u32;
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                error!(
                    "Failed to write record to {} ({}/{}): {}",
                    path.display(),
                    failures,
                    max_failures,
                    e
                );
                if failures >= max_failures {
                    error!(
                        "Record sink {} failed {} times in a row, escalating",
                        path.display(),
                        failures
                    );
                    fatal.cancel();
                    return;
                }
                // The handle may be stale (file removed or rotated), try a fresh one.
                match open_append(&path).await {
                    Ok(reopened) => file = reopened,
                    Err(e) => debug!("Reopening {} failed: {}", path.display(), e),
                }
            }
        }
    }
    if let Err(e) = file.sync_all().await {
        warn!("Failed to sync record file {}: {}", path.display(), e);
    }
}
