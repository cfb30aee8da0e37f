//! Hand-off of announcements to the message bus.
//!
//! The broker connection itself lives outside this workspace. `outbox`
//! appends each message to a durable JSONL file that a bridge forwards;
//! `stdout` prints `topic payload` lines for piping into a bus client.

use crate::message::OutboundMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode message for {topic}: {message}")]
    Encode { topic: String, message: String },

    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport rejected message for {topic}: {message}")]
    Rejected { topic: String, message: String },

    #[error("corrupt outbox {path} line {line}: {message}")]
    CorruptOutbox {
        path: String,
        line: usize,
        message: String,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one message. `Ok` means the message is durably handed off.
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// One line of the outbox file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug)]
pub struct OutboxTransport {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let encode_err = |e: serde_json::Error| TransportError::Encode {
            topic: message.topic.clone(),
            message: e.to_string(),
        };
        let record = OutboxRecord {
            topic: message.topic.clone(),
            payload: serde_json::to_value(&message.payload).map_err(encode_err)?,
        };
        let mut line = serde_json::to_vec(&record).map_err(encode_err)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StdoutTransport {
    write_lock: Mutex<()>,
}

#[async_trait]
impl Transport for StdoutTransport {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let body = message.payload_json().map_err(|e| TransportError::Encode {
            topic: message.topic.clone(),
            message: e.to_string(),
        })?;
        let line = format!("{} {}\n", message.topic, body);

        let _guard = self.write_lock.lock().await;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Read back every record in an outbox file. A missing file is empty.
pub fn read_outbox(path: impl AsRef<Path>) -> Result<Vec<OutboxRecord>, TransportError> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| TransportError::CorruptOutbox {
                path: path.display().to_string(),
                line: idx + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory transport that records messages and can fail or stall on demand.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        sent: StdMutex<Vec<OutboundMessage>>,
        fail_remaining: AtomicUsize,
        stall: Option<Duration>,
    }

    impl RecordingTransport {
        pub(crate) fn failing(times: usize) -> Self {
            Self {
                fail_remaining: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        pub(crate) fn stalling(delay: Duration) -> Self {
            Self {
                stall: Some(delay),
                ..Self::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            if let Some(delay) = self.stall {
                tokio::time::sleep(delay).await;
            }
            let failed = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(TransportError::Rejected {
                    topic: message.topic.clone(),
                    message: "broker unavailable".to_string(),
                });
            }
            self.sent.lock().expect("sent lock").push(message.clone());
            Ok(())
        }
    }
}
