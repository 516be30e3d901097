use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport rejected message for `{recipient}`: {reason}")]
    Rejected { recipient: String, reason: String },
    #[error("transport unreachable: {0}")]
    Unreachable(String),
}

/// The only contract the engine needs from the outbound messaging API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), TransportError>;
}

/// Accepts everything and records it, for tests and dry runs.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient.to_string(), text.to_string()));
        }
        Ok(())
    }
}

/// Fails the first `failures` sends, then behaves like `RecordingTransport`.
/// Exercises the partial-failure and retry paths.
pub struct FlakyTransport {
    remaining_failures: Mutex<u32>,
    inner: RecordingTransport,
}

impl FlakyTransport {
    pub fn failing_first(failures: u32) -> Self {
        Self { remaining_failures: Mutex::new(failures), inner: RecordingTransport::new() }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.inner.sent()
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
        {
            let mut remaining = self
                .remaining_failures
                .lock()
                .map_err(|_| TransportError::Unreachable("poisoned failure counter".into()))?;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Unreachable("injected failure".into()));
            }
        }
        self.inner.send(recipient, text).await
    }
}
