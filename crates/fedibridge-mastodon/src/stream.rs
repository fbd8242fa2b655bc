//! Server-sent-events parser for the user notification stream.
//!
//! The streaming API delivers `event:`/`data:` line pairs separated by blank
//! lines, with `:`-prefixed heartbeats in between. Only `notification`
//! events are surfaced; everything else (heartbeats, `delete`, filter
//! updates) is skipped.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::Notification;
use crate::MastodonError;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, MastodonError>> + Send>>;

/// Pull-based view of the notification stream.
pub struct NotificationStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl NotificationStream {
    pub(crate) fn new(inner: ByteStream) -> NotificationStream {
        NotificationStream {
            inner,
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
        }
    }

    /// Build from any chunk stream (used by tests).
    pub fn from_chunks(
        inner: impl Stream<Item = Result<Bytes, MastodonError>> + Send + 'static,
    ) -> NotificationStream {
        NotificationStream::new(Box::pin(inner))
    }

    /// Next notification, or `None` when the server closed the stream.
    pub async fn next_notification(&mut self) -> Result<Option<Notification>, MastodonError> {
        loop {
            while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(notification) = self.take_line(line.trim_end_matches(['\r', '\n']))? {
                    return Ok(Some(notification));
                }
            }
            match self.inner.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => return Ok(None),
            }
        }
    }

    fn take_line(&mut self, line: &str) -> Result<Option<Notification>, MastodonError> {
        if line.is_empty() {
            // blank line terminates the pending event
            let event = self.event.take();
            let payload = self.data.join("\n");
            self.data.clear();
            if event.as_deref() != Some("notification") || payload.is_empty() {
                return Ok(None);
            }
            return match serde_json::from_str::<Notification>(&payload) {
                Ok(notification) => {
                    debug!(kind = %notification.kind, "notification received");
                    Ok(Some(notification))
                }
                Err(e) => {
                    // A malformed event is the server's problem, not a
                    // reason to tear the stream down.
                    warn!(error = %e, "undecodable notification event skipped");
                    Ok(None)
                }
            };
        }
        if line.starts_with(':') {
            return Ok(None); // heartbeat
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        }
        Ok(None)
    }
}
