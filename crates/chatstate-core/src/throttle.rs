//! Streaming throttle - coalesces output fragments into rate-limited,
//! sequence-ordered flushes.
//!
//! Each conversation owns a buffer guarded by an async mutex, so flushes for
//! one conversation never interleave and sequence numbers strictly increase.
//! Fragments appended while a flush is in progress wait on the lock and land
//! in the next flush. Transient delivery failures retry the same content
//! under [`RetryState`] backoff; content is never dropped on a transient
//! failure.

use crate::error::{CoreError, Result};
use crate::metrics::Metrics;
use crate::retry::{RetryConfig, RetryState};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Classified delivery failure from the transport collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Retried under backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Closes the stream immediately, no retry.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Delivery collaborator. Receives each flush with its sequence number; an
/// out-of-order sequence on the receiving side is the collaborator's concern,
/// the throttle never reorders.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(
        &self,
        conversation: &str,
        seq: u64,
        content: &str,
    ) -> std::result::Result<(), DeliveryError>;
}

/// Throttle configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Accumulated characters that trigger a flush.
    pub flush_threshold: usize,
    /// Maximum interval between flushes while fragments arrive.
    pub max_flush_interval: Duration,
    /// Timeout per delivery attempt; counts as a transient failure.
    pub delivery_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 200,
            max_flush_interval: Duration::from_millis(350),
            delivery_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Accumulating,
    Flushing,
    Closed,
}

struct StreamBuffer {
    content: String,
    next_seq: u64,
    last_flush: Instant,
    state: StreamState,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            content: String::new(),
            next_seq: 1,
            last_flush: Instant::now(),
            state: StreamState::Idle,
        }
    }
}

struct ConversationStream {
    id: String,
    buffer: Mutex<StreamBuffer>,
}

/// Per-conversation streaming throttle.
pub struct StreamThrottle {
    config: ThrottleConfig,
    sink: Arc<dyn DeliverySink>,
    streams: DashMap<String, Arc<ConversationStream>>,
    metrics: Arc<Metrics>,
}

impl StreamThrottle {
    pub fn new(config: ThrottleConfig, sink: Arc<dyn DeliverySink>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            sink,
            streams: DashMap::new(),
            metrics,
        }
    }

    /// Append a fragment. Returns the flushed sequence number when this
    /// append crossed the character threshold or the inter-flush interval.
    pub async fn append(&self, conversation: &str, fragment: &str) -> Result<Option<u64>> {
        let stream = self.stream(conversation);
        let mut buf = stream.buffer.lock().await;

        if buf.state == StreamState::Closed {
            drop(buf);
            // Reclaim the buffer of a stream closed by delivery failure.
            // Fragments after this rejection start a fresh stream.
            self.streams
                .remove_if(conversation, |_, s| Arc::ptr_eq(s, &stream));
            return Err(CoreError::StreamClosed(conversation.to_string()));
        }

        buf.content.push_str(fragment);
        buf.state = StreamState::Accumulating;

        let due = buf.content.len() >= self.config.flush_threshold
            || buf.last_flush.elapsed() >= self.config.max_flush_interval;
        if !due {
            return Ok(None);
        }

        let seq = self.flush_locked(&stream.id, &mut buf).await?;
        Ok(Some(seq))
    }

    /// Best-effort final flush, then close the stream. Further fragments for
    /// this conversation start a fresh stream.
    pub async fn finish(&self, conversation: &str) -> Result<Option<u64>> {
        let Some((_, stream)) = self.streams.remove(conversation) else {
            return Ok(None);
        };
        let mut buf = stream.buffer.lock().await;
        if buf.state == StreamState::Closed {
            return Ok(None);
        }

        let mut flushed = None;
        if !buf.content.is_empty() {
            let content = std::mem::take(&mut buf.content);
            let seq = buf.next_seq;
            let attempt = tokio::time::timeout(
                self.config.delivery_timeout,
                self.sink.deliver(conversation, seq, &content),
            )
            .await;
            match attempt {
                Ok(Ok(())) => {
                    buf.next_seq += 1;
                    self.metrics.flush_successes.fetch_add(1, Ordering::Relaxed);
                    flushed = Some(seq);
                }
                _ => {
                    debug!(conversation, seq, "final flush failed, discarding buffer");
                }
            }
        }
        buf.state = StreamState::Closed;
        Ok(flushed)
    }

    /// Synchronously destroy a conversation's buffer. A flush already in
    /// flight completes against the detached buffer and is never resurrected
    /// into a new stream.
    pub fn reset(&self, conversation: &str) -> bool {
        let removed = self.streams.remove(conversation).is_some();
        if removed {
            info!(conversation, "stream buffer reset");
        }
        removed
    }

    /// Number of live stream buffers.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn stream(&self, conversation: &str) -> Arc<ConversationStream> {
        self.streams
            .entry(conversation.to_string())
            .or_insert_with(|| {
                Arc::new(ConversationStream {
                    id: conversation.to_string(),
                    buffer: Mutex::new(StreamBuffer::new()),
                })
            })
            .clone()
    }

    async fn flush_locked(&self, conversation: &str, buf: &mut StreamBuffer) -> Result<u64> {
        buf.state = StreamState::Flushing;
        let content = std::mem::take(&mut buf.content);
        let seq = buf.next_seq;
        let mut retry = RetryState::new(&self.config.retry);

        loop {
            let attempt = tokio::time::timeout(
                self.config.delivery_timeout,
                self.sink.deliver(conversation, seq, &content),
            )
            .await;
            let outcome = match attempt {
                Ok(outcome) => outcome,
                Err(_) => Err(DeliveryError::Transient("delivery timed out".to_string())),
            };

            match outcome {
                Ok(()) => {
                    buf.next_seq += 1;
                    buf.last_flush = Instant::now();
                    buf.state = if buf.content.is_empty() {
                        StreamState::Idle
                    } else {
                        StreamState::Accumulating
                    };
                    self.metrics.flush_successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(seq);
                }
                Err(DeliveryError::Permanent(reason)) => {
                    buf.state = StreamState::Closed;
                    self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(conversation, seq, reason, "permanent delivery failure, closing stream");
                    return Err(CoreError::DeliveryPermanent {
                        conversation: conversation.to_string(),
                        reason,
                    });
                }
                Err(DeliveryError::Transient(reason)) => {
                    match retry.record_failure(&self.config.retry) {
                        Some(delay) => {
                            self.metrics.flush_retries.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                conversation,
                                seq,
                                reason,
                                delay_ms = delay.as_millis() as u64,
                                "transient delivery failure, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            buf.state = StreamState::Closed;
                            self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                conversation,
                                seq,
                                attempts = retry.attempts(),
                                "retry budget exhausted, closing stream"
                            );
                            return Err(CoreError::RetriesExhausted {
                                conversation: conversation.to_string(),
                                attempts: retry.attempts(),
                            });
                        }
                    }
                }
            }
        }
    }
}
