//! Rate-limited output delivery.
//!
//! Each run owns at most one live status message on the gateway side: the
//! first update sends it, later updates edit it in place. Updates are
//! limited to one per run per minimum interval; calls arriving sooner
//! coalesce into the next permitted update (latest text wins) instead of
//! being dropped or queued indefinitely.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{ExecError, ExecResult};
use crate::runner::newest_lines;
use crate::transport::{ChatTransport, MessageId, TransportError};

/// Base delay for the rate-limit backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Delivery attempts before surfacing DeliveryDegraded.
const MAX_ATTEMPTS: u32 = 3;

/// Delivery tunables.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Minimum interval between visible updates per run.
    pub min_interval: Duration,
    /// Transport per-message size limit in bytes.
    pub message_limit: usize,
}

#[derive(Debug, Default)]
struct PublishState {
    message_id: Option<MessageId>,
    last_sent: Option<Instant>,
    pending: Option<String>,
}

/// Rate-limited incremental publisher.
pub struct OutputDelivery {
    transport: Arc<dyn ChatTransport>,
    states: DashMap<i64, PublishState>,
    config: DeliveryConfig,
}

impl OutputDelivery {
    pub fn new(transport: Arc<dyn ChatTransport>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            states: DashMap::new(),
            config,
        }
    }

    /// Publish an incremental status update for a run. Returns without
    /// sending when inside the minimum interval; the text is kept as the
    /// pending update instead.
    pub async fn publish(
        &self,
        run_id: i64,
        conversation_id: &str,
        text: &str,
    ) -> ExecResult<()> {
        let now = Instant::now();
        {
            let mut state = self.states.entry(run_id).or_default();
            if let Some(last) = state.last_sent {
                if now.duration_since(last) < self.config.min_interval {
                    state.pending = Some(text.to_string());
                    return Ok(());
                }
            }
        }
        self.emit(run_id, conversation_id, text).await
    }

    /// Force the final state out: waits out any remaining interval, then
    /// sends the text (or the pending update), chunked when oversized.
    pub async fn flush(
        &self,
        run_id: i64,
        conversation_id: &str,
        text: Option<&str>,
    ) -> ExecResult<()> {
        let final_text = match text {
            Some(t) => Some(t.to_string()),
            None => self
                .states
                .get_mut(&run_id)
                .and_then(|mut s| s.pending.take()),
        };
        let Some(final_text) = final_text else {
            return Ok(());
        };

        // Honor the per-run interval even for the last update.
        let wait = self.states.get(&run_id).and_then(|state| {
            state.last_sent.map(|last| {
                self.config
                    .min_interval
                    .saturating_sub(last.elapsed())
            })
        });
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        if final_text.len() <= self.config.message_limit {
            return self.emit(run_id, conversation_id, &final_text).await;
        }

        // Oversized final output: first chunk replaces the live message,
        // the rest go out as sequential messages.
        let chunks = chunk_lines(&final_text, self.config.message_limit);
        let mut chunks = chunks.into_iter();
        if let Some(first) = chunks.next() {
            self.emit(run_id, conversation_id, &first).await?;
        }
        for chunk in chunks {
            self.retry_send(conversation_id, &chunk, None).await?;
        }
        Ok(())
    }

    /// Send a standalone (non-rate-limited) message, e.g. a prompt with
    /// selectable buttons.
    pub async fn announce(
        &self,
        conversation_id: &str,
        text: &str,
        buttons: Option<&[String]>,
    ) -> ExecResult<MessageId> {
        self.retry_send(conversation_id, text, buttons).await
    }

    /// Drop per-run delivery state once the run is finalized.
    pub fn forget(&self, run_id: i64) {
        self.states.remove(&run_id);
    }

    async fn emit(&self, run_id: i64, conversation_id: &str, text: &str) -> ExecResult<()> {
        let shown = newest_lines(text, self.config.message_limit);
        let existing = self
            .states
            .get(&run_id)
            .and_then(|s| s.message_id.clone());

        let result = match existing {
            Some(ref message_id) => self.retry_edit(message_id, shown).await.map(|_| None),
            None => self
                .retry_send(conversation_id, shown, None)
                .await
                .map(Some),
        };

        let mut state = self.states.entry(run_id).or_default();
        match result {
            Ok(new_id) => {
                if let Some(id) = new_id {
                    state.message_id = Some(id);
                }
                state.last_sent = Some(Instant::now());
                state.pending = None;
                Ok(())
            }
            Err(e) => {
                // The run continues; only the status channel is degraded.
                state.last_sent = Some(Instant::now());
                Err(e)
            }
        }
    }

    async fn retry_send(
        &self,
        conversation_id: &str,
        text: &str,
        buttons: Option<&[String]>,
    ) -> ExecResult<MessageId> {
        let mut delay = BACKOFF_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.send(conversation_id, text, buttons).await {
                Ok(id) => return Ok(id),
                Err(TransportError::RateLimited) if attempt < MAX_ATTEMPTS => {
                    debug!("gateway rate limited send (attempt {attempt}), backing off {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(TransportError::RateLimited) => {
                    warn!("gateway send rate limited after {MAX_ATTEMPTS} attempts");
                    return Err(ExecError::DeliveryDegraded(format!(
                        "rate limited after {MAX_ATTEMPTS} attempts"
                    )));
                }
                Err(e) => return Err(ExecError::DeliveryDegraded(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn retry_edit(&self, message_id: &MessageId, text: &str) -> ExecResult<()> {
        let mut delay = BACKOFF_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.edit(message_id, text).await {
                Ok(()) => return Ok(()),
                Err(TransportError::RateLimited) if attempt < MAX_ATTEMPTS => {
                    debug!("gateway rate limited edit (attempt {attempt}), backing off {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(TransportError::RateLimited) => {
                    warn!("gateway edit rate limited after {MAX_ATTEMPTS} attempts");
                    return Err(ExecError::DeliveryDegraded(format!(
                        "rate limited after {MAX_ATTEMPTS} attempts"
                    )));
                }
                Err(e) => return Err(ExecError::DeliveryDegraded(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }
}

/// Split text into chunks no larger than `limit`, preserving line
/// boundaries where possible. Single lines longer than the limit are
/// split at char boundaries.
pub fn chunk_lines(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > limit {
            let mut rest = line;
            while rest.len() > limit {
                let mut cut = limit;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone)]
    struct Delivered {
        kind: &'static str,
        text: String,
        at: Instant,
    }

    #[derive(Default)]
    struct RecordingTransport {
        delivered: Mutex<Vec<Delivered>>,
        rate_limit_next: AtomicU32,
    }

    impl RecordingTransport {
        fn log(&self) -> Vec<Delivered> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(
            &self,
            _conversation_id: &str,
            text: &str,
            _buttons: Option<&[String]>,
        ) -> Result<MessageId, TransportError> {
            if self.rate_limit_next.load(Ordering::SeqCst) > 0 {
                self.rate_limit_next.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::RateLimited);
            }
            self.delivered.lock().unwrap().push(Delivered {
                kind: "send",
                text: text.to_string(),
                at: Instant::now(),
            });
            Ok("msg-1".to_string())
        }

        async fn edit(
            &self,
            _message_id: &MessageId,
            text: &str,
        ) -> Result<(), TransportError> {
            if self.rate_limit_next.load(Ordering::SeqCst) > 0 {
                self.rate_limit_next.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::RateLimited);
            }
            self.delivered.lock().unwrap().push(Delivered {
                kind: "edit",
                text: text.to_string(),
                at: Instant::now(),
            });
            Ok(())
        }
    }

    fn delivery(transport: Arc<RecordingTransport>) -> OutputDelivery {
        OutputDelivery::new(
            transport,
            DeliveryConfig {
                min_interval: Duration::from_secs(2),
                message_limit: 100,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_next_update() {
        let transport = Arc::new(RecordingTransport::default());
        let delivery = delivery(Arc::clone(&transport));

        delivery.publish(1, "chat-1", "one").await.unwrap();
        delivery.publish(1, "chat-1", "two").await.unwrap();
        delivery.publish(1, "chat-1", "three").await.unwrap();

        // Only the first call went out.
        assert_eq!(transport.log().len(), 1);
        assert_eq!(transport.log()[0].kind, "send");
        assert_eq!(transport.log()[0].text, "one");

        tokio::time::advance(Duration::from_secs(2)).await;
        delivery.publish(1, "chat-1", "four").await.unwrap();

        let log = transport.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].kind, "edit");
        assert_eq!(log[1].text, "four");
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_interval_between_updates() {
        let transport = Arc::new(RecordingTransport::default());
        let delivery = delivery(Arc::clone(&transport));

        for i in 0..50 {
            delivery
                .publish(1, "chat-1", &format!("update {i}"))
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        delivery.flush(1, "chat-1", None).await.unwrap();

        let log = transport.log();
        assert!(log.len() >= 2);
        for pair in log.windows(2) {
            let gap = pair[1].at.duration_since(pair[0].at);
            assert!(gap >= Duration::from_secs(2), "updates {gap:?} apart");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_sends_pending() {
        let transport = Arc::new(RecordingTransport::default());
        let delivery = delivery(Arc::clone(&transport));

        delivery.publish(1, "chat-1", "early").await.unwrap();
        delivery.publish(1, "chat-1", "final state").await.unwrap();
        delivery.flush(1, "chat-1", None).await.unwrap();

        let log = transport.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text, "final state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_then_succeeds() {
        let transport = Arc::new(RecordingTransport::default());
        transport.rate_limit_next.store(2, Ordering::SeqCst);
        let delivery = delivery(Arc::clone(&transport));

        delivery.publish(1, "chat-1", "hello").await.unwrap();
        assert_eq!(transport.log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_degrades() {
        let transport = Arc::new(RecordingTransport::default());
        transport.rate_limit_next.store(3, Ordering::SeqCst);
        let delivery = delivery(Arc::clone(&transport));

        let err = delivery.publish(1, "chat-1", "hello").await.unwrap_err();
        assert!(matches!(err, ExecError::DeliveryDegraded(_)));
        assert!(transport.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_flush_is_chunked() {
        let transport = Arc::new(RecordingTransport::default());
        let delivery = delivery(Arc::clone(&transport));

        let long: String = (0..40).map(|i| format!("line number {i}\n")).collect();
        delivery.flush(1, "chat-1", Some(&long)).await.unwrap();

        let log = transport.log();
        assert!(log.len() > 1);
        for entry in &log {
            assert!(entry.text.len() <= 100);
        }
        let rebuilt: String = log.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(rebuilt, long);
    }

    #[test]
    fn test_chunk_lines_preserves_boundaries() {
        let text = "alpha\nbeta\ngamma\n";
        let chunks = chunk_lines(text, 7);
        assert_eq!(chunks, vec!["alpha\n", "beta\n", "gamma\n"]);
        let chunks = chunk_lines(text, 11);
        assert_eq!(chunks, vec!["alpha\nbeta\n", "gamma\n"]);
    }

    #[test]
    fn test_chunk_lines_hard_splits_long_line() {
        let text = "x".repeat(25);
        let chunks = chunk_lines(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }
}
