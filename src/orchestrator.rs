//! Fan-out orchestration: one adapter stream per configured model, merged
//! into a single consumer-driven event stream.
//!
//! A bounded queue (capacity 4×N) receives events from all adapter tasks;
//! the consumer drains FIFO. Per-model ordering is preserved because a
//! single producer task writes each model's events in order; a slow SSE
//! client throttles the adapters once the queue saturates. A dedicated
//! task emits `heartbeat` every 10 seconds while any adapter is running.
//!
//! After every adapter task terminates (success, error or cancellation),
//! the partial assistant turn it accumulated is committed to that model's
//! history under the session lock, so follow-up turns stay coherent.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::adapter::{stream_generation, ModelBackend, TurnAccumulator};
use crate::error::ApiError;
use crate::events::StreamEvent;
use crate::history::Turn;
use crate::session::Session;
use crate::tools::ToolRegistry;

/// Default heartbeat cadence while a stream is open.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle handle for one generation.
///
/// `cancel` propagates cooperative cancellation to every model task;
/// `done` resolves once all tasks have reached a terminal state. Both are
/// idempotent.
#[derive(Clone, Default)]
pub struct GenerationHandle {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl GenerationHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cooperative cancellation of every model task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the adapter tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves when all tasks have terminated.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    fn mark_done(&self) {
        self.done.cancel();
    }
}

/// Launches and supervises the per-model adapter streams for a session.
pub struct Orchestrator {
    backends: Vec<Arc<dyn ModelBackend>>,
    registry: ToolRegistry,
    deadline: Duration,
    heartbeat_interval: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        backends: Vec<Arc<dyn ModelBackend>>,
        registry: ToolRegistry,
        deadline: Duration,
    ) -> Self {
        Self {
            backends,
            registry,
            deadline,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Override the heartbeat cadence (used by tests).
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Start a generation on `session`, returning its handle and the
    /// merged event stream. Fails with `BusySession` if a generation is
    /// already active.
    pub fn begin(
        &self,
        session: &Session,
    ) -> Result<(GenerationHandle, impl Stream<Item = StreamEvent> + Send + use<>), ApiError> {
        let handle = GenerationHandle::new();
        session.begin_generation(handle.clone())?;

        info!(
            session_id = %session.id(),
            models = self.backends.len(),
            "starting generation"
        );

        let capacity = (4 * self.backends.len()).max(4);
        let (tx, rx) = mpsc::channel::<StreamEvent>(capacity);

        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            let model_id = backend.model_id().to_string();
            let transcript = TurnAccumulator::new();
            let events = stream_generation(
                Arc::clone(backend),
                session.history(&model_id),
                self.registry.clone(),
                self.deadline,
                handle.cancel_token(),
                transcript.clone(),
            );

            let tx = tx.clone();
            let session = session.clone();
            let span =
                tracing::info_span!("generation", session_id = %session.id(), model_id = %model_id);
            tasks.spawn(
                async move {
                    futures::pin_mut!(events);
                    while let Some(event) = events.next().await {
                        if tx.send(event).await.is_err() {
                            // Consumer is gone; the adapter stops at its next
                            // cancellation check.
                            break;
                        }
                    }
                    // Commit whatever partial assistant content was produced,
                    // keeping the turn alternation intact even on error.
                    session.commit_assistant(&model_id, Turn::assistant(transcript.take()));
                    debug!("model task finished");
                }
                .instrument(span),
            );
        }

        // Heartbeat while any adapter task is still running.
        let hb_tx = tx.clone();
        let hb_done = handle.done.clone();
        let hb_interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(hb_interval);
            tick.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    () = hb_done.cancelled() => break,
                    _ = tick.tick() => {
                        if hb_tx.send(StreamEvent::heartbeat()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Supervisor: when the last task terminates, free the session and
        // close the queue so the SSE emitter ends the response.
        let sup_session = session.clone();
        let sup_handle = handle.clone();
        tokio::spawn(async move {
            while tasks.join_next().await.is_some() {}
            sup_session.finish_generation();
            sup_handle.mark_done();
            info!(session_id = %sup_session.id(), "generation finished");
            drop(tx);
        });

        let output = drain_receiver(rx);
        Ok((handle, output))
    }

    /// Cancel the session's active generation, returning after all adapter
    /// tasks have stopped. Idempotent; returns `false` when no generation
    /// was active.
    pub async fn cancel(&self, session: &Session) -> bool {
        let Some(handle) = session.active_generation() else {
            return false;
        };
        info!(session_id = %session.id(), "cancelling generation");
        handle.cancel();
        handle.done().await;
        true
    }
}

fn drain_receiver(
    mut rx: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}
