//! Async front over a [`GenerationSession`].
//!
//! The step loop runs on tokio's blocking pool and hands results over a
//! channel of capacity 1. The producer reserves a slot before each step, so
//! at most one chunk is computed ahead of the consumer. A `CancellationToken`
//! unblocks a producer parked on a full channel; the session's `StopHandle`
//! stops it before the next decode.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kotoba_abi::TokenSource;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{GenerationResult, GenerationSession, StopHandle};
use crate::error::{EngineError, Result};
use crate::transcript::SharedTranscript;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AsyncSession<S: TokenSource + Send + 'static> {
    inner: Arc<Mutex<GenerationSession<S>>>,
    stop: StopHandle,
    transcript: SharedTranscript,
    running: Mutex<Option<Running>>,
}

impl<S: TokenSource + Send + 'static> AsyncSession<S> {
    pub fn new(session: GenerationSession<S>) -> Self {
        let stop = session.stop_handle();
        let transcript = session.shared_transcript();
        Self {
            inner: Arc::new(Mutex::new(session)),
            stop,
            transcript,
            running: Mutex::new(None),
        }
    }

    /// Start a generation on `prompt`. Any previous generation is aborted and
    /// awaited first. Errors from `start` are returned here; step errors
    /// arrive as the stream's last item.
    pub async fn send(&self, prompt: impl Into<String>) -> Result<GenerationStream> {
        self.abort_running().await;

        let prompt = prompt.into();
        let (tx, rx) = mpsc::channel(1);
        let (started_tx, started_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();

        let task = tokio::task::spawn_blocking(move || {
            let handle = Handle::current();
            let mut session = lock(&inner);
            let mut generation = match session.send(&prompt) {
                Ok(generation) => {
                    let _ = started_tx.send(Ok(()));
                    generation
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e));
                    return;
                }
            };

            loop {
                // Reserve before stepping: one chunk ahead of the consumer, no more.
                let permit = handle.block_on(async {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        permit = tx.reserve() => permit.ok(),
                    }
                });
                let Some(permit) = permit else {
                    tracing::info!("[stream] consumer gone or cancelled; aborting");
                    break;
                };
                match generation.next() {
                    Some(item) => permit.send(item),
                    None => break,
                }
            }
        });

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = task.await;
                return Err(e);
            }
            Err(_) => {
                let _ = task.await;
                return Err(EngineError::Decode(
                    "generation task ended before starting".into(),
                ));
            }
        }

        *lock(&self.running) = Some(Running {
            cancel: cancel.clone(),
            task,
        });
        Ok(GenerationStream { rx, cancel })
    }

    /// Cancel the active generation (if any), wait for it, and clear the
    /// backend context.
    pub async fn abort(&self) {
        self.abort_running().await;
        self.with_session(|s| s.abort()).await;
    }

    /// Abort and discard the transcript; also leaves the errored state.
    pub async fn reset(&self) {
        self.abort_running().await;
        self.with_session(|s| s.reset()).await;
    }

    /// Reset and rebuild the backend context.
    pub async fn reinitialize(&self) -> Result<()> {
        self.abort_running().await;
        self.with_session(|s| s.reinitialize()).await
    }

    /// Text emitted since the last reset. Readable while a generation runs.
    pub fn transcript(&self) -> String {
        self.transcript.text()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    async fn abort_running(&self) {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };
        self.stop.cancel();
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::warn!("[abort] generation task failed: {e}");
        }
    }

    async fn with_session<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut GenerationSession<S>) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || f(&mut *lock(&inner))).await {
            Ok(v) => v,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

/// Receiving end of one async generation.
pub struct GenerationStream {
    rx: mpsc::Receiver<Result<GenerationResult>>,
    cancel: CancellationToken,
}

impl GenerationStream {
    /// Next step result; `None` once the generation is over or cancelled.
    pub async fn next(&mut self) -> Option<Result<GenerationResult>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop the producer. Buffered items are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            match item? {
                GenerationResult::TextChunk(chunk) => text.push_str(&chunk),
                GenerationResult::EndOfGeneration => break,
            }
        }
        Ok(text)
    }
}
