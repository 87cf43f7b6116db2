//! Synthesized-audio playback queue with barge-in.
//!
//! ## Ordering
//!
//! `enqueue`, `clear` and dequeue all take the same `parking_lot::Mutex`, so
//! an enqueue racing a clear lands strictly before it (and is discarded) or
//! strictly after it (and is retained). `clear` bumps an abort epoch while
//! still holding the lock; every dequeued chunk carries the epoch it was
//! dequeued under, so the renderer can tell when the chunk it is playing was
//! cancelled.
//!
//! ```text
//! event loop ── enqueue ──► VecDeque ── next_chunk ──► renderer ──► PlaybackSink
//!            └─ clear ───► epoch += 1 ── watch ───────► abort in-flight chunk
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// One buffer of synthesized audio, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackChunk {
    /// Ordinal position in the stream of enqueued chunks.
    pub seq: u64,
    pub data: Vec<u8>,
}

/// A chunk handed to the renderer, tagged with the abort epoch it was
/// dequeued under.
#[derive(Debug, Clone)]
pub struct QueuedChunk {
    pub chunk: PlaybackChunk,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<PlaybackChunk>,
    next_seq: u64,
    epoch: u64,
}

/// FIFO of playback chunks shared by the event loop and an external renderer.
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    available: Notify,
    abort_tx: watch::Sender<u64>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        let (abort_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            abort_tx,
        }
    }

    /// Append audio to the tail. Empty buffers are ignored.
    ///
    /// Returns the chunk's ordinal, or `None` when nothing was queued.
    pub fn enqueue(&self, data: Vec<u8>) -> Option<u64> {
        if data.is_empty() {
            return None;
        }
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.chunks.push_back(PlaybackChunk { seq, data });
            seq
        };
        self.available.notify_one();
        Some(seq)
    }

    /// Discard every queued chunk and signal the renderer to stop whatever
    /// is sounding. Returns the number of discarded chunks.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.chunks.len();
        state.chunks.clear();
        state.epoch += 1;
        // Published under the lock: a chunk dequeued before this point always
        // observes the new epoch as an abort.
        self.abort_tx.send_replace(state.epoch);
        debug!(discarded, epoch = state.epoch, "playback cleared");
        discarded
    }

    /// Pop the head chunk without waiting.
    pub fn try_next(&self) -> Option<QueuedChunk> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        state
            .chunks
            .pop_front()
            .map(|chunk| QueuedChunk { chunk, epoch })
    }

    /// Wait for the next chunk. Intended for a single renderer.
    pub async fn next_chunk(&self) -> QueuedChunk {
        loop {
            if let Some(queued) = self.try_next() {
                return queued;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }

    /// Current abort epoch (number of clears so far).
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Receiver that changes every time `clear` runs.
    pub fn subscribe_aborts(&self) -> watch::Receiver<u64> {
        self.abort_tx.subscribe()
    }
}

/// Destination that actually sounds audio (speaker, file, test recorder).
#[async_trait]
pub trait PlaybackSink: Send {
    /// Play one chunk to completion. May be dropped mid-way on abort.
    async fn play(&mut self, chunk: &PlaybackChunk) -> Result<()>;

    /// Silence any audio the sink is still sounding or has buffered.
    async fn stop(&mut self);
}

enum Step {
    Cancelled,
    Aborted,
    Chunk(QueuedChunk),
}

enum Played {
    Finished,
    Aborted,
    Cancelled,
}

/// Drain `queue` into `sink` until `cancel` fires. Returns the sink.
pub fn spawn_renderer<S>(
    queue: Arc<PlaybackQueue>,
    mut sink: S,
    cancel: CancellationToken,
) -> JoinHandle<S>
where
    S: PlaybackSink + 'static,
{
    tokio::spawn(async move {
        let mut aborts = queue.subscribe_aborts();
        let mut played = 0u64;
        let mut aborted = 0u64;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                changed = aborts.changed() => match changed {
                    Ok(()) => Step::Aborted,
                    Err(_) => Step::Cancelled,
                },
                queued = queue.next_chunk() => Step::Chunk(queued),
            };

            let queued = match step {
                Step::Cancelled => break,
                Step::Aborted => {
                    let _ = aborts.borrow_and_update();
                    sink.stop().await;
                    aborted += 1;
                    continue;
                }
                Step::Chunk(queued) => queued,
            };

            if queued.epoch < *aborts.borrow() {
                debug!(seq = queued.chunk.seq, "dropping chunk cancelled before playback");
                continue;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Played::Cancelled,
                _ = aborted_after(&mut aborts, queued.epoch) => Played::Aborted,
                res = sink.play(&queued.chunk) => {
                    if let Err(e) = res {
                        warn!(seq = queued.chunk.seq, error = %e, "playback chunk failed");
                    }
                    Played::Finished
                }
            };

            match outcome {
                Played::Finished => played += 1,
                Played::Aborted => {
                    sink.stop().await;
                    aborted += 1;
                }
                Played::Cancelled => {
                    sink.stop().await;
                    break;
                }
            }
        }

        info!(played, aborted, "playback renderer stopped");
        sink
    })
}

/// Resolves once the abort epoch moves past `epoch`.
async fn aborted_after(aborts: &mut watch::Receiver<u64>, epoch: u64) {
    let closed = aborts.wait_for(|current| *current > epoch).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
