//! Per-link operation queue.
//!
//! GATT operations on one link cannot overlap, so every write funnels
//! through this queue: two FIFO lanes (control and audio), one op in flight,
//! and a watchdog that fails the link when a single op stalls. Audio
//! admission is bounded and head-drops the oldest frame on overflow —
//! freshness beats completeness for voice. Control drains first, except
//! that after a burst of consecutive control ops one waiting audio op is
//! forced through so voice never starves under handshake or topology churn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::link::{DataType, LinkError};

/// Knobs of one operation queue, copied from `MeshConfig` at link setup.
#[derive(Debug, Clone)]
pub struct OpQueueConfig {
    /// Audio lane depth; overflow head-drops the oldest frame.
    pub audio_capacity: usize,
    /// Consecutive control ops after which one audio op is forced.
    pub starvation_threshold: u32,
    /// Watchdog on a single in-flight operation.
    pub op_timeout: Duration,
}

/// Executes one queued operation against the physical link.
///
/// `execute` resolving is the transport layer's completion signal; the
/// queue keeps exactly one call in flight.
#[async_trait]
pub trait OpExecutor: Send + Sync + 'static {
    /// Performs the write. Resolves when the link layer accepted the frame.
    async fn execute(&self, frame: Bytes, data_type: DataType) -> Result<(), LinkError>;

    /// Called once when the watchdog fires; must cancel the link.
    async fn on_stall(&self);
}

struct Lanes {
    control: VecDeque<Bytes>,
    audio: VecDeque<Bytes>,
    consecutive_control: u32,
    audio_dropped: u64,
    closed: bool,
}

struct Shared {
    config: OpQueueConfig,
    lanes: Mutex<Lanes>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Shared {
    /// Pops the next operation under the scheduling rule.
    fn next_op(&self) -> Option<(Bytes, DataType)> {
        let mut lanes = self.lanes.lock();
        let force_audio = lanes.consecutive_control >= self.config.starvation_threshold
            && !lanes.audio.is_empty();
        if !force_audio {
            if let Some(frame) = lanes.control.pop_front() {
                lanes.consecutive_control += 1;
                return Some((frame, DataType::Control));
            }
        }
        if let Some(frame) = lanes.audio.pop_front() {
            lanes.consecutive_control = 0;
            return Some((frame, DataType::Audio));
        }
        None
    }
}

/// Dual-lane serializer for one link's GATT operations.
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    /// Creates an idle queue; call [`start`](Self::start) to begin draining.
    #[must_use]
    pub fn new(config: OpQueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                lanes: Mutex::new(Lanes {
                    control: VecDeque::new(),
                    audio: VecDeque::new(),
                    consecutive_control: 0,
                    audio_dropped: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the drain worker. One worker per queue.
    pub fn start(&self, executor: Arc<dyn OpExecutor>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = shared.notify.notified() => {}
                }
                while let Some((frame, data_type)) = shared.next_op() {
                    match timeout(shared.config.op_timeout, executor.execute(frame, data_type)).await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::debug!("[OpQueue] Write failed, closing link: {err}");
                            close_shared(&shared);
                            return;
                        }
                        Err(_) => {
                            log::warn!(
                                "[OpQueue] Operation exceeded {:?}, cancelling link",
                                shared.config.op_timeout
                            );
                            close_shared(&shared);
                            executor.on_stall().await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Queues a frame. Control is unbounded; audio head-drops on overflow.
    pub fn enqueue(&self, frame: Bytes, data_type: DataType) -> Result<(), LinkError> {
        {
            let mut lanes = self.shared.lanes.lock();
            if lanes.closed {
                return Err(LinkError::LinkClosed);
            }
            match data_type {
                DataType::Control => lanes.control.push_back(frame),
                DataType::Audio => {
                    if lanes.audio.len() >= self.shared.config.audio_capacity {
                        lanes.audio.pop_front();
                        lanes.audio_dropped += 1;
                        log::trace!("[OpQueue] Audio lane full, dropped oldest frame");
                    }
                    lanes.audio.push_back(frame);
                }
            }
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Closes the queue; pending ops are discarded and the worker exits.
    pub fn close(&self) {
        close_shared(&self.shared);
    }

    /// True once the queue has been closed (locally or by the watchdog).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lanes.lock().closed
    }

    /// Audio frames dropped to head-drop admission so far.
    #[must_use]
    pub fn audio_dropped(&self) -> u64 {
        self.shared.lanes.lock().audio_dropped
    }
}

fn close_shared(shared: &Shared) {
    {
        let mut lanes = shared.lanes.lock();
        lanes.closed = true;
        lanes.control.clear();
        lanes.audio.clear();
    }
    shared.cancel.cancel();
}
