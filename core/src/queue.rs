//! Blocking completion queue.
//!
//! Batches post exactly one completion event when they finish; drivers
//! block on [`CompletionQueue::next`] with a bounded deadline and dispatch
//! on the tag. Timeouts are benign and let the driver run its own checks
//! between waits.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

/// Caller-chosen batch identifier.
pub type Tag = u64;

/// Outcome of one wait on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A batch finished. `success` is false when the batch failed at the
    /// transport level; receive slots hold whatever was filled before the
    /// failure.
    Op { tag: Tag, success: bool },
    /// The deadline passed with no completion.
    Timeout,
    /// The queue is shut down and drained.
    Shutdown,
}

struct Completion {
    tag: Tag,
    success: bool,
}

/// Producer half handed to batches.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Post a completion. Posting to a dropped queue is a no-op: the
    /// driver has already stopped listening.
    pub fn complete(&self, tag: Tag, success: bool) {
        let _ = self.tx.send(Completion { tag, success });
    }
}

/// Consumer half owned by the driving thread.
pub struct CompletionQueue {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    shutdown: bool,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            shutdown: false,
        }
    }

    /// A sender for batches completing onto this queue.
    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next event, at most `timeout`.
    ///
    /// After [`shutdown`](Self::shutdown), queued completions drain first
    /// and then every call returns [`Event::Shutdown`].
    pub fn next(&mut self, timeout: Duration) -> Event {
        if self.shutdown {
            return match self.rx.try_recv() {
                Ok(c) => Event::Op {
                    tag: c.tag,
                    success: c.success,
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Event::Shutdown,
            };
        }
        match self.rx.recv_timeout(timeout) {
            Ok(c) => Event::Op {
                tag: c.tag,
                success: c.success,
            },
            Err(RecvTimeoutError::Timeout) => Event::Timeout,
            Err(RecvTimeoutError::Disconnected) => Event::Shutdown,
        }
    }

    /// Wait until `deadline` for the next event.
    pub fn next_before(&mut self, deadline: Instant) -> Event {
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() && !self.shutdown {
            // Deadline already passed; still take anything queued.
            return match self.rx.try_recv() {
                Ok(c) => Event::Op {
                    tag: c.tag,
                    success: c.success,
                },
                Err(_) => Event::Timeout,
            };
        }
        self.next(timeout)
    }

    /// Begin shutdown. Events already posted remain retrievable.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }
}
