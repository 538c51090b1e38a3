//! Segment primitive — a single-assignment data/error handoff slot with
//! multi-reader blocking semantics and cancellation.
//!
//! Mirrors the "single mutex plus one wake signal" shape used for the
//! global writer's resource handoff, generalized from a single consumer to
//! any number of waiting readers via `Notify::notify_waiters`.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ReaderError, Result};

#[derive(Clone)]
enum State {
    Pending,
    Data(Bytes),
    Error(Arc<ReaderError>),
    Released,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// A one-shot handoff slot for one segment's bytes (or its terminal error).
#[derive(Clone)]
pub struct Segment {
    inner: Arc<Inner>,
    /// Inclusive usable range within the recorded buffer.
    start_offset: u64,
    end_offset: u64,
}

impl Segment {
    pub fn new(start_offset: u64, end_offset: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                notify: Notify::new(),
            }),
            start_offset,
            end_offset,
        }
    }

    /// Record the fetched bytes. Idempotent after the first call; a no-op
    /// if the segment has already been released. Wakes all waiters.
    pub fn set_data(&self, bytes: Bytes) {
        let mut state = self.inner.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Data(bytes);
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Record the first error. Subsequent errors are discarded. Wakes all
    /// waiters.
    pub fn set_error(&self, err: ReaderError) {
        let mut state = self.inner.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Error(Arc::new(err));
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Free the buffer for garbage collection. Any waiter still blocked is
    /// woken with a closed error. Idempotent.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        if !matches!(*state, State::Released) {
            *state = State::Released;
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Block until data or an error is recorded, or `cancel` fires first.
    ///
    /// Cancellation does not permanently poison the slot — a later call
    /// with a fresh, live token may still succeed. A recorded error is
    /// permanent.
    pub async fn get_reader(&self, cancel: &CancellationToken) -> Result<Bytes> {
        loop {
            // Registered before the state check (and before it is polled),
            // per `Notify::notified`'s documented pattern, so a
            // `notify_waiters` call that lands between the check below and
            // the first poll of this future still wakes us instead of being
            // missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            {
                let state = self.inner.state.lock();
                match &*state {
                    State::Data(bytes) => {
                        let start = self.start_offset as usize;
                        let end = (self.end_offset as usize).min(bytes.len().saturating_sub(1));
                        if start > end || bytes.is_empty() {
                            return Ok(Bytes::new());
                        }
                        return Ok(bytes.slice(start..=end));
                    }
                    State::Error(e) => return Err(clone_error(e)),
                    State::Released => return Err(ReaderError::Closed),
                    State::Pending => {}
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Pending)
    }
}

fn clone_error(e: &Arc<ReaderError>) -> ReaderError {
    match e.as_ref() {
        ReaderError::ArticleNotFound { message_id } => {
            ReaderError::ArticleNotFound { message_id: message_id.clone() }
        }
        ReaderError::DataCorruption { reason } => {
            ReaderError::DataCorruption { reason: reason.clone() }
        }
        other => ReaderError::Transient(other.to_string()),
    }
}
