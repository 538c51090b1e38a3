//! Prefetching downloader — a bounded-concurrency pipeline that fills a
//! segment-range's segments in order, so a sequential reader never blocks
//! longer than the slowest single-article fetch plus retries.
//!
//! Structured the way the global chunk writer owns its pool file: a single
//! background task (the manager) coordinates state that worker tasks act
//! on, with an `mpsc`-free condition-variable-style wait standing in for
//! the writer's channel, since here the coordination is "don't outrun the
//! consumer" rather than "serialize writes."

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::SegmentCache;
use crate::config::DownloaderConfig;
use crate::error::{ReaderError, Result};
use crate::pool::ArticlePool;
use crate::range::SegmentRange;

struct State {
    range: Arc<SegmentRange>,
    pool: Arc<dyn ArticlePool>,
    cache: Option<Arc<dyn SegmentCache>>,
    config: DownloaderConfig,
    cancel: CancellationToken,
    next_to_download: AtomicUsize,
    scheduler_notify: Notify,
    delivered: AtomicU64,
    total_expected_size: u64,
    pending: Mutex<Option<bytes::Bytes>>,
}

/// Drives prefetch of a single `SegmentRange` and exposes sequential,
/// in-order `read`.
pub struct Downloader {
    state: Arc<State>,
    started: std::sync::atomic::AtomicBool,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Downloader {
    pub fn new(
        range: Arc<SegmentRange>,
        pool: Arc<dyn ArticlePool>,
        cache: Option<Arc<dyn SegmentCache>>,
        config: DownloaderConfig,
        total_expected_size: u64,
    ) -> Arc<Self> {
        let state = Arc::new(State {
            range,
            pool,
            cache,
            config,
            cancel: CancellationToken::new(),
            next_to_download: AtomicUsize::new(0),
            scheduler_notify: Notify::new(),
            delivered: AtomicU64::new(0),
            total_expected_size,
            pending: Mutex::new(None),
        });
        Arc::new(Self {
            state,
            started: std::sync::atomic::AtomicBool::new(false),
            manager: Mutex::new(None),
        })
    }

    /// Pre-warm the scheduler without waiting for the first `read`.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state.clone();
        let handle = tokio::spawn(manager_loop(state));
        *self.manager.lock() = Some(handle);
    }

    /// Read the next chunk of bytes in strict logical order, advancing the
    /// underlying range as segments are exhausted. Returns `Ok(0)` at the
    /// end of the range.
    pub async fn read(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize> {
        self.start();
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut pending = self.state.pending.lock();
                if let Some(bytes) = pending.as_mut() {
                    let n = bytes.remaining().min(buf.len());
                    bytes.copy_to_slice(&mut buf[..n]);
                    let exhausted = !bytes.has_remaining();
                    if exhausted {
                        *pending = None;
                    }
                    drop(pending);
                    self.state.delivered.fetch_add(n as u64, Ordering::Relaxed);
                    if exhausted {
                        // This segment's bytes are fully delivered; advance
                        // the range cursor now so the next call fetches the
                        // following segment instead of re-reading this one.
                        self.advance();
                    }
                    return Ok(n);
                }
            }

            let seg = match self.state.range.get() {
                Some(s) => s,
                None => return Ok(0),
            };

            match seg.handoff.get_reader(&self.state.cancel).await {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        self.advance();
                        continue;
                    }
                    *self.state.pending.lock() = Some(bytes);
                }
                Err(ReaderError::ArticleNotFound { message_id }) => {
                    return Err(ReaderError::CorruptedFile {
                        total_expected_size: self.state.total_expected_size,
                        bytes_already_delivered: self.state.delivered.load(Ordering::Relaxed),
                        source: Box::new(ReaderError::ArticleNotFound { message_id }),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn advance(&self) {
        self.state.range.next();
        self.state.scheduler_notify.notify_waiters();
    }

    /// Cancel the downloader, release every segment (waking any blocked
    /// readers with a closed error), and wait for background tasks to exit.
    /// Idempotent; on timeout the wait is abandoned but state is still
    /// released.
    pub async fn close(&self) {
        self.state.cancel.cancel();
        self.state.range.close_segments();
        self.state.scheduler_notify.notify_waiters();

        let handle = self.manager.lock().take();
        if let Some(handle) = handle {
            let timeout = Duration::from_secs(self.state.config.shutdown_timeout_secs);
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("downloader manager task did not exit within shutdown window");
            }
        }
    }
}

async fn manager_loop(state: Arc<State>) {
    let total = state.range.len();
    let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if state.cancel.is_cancelled() {
            break;
        }
        let next = state.next_to_download.load(Ordering::SeqCst);
        if next >= total {
            break;
        }

        let in_flight = next.saturating_sub(state.range.current_index());
        if in_flight >= state.config.max_prefetch {
            tokio::select! {
                _ = state.scheduler_notify.notified() => {}
                _ = state.cancel.cancelled() => break,
            }
            continue;
        }

        let idx = next;
        state.next_to_download.store(idx + 1, Ordering::SeqCst);

        let worker_state = state.clone();
        worker_handles.push(tokio::spawn(async move {
            fetch_segment(worker_state, idx).await;
        }));

        // Bound the handle list's own growth; reap finished workers
        // opportunistically so Close doesn't have to join thousands of
        // stale JoinHandles for very large files.
        worker_handles.retain(|h| !h.is_finished());
    }

    for h in worker_handles {
        let _ = h.await;
    }
}

async fn fetch_segment(state: Arc<State>, idx: usize) {
    let seg = match state.range.get_segment(idx) {
        Some(s) => s,
        None => return,
    };

    if let Some(cache) = &state.cache {
        if let Some(bytes) = cache.get(&seg.message_id) {
            seg.handoff.set_data(bytes);
            return;
        }
    }

    let attempts = state.config.retry_attempts.max(1);
    for attempt in 1..=attempts {
        if state.cancel.is_cancelled() {
            return;
        }

        let mut buf = Vec::new();
        let timeout = Duration::from_secs(state.config.fetch_timeout_secs);
        let result = tokio::time::timeout(timeout, state.pool.body_stream(&seg.message_id, &mut buf)).await;

        match result {
            Ok(Ok(_n)) => {
                let bytes = bytes::Bytes::from(buf);
                if let Some(cache) = &state.cache {
                    cache.put(&seg.message_id, bytes.clone());
                }
                seg.handoff.set_data(bytes);
                return;
            }
            Ok(Err(e)) if matches!(e, ReaderError::ArticleNotFound { .. }) => {
                seg.handoff.set_error(e);
                return;
            }
            Ok(Err(e)) if matches!(e, ReaderError::DataCorruption { .. }) => {
                seg.handoff.set_error(e);
                return;
            }
            Ok(Err(e)) if !e.is_retriable() => {
                seg.handoff.set_error(e);
                return;
            }
            Ok(Err(e)) => {
                if attempt == attempts {
                    seg.handoff.set_error(e);
                    return;
                }
                debug!(message_id = %seg.message_id, attempt, "transient fetch error, retrying");
                sleep_retry(&state, false).await;
            }
            Err(_elapsed) => {
                if attempt == attempts {
                    seg.handoff.set_error(ReaderError::FetchTimeout(attempts));
                    return;
                }
                sleep_retry(&state, true).await;
            }
        }
    }
}

async fn sleep_retry(state: &Arc<State>, was_timeout: bool) {
    if was_timeout {
        return;
    }
    let delay = Duration::from_millis(state.config.retry_delay_ms);
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = state.cancel.cancelled() => {}
    }
}
