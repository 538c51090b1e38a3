//! Virtual file handle — the `Read`/`ReadAt`/`Seek`/`Close` façade in front
//! of the downloader, nested composer and decryption adapters.
//!
//! Realized as async inherent methods rather than `std::io::{Read, Seek}`
//! impls, since every fetch down the stack is itself async — the same
//! choice `camera.rs` makes for its GStreamer-backed stream rather than
//! wrapping a blocking trait around inherently async I/O.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::SegmentCache;
use crate::config::DownloaderConfig;
use crate::decrypt;
use crate::downloader::Downloader;
use crate::error::{ReaderError, Result};
use crate::health::{self, HealthStore};
use crate::meta::{Encryption, FileDescriptor};
use crate::nested::NestedComposer;
use crate::pool::ArticlePool;
use crate::range::{SegmentOffsetIndex, SegmentRange};
use crate::store::MetadataStore;

/// Optional per-read override, analogous to an HTTP `Range:` header or a
/// caller-supplied max-prefetch, carried alongside the read call rather
/// than through a Go-style `context.Context` (Rust has no ambient-context
/// equivalent, so the hint is a plain argument instead).
#[derive(Debug, Clone, Default)]
pub struct ReadHint {
    /// Inclusive end of the byte range to fetch, overriding "to end of
    /// file". The effective start is always the handle's current position.
    pub range_end: Option<u64>,
    pub max_prefetch: Option<usize>,
    pub source_tag: Option<String>,
    /// Forces permission-denied even on nominally-readable operations;
    /// consumed by front-ends that implement "copy" semantics over a
    /// read-only filesystem. The read path itself never needs to act on
    /// this beyond rejecting writes, which it already always does.
    pub copy_operation: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub corrupted: bool,
}

enum Stack {
    Empty,
    Plain(Arc<Downloader>),
    /// A fully decrypted buffer for the requested range. The two
    /// decryption adapters operate on a whole byte window rather than a
    /// byte stream, so there is nothing to do here but serve from memory —
    /// the same shape `NestedComposer`'s `CurrentSource::Decrypted` uses
    /// per inner source.
    Decrypted { bytes: Bytes, pos: usize },
    Nested(NestedComposer),
}

impl Stack {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Stack::Empty => Ok(0),
            Stack::Plain(dl) => dl.read(buf).await,
            Stack::Decrypted { bytes, pos } => {
                if *pos >= bytes.len() {
                    return Ok(0);
                }
                let n = (bytes.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Stack::Nested(composer) => composer.read(buf).await,
        }
    }

    async fn close(self) {
        match self {
            Stack::Plain(dl) => dl.close().await,
            Stack::Nested(composer) => composer.close().await,
            Stack::Empty | Stack::Decrypted { .. } => {}
        }
    }
}

struct SequentialState {
    position: u64,
    /// The end the caller most recently requested for the attached reader
    /// stack, or `-1` for unbounded ("to end of file"). Used to decide
    /// whether an EOF from the stack should transparently refresh the
    /// reader (adapter-internal framing) or is the true end of the range.
    original_range_end: i64,
    stack: Option<Stack>,
}

/// Stateful front-end over one virtual file's segment list, presenting
/// both sequential (`read`/`seek`) and concurrent random-access
/// (`read_at`) semantics.
pub struct VirtualFile {
    path: String,
    metadata: Arc<dyn MetadataStore>,
    health: Arc<dyn HealthStore>,
    pool: Arc<dyn ArticlePool>,
    cache: Option<Arc<dyn SegmentCache>>,
    config: DownloaderConfig,
    descriptor: FileDescriptor,
    /// Lazily built on first read, per spec.md §3's "built lazily on first
    /// read" — guarded by a plain sync mutex since building it never
    /// suspends.
    index: SyncMutex<Option<Arc<SegmentOffsetIndex>>>,
    seq: AsyncMutex<SequentialState>,
}

impl VirtualFile {
    /// Resolve `virtual_path` to its descriptor and open a handle over it.
    /// The descriptor is a snapshot: later mutations to the backing
    /// metadata record (other than those this handle itself makes through
    /// the health hook) are not observed.
    pub fn open(
        virtual_path: impl Into<String>,
        metadata: Arc<dyn MetadataStore>,
        health: Arc<dyn HealthStore>,
        pool: Arc<dyn ArticlePool>,
        cache: Option<Arc<dyn SegmentCache>>,
        config: DownloaderConfig,
    ) -> Result<Self> {
        let path = virtual_path.into();
        let descriptor = metadata.read_descriptor(&path)?;
        Ok(Self {
            path,
            metadata,
            health,
            pool,
            cache,
            config,
            descriptor,
            index: SyncMutex::new(None),
            seq: AsyncMutex::new(SequentialState {
                position: 0,
                original_range_end: -1,
                stack: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.path
    }

    pub fn stat(&self) -> FileStat {
        FileStat { size: self.descriptor.size, corrupted: self.descriptor.is_corrupted() }
    }

    /// Whether repeated streaming failures have tripped masking for this
    /// path. The read path itself never consults this mid-stream — only
    /// the stat/readdir surface a front-end builds on top of it would.
    pub fn is_masked(&self) -> bool {
        self.health.is_masked(&self.path)
    }

    fn offset_index(&self) -> Arc<SegmentOffsetIndex> {
        let mut guard = self.index.lock();
        if let Some(idx) = guard.as_ref() {
            return idx.clone();
        }
        let built = Arc::new(SegmentOffsetIndex::build(&self.descriptor.segments));
        *guard = Some(built.clone());
        built
    }

    /// Read the next chunk of bytes starting at the handle's current
    /// position, advancing it. On the first call after open or after a
    /// position-changing seek, builds the reader stack for
    /// `[position, effective_end]`. Returns `Ok(0)` at true end of file.
    pub async fn read(&self, buf: &mut [u8], hint: Option<&ReadHint>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.seq.lock().await;

        if state.stack.is_none() {
            if state.position >= self.descriptor.size {
                return Ok(0);
            }
            let requested_end = hint.and_then(|h| h.range_end);
            let end = requested_end.unwrap_or(self.descriptor.size.saturating_sub(1));
            let end = end.min(self.descriptor.size.saturating_sub(1));
            state.original_range_end = if requested_end.is_some() { end as i64 } else { -1 };
            let stack = self.build_stack(state.position, end).await?;
            state.stack = Some(stack);
        }

        loop {
            let read_result = state.stack.as_mut().unwrap().read(buf).await;
            match read_result {
                Ok(0) => {
                    let refresh_end = state.original_range_end;
                    let below_logical_end =
                        refresh_end < 0 && state.position < self.descriptor.size;
                    let below_requested_end =
                        refresh_end >= 0 && (state.position as i64) < refresh_end;
                    if below_logical_end || below_requested_end {
                        // The stack reported EOF before the logical end —
                        // adapter-internal framing, not a terminal
                        // condition. Build the next reader transparently.
                        if let Some(old) = state.stack.take() {
                            old.close().await;
                        }
                        let end = if refresh_end >= 0 {
                            refresh_end as u64
                        } else {
                            self.descriptor.size.saturating_sub(1)
                        };
                        let stack = self.build_stack(state.position, end).await?;
                        state.stack = Some(stack);
                        continue;
                    }
                    return Ok(0);
                }
                Ok(n) => {
                    state.position += n as u64;
                    return Ok(n);
                }
                Err(err @ ReaderError::CorruptedFile { .. }) => {
                    self.report_corruption(&err).await;
                    return Err(err);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `SeekStart | SeekCurrent | SeekEnd` semantics. Negative absolute
    /// positions and positions beyond file size error synchronously,
    /// without touching the downloader. A position-changing seek detaches
    /// the current reader stack and closes it in the background —
    /// downloaders are forward-only, so tearing one down and building a
    /// fresh one at the target offset is cheaper than discarding bytes.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut state = self.seq.lock().await;
        let candidate: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => state.position as i64 + d,
            SeekFrom::End(d) => self.descriptor.size as i64 + d,
        };
        if candidate < 0 {
            return Err(ReaderError::InvalidSeek("negative position".into()));
        }
        let candidate = candidate as u64;
        if candidate > self.descriptor.size {
            return Err(ReaderError::InvalidSeek(format!(
                "position {candidate} beyond file size {}",
                self.descriptor.size
            )));
        }

        if candidate != state.position {
            if let Some(stack) = state.stack.take() {
                tokio::spawn(stack.close());
            }
            state.original_range_end = -1;
        }
        state.position = candidate;
        Ok(candidate)
    }

    /// Concurrent-safe, stateless with respect to `position`: builds an
    /// independent reader stack for `[offset, offset+buf.len()-1]`, reads
    /// with a cancellation-aware `read_full`, and closes the stack before
    /// returning. Deliberately avoids the sequential-state lock so callers
    /// can issue overlapping `read_at`s without blocking each other.
    pub async fn read_at(
        &self,
        offset: u64,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if buf.is_empty() || offset >= self.descriptor.size {
            return Ok(0);
        }
        let wanted = buf.len() as u64;
        let end = (offset + wanted - 1).min(self.descriptor.size - 1);
        let total = (end - offset + 1) as usize;

        let mut stack = self.build_stack(offset, end).await?;
        let mut filled = 0usize;
        let result = loop {
            if filled >= total {
                break Ok(filled);
            }
            tokio::select! {
                res = stack.read(&mut buf[filled..total]) => {
                    match res {
                        Ok(0) => break Ok(filled),
                        Ok(n) => filled += n,
                        Err(e) => break Err(e),
                    }
                }
                _ = cancel.cancelled() => break Err(ReaderError::Cancelled),
            }
        };

        if let Err(err @ ReaderError::CorruptedFile { .. }) = &result {
            self.report_corruption(err).await;
        }
        stack.close().await;
        result
    }

    /// Idempotent: releases the currently attached reader stack, if any.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.seq.lock().await;
        if let Some(stack) = state.stack.take() {
            stack.close().await;
        }
        Ok(())
    }

    /// Always permission-denied — there is no write path for virtual
    /// files.
    pub async fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(ReaderError::PermissionDenied(self.path.clone()))
    }

    pub async fn write_string(&self, _s: &str) -> Result<usize> {
        Err(ReaderError::PermissionDenied(self.path.clone()))
    }

    pub async fn truncate(&self, _size: u64) -> Result<()> {
        Err(ReaderError::PermissionDenied(self.path.clone()))
    }

    async fn build_stack(&self, start: u64, end: u64) -> Result<Stack> {
        if end < start || start >= self.descriptor.size {
            return Ok(Stack::Empty);
        }

        if !self.descriptor.nested_sources.is_empty() {
            return Ok(Stack::Nested(NestedComposer::new(
                self.descriptor.nested_sources.clone(),
                start,
                end,
                self.pool.clone(),
                self.cache.clone(),
                self.config.clone(),
            )));
        }

        match self.descriptor.encryption_kind() {
            Encryption::None => {
                let range = Arc::new(self.make_range(start, end));
                let total = end - start + 1;
                Ok(Stack::Plain(Downloader::new(
                    range,
                    self.pool.clone(),
                    self.cache.clone(),
                    self.config.clone(),
                    total,
                )))
            }
            Encryption::PasswordDerived => {
                let fetch = self.make_fetch();
                let bytes = decrypt::open_password_derived(
                    &self.descriptor.password,
                    &self.descriptor.salt,
                    start,
                    end,
                    fetch,
                )
                .await?;
                Ok(Stack::Decrypted { bytes, pos: 0 })
            }
            Encryption::AesCbc => {
                let fetch = self.make_fetch();
                let bytes = decrypt::open_aes_cbc(
                    &self.descriptor.aes_key,
                    &self.descriptor.aes_iv,
                    start,
                    end,
                    fetch,
                )
                .await?;
                Ok(Stack::Decrypted { bytes, pos: 0 })
            }
        }
    }

    fn make_range(&self, start: u64, end: u64) -> SegmentRange {
        let index = self.offset_index();
        SegmentRange::new(&self.descriptor.segments, &index, start, end, None, None)
    }

    /// A `decrypt::Fetch` that drives a fresh downloader over the exact
    /// ciphertext window an adapter asks for, buffers it fully (the
    /// adapters operate on whole ranges, not streams), and tears the
    /// downloader down before returning. Mirrors
    /// `NestedComposer::source_fetch`, generalized from one inner source's
    /// segments to the file's own top-level segment list.
    fn make_fetch(&self) -> decrypt::Fetch {
        let segments = self.descriptor.segments.clone();
        let index = self.offset_index();
        let pool = self.pool.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();

        Arc::new(move |start: u64, end: u64| {
            let segments = segments.clone();
            let index = index.clone();
            let pool = pool.clone();
            let cache = cache.clone();
            let config = config.clone();
            Box::pin(async move {
                let range = Arc::new(SegmentRange::new(&segments, &index, start, end, None, None));
                let total = (end - start + 1) as usize;
                let dl = Downloader::new(range, pool, cache, config, total as u64);

                let mut out = vec![0u8; total];
                let mut filled = 0usize;
                while filled < total {
                    let n = dl.read(&mut out[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                dl.close().await;
                out.truncate(filled);
                Ok(Bytes::from(out))
            })
        })
    }

    /// Synchronously update the descriptor and health store on a fatal
    /// streaming error, bounded so a slow metadata write never blocks the
    /// stream longer than `health_timeout_secs`.
    async fn report_corruption(&self, err: &ReaderError) {
        let ReaderError::CorruptedFile { source, .. } = err else { return };
        let total_articles = self.descriptor.segments.len() as u64
            + self
                .descriptor
                .nested_sources
                .iter()
                .map(|s| s.segments.len() as u64)
                .sum::<u64>();

        health::report_streaming_failure(
            self.metadata.as_ref(),
            self.health.as_ref(),
            &self.path,
            self.descriptor.clone(),
            source.to_string(),
            total_articles,
            1,
            self.config.mask_threshold,
            Duration::from_secs(self.config.health_timeout_secs),
        )
        .await;
    }
}

impl Drop for VirtualFile {
    fn drop(&mut self) {
        let Ok(mut state) = self.seq.try_lock() else {
            warn!(path = %self.path, "virtual file dropped while a read was in flight");
            return;
        };
        if let Some(stack) = state.stack.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(stack.close());
            }
        }
    }
}
