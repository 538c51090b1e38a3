//! Nested-source composer — presents a logical file built from multiple
//! inner archive volumes as a single stream, opening only one inner reader
//! at a time so fan-out volumes don't multiply the downloader's prefetch
//! pressure.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::SegmentCache;
use crate::config::DownloaderConfig;
use crate::decrypt;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::meta::NestedSegmentSource;
use crate::pool::ArticlePool;
use crate::range::SegmentRange;

/// One inner source's contribution to a requested logical range, in that
/// source's own coordinate space.
struct Plan {
    source_idx: usize,
    local_start: u64,
    local_end: u64,
}

enum CurrentSource {
    Plain(Arc<Downloader>),
    Decrypted { bytes: Bytes, pos: usize },
}

struct ComposerState {
    plan_idx: usize,
    current: Option<CurrentSource>,
}

pub struct NestedComposer {
    plans: Vec<Plan>,
    sources: Vec<NestedSegmentSource>,
    pool: Arc<dyn ArticlePool>,
    cache: Option<Arc<dyn SegmentCache>>,
    config: DownloaderConfig,
    state: AsyncMutex<ComposerState>,
}

impl NestedComposer {
    /// Build a composer over the sub-range `[start, end]` (inclusive) of
    /// the logical file formed by concatenating `sources` in order.
    pub fn new(
        sources: Vec<NestedSegmentSource>,
        start: u64,
        end: u64,
        pool: Arc<dyn ArticlePool>,
        cache: Option<Arc<dyn SegmentCache>>,
        config: DownloaderConfig,
    ) -> Self {
        let plans = Self::build_plans(&sources, start, end);
        Self {
            plans,
            sources,
            pool,
            cache,
            config,
            state: AsyncMutex::new(ComposerState { plan_idx: 0, current: None }),
        }
    }

    fn build_plans(sources: &[NestedSegmentSource], start: u64, end: u64) -> Vec<Plan> {
        if end < start {
            return Vec::new();
        }
        let mut plans = Vec::new();
        let mut cum = 0u64;
        for (idx, source) in sources.iter().enumerate() {
            let source_start = cum;
            let source_end_excl = cum + source.inner_length;
            cum = source_end_excl;

            if source.inner_length == 0 || end < source_start || start >= source_end_excl {
                continue;
            }
            let local_start = start.saturating_sub(source_start);
            let local_end = end.min(source_end_excl - 1) - source_start;
            plans.push(Plan { source_idx: idx, local_start, local_end });
        }
        plans
    }

    pub fn total_plan_len(&self) -> u64 {
        self.plans
            .iter()
            .map(|p| p.local_end - p.local_start + 1)
            .sum()
    }

    /// Release whichever inner source reader is currently open, if any.
    /// Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(CurrentSource::Plain(dl)) = state.current.take() {
            dl.close().await;
        }
    }

    /// Read the next chunk in order, opening the next inner source lazily
    /// as the current one is exhausted. Returns `Ok(0)` once every planned
    /// source has been fully consumed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        loop {
            if state.current.is_none() {
                if state.plan_idx >= self.plans.len() {
                    return Ok(0);
                }
                let plan_idx = state.plan_idx;
                let current = self.open(&self.plans[plan_idx]).await?;
                state.current = Some(current);
            }

            match state.current.as_mut().unwrap() {
                CurrentSource::Plain(dl) => {
                    let n = dl.read(buf).await?;
                    if n == 0 {
                        dl.close().await;
                        state.current = None;
                        state.plan_idx += 1;
                        continue;
                    }
                    return Ok(n);
                }
                CurrentSource::Decrypted { bytes, pos } => {
                    if *pos >= bytes.len() {
                        state.current = None;
                        state.plan_idx += 1;
                        continue;
                    }
                    let n = (bytes.len() - *pos).min(buf.len());
                    buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                    *pos += n;
                    return Ok(n);
                }
            }
        }
    }

    async fn open(&self, plan: &Plan) -> Result<CurrentSource> {
        let source = &self.sources[plan.source_idx];
        let abs_start = source.inner_offset + plan.local_start;
        let abs_end = source.inner_offset + plan.local_end;

        if !source.aes_key.is_empty() {
            let fetch = self.source_fetch(plan.source_idx);
            let bytes =
                decrypt::open_aes_cbc(&source.aes_key, &source.aes_iv, abs_start, abs_end, fetch)
                    .await?;
            Ok(CurrentSource::Decrypted { bytes, pos: 0 })
        } else {
            let range = Arc::new(SegmentRange::from_segments(&source.segments, abs_start, abs_end));
            let total = abs_end - abs_start + 1;
            let dl = Downloader::new(range, self.pool.clone(), self.cache.clone(), self.config.clone(), total);
            Ok(CurrentSource::Plain(dl))
        }
    }

    /// A `decrypt::Fetch` that drives a fresh downloader over the exact
    /// ciphertext window the decryption adapter asks for, within the same
    /// source's inner-volume coordinate space.
    fn source_fetch(&self, source_idx: usize) -> decrypt::Fetch {
        let source = self.sources[source_idx].clone();
        let pool = self.pool.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();

        Arc::new(move |start: u64, end: u64| {
            let source = source.clone();
            let pool = pool.clone();
            let cache = cache.clone();
            let config = config.clone();
            Box::pin(async move {
                let abs_start = source.inner_offset + start;
                let abs_end = source.inner_offset + end;
                let range = Arc::new(SegmentRange::from_segments(&source.segments, abs_start, abs_end));
                let total = abs_end - abs_start + 1;
                let dl = Downloader::new(range, pool, cache, config, total);

                let mut out = vec![0u8; total as usize];
                let mut filled = 0usize;
                while filled < out.len() {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloaderConfig;
    use crate::meta::SegmentData;
    use crate::pool::stub::{Behavior, StubPool};

    fn config() -> DownloaderConfig {
        DownloaderConfig {
            max_prefetch: 4,
            fetch_timeout_secs: 1,
            retry_attempts: 2,
            retry_delay_ms: 1,
            shutdown_timeout_secs: 1,
            health_timeout_secs: 1,
            mask_threshold: 3,
        }
    }

    fn source(segs: Vec<SegmentData>, inner_length: u64) -> NestedSegmentSource {
        NestedSegmentSource {
            segments: segs,
            inner_volume_size: inner_length,
            inner_offset: 0,
            inner_length,
            aes_key: Vec::new(),
            aes_iv: Vec::new(),
        }
    }

    fn seg(id: &str, start: u64, end: u64) -> SegmentData {
        SegmentData { message_id: id.to_string(), segment_size: end + 1, start_offset: start, end_offset: end }
    }

    #[tokio::test]
    async fn composes_two_plain_sources_sequentially() {
        let pool = StubPool::new();
        pool.set("a", Behavior::Ok(b"AAAA".to_vec())).await;
        pool.set("b", Behavior::Ok(b"BBBB".to_vec())).await;

        let sources = vec![
            source(vec![seg("a", 0, 3)], 4),
            source(vec![seg("b", 0, 3)], 4),
        ];

        let composer = NestedComposer::new(sources, 0, 7, pool.clone(), None, config());
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = composer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"AAAABBBB");
    }

    #[tokio::test]
    async fn skips_sources_entirely_outside_the_requested_range() {
        let pool = StubPool::new();
        pool.set("b", Behavior::Ok(b"BBBB".to_vec())).await;

        let sources = vec![
            source(vec![seg("a", 0, 3)], 4),
            source(vec![seg("b", 0, 3)], 4),
        ];

        // Request only the second source's bytes.
        let composer = NestedComposer::new(sources, 4, 7, pool.clone(), None, config());
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = composer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"BBBB");
    }
}
