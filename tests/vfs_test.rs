// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! End-to-end tests over the public read path: metadata store, article
//! pool stub, and `VirtualFile` wired together the way a real embedder
//! would, covering the scenarios spec.md §8 enumerates with concrete
//! values.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nzbfs::config::DownloaderConfig;
use nzbfs::file::VirtualFile;
use nzbfs::health::InMemoryHealthStore;
use nzbfs::meta::{Encryption, FileDescriptor, SegmentData};
use nzbfs::pool::stub::{Behavior, StubPool};
use nzbfs::store::{FsMetadataStore, MetadataStore};

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};

fn config(max_prefetch: usize) -> DownloaderConfig {
    DownloaderConfig {
        max_prefetch,
        fetch_timeout_secs: 2,
        retry_attempts: 2,
        retry_delay_ms: 1,
        shutdown_timeout_secs: 2,
        health_timeout_secs: 2,
        mask_threshold: 5,
    }
}

fn seg(id: &str, start: u64, end: u64) -> SegmentData {
    SegmentData { message_id: id.to_string(), segment_size: end + 1, start_offset: start, end_offset: end }
}

/// Scenario A: 3 segments of usable size 10 each, plain, no nesting.
/// ReadAt(buf[20], off=5) returns bytes 5..24.
#[tokio::test]
async fn scenario_a_read_at_mid_file_window() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));
    let plaintext: Vec<u8> = (0..30u8).collect();
    let segments = vec![seg("s0", 0, 9), seg("s1", 0, 9), seg("s2", 0, 9)];
    metadata
        .write_descriptor("file.bin", &FileDescriptor { size: 30, segments, ..Default::default() })
        .unwrap();

    let pool = StubPool::new();
    pool.set("s0", Behavior::Ok(plaintext[0..10].to_vec())).await;
    pool.set("s1", Behavior::Ok(plaintext[10..20].to_vec())).await;
    pool.set("s2", Behavior::Ok(plaintext[20..30].to_vec())).await;

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("file.bin", metadata, health, pool, None, config(30)).unwrap();

    let mut buf = [0u8; 20];
    let cancel = CancellationToken::new();
    let n = vf.read_at(5, &mut buf, &cancel).await.unwrap();
    assert_eq!(n, 20);
    assert_eq!(&buf[..], &plaintext[5..25]);
}

/// Scenario B: same file, Seek(25) then Read(10) returns the final 5 bytes.
#[tokio::test]
async fn scenario_b_seek_near_end_then_read_returns_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));
    let plaintext: Vec<u8> = (0..30u8).collect();
    let segments = vec![seg("s0", 0, 9), seg("s1", 0, 9), seg("s2", 0, 9)];
    metadata
        .write_descriptor("file.bin", &FileDescriptor { size: 30, segments, ..Default::default() })
        .unwrap();

    let pool = StubPool::new();
    pool.set("s0", Behavior::Ok(plaintext[0..10].to_vec())).await;
    pool.set("s1", Behavior::Ok(plaintext[10..20].to_vec())).await;
    pool.set("s2", Behavior::Ok(plaintext[20..30].to_vec())).await;

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("file.bin", metadata, health, pool, None, config(30)).unwrap();

    vf.seek(SeekFrom::Start(25)).await.unwrap();
    let mut buf = [0u8; 10];
    let n = vf.read(&mut buf, None).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], &plaintext[25..30]);
    assert_eq!(vf.read(&mut buf, None).await.unwrap(), 0);
}

/// Scenario C: segment 1 is permanently missing. Reading the whole file
/// returns the first 10 bytes then a corrupted-file error annotated with
/// bytes already delivered, and marks the descriptor corrupted.
#[tokio::test]
async fn scenario_c_missing_article_surfaces_as_corrupted_file() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));
    let segments = vec![seg("s0", 0, 9), seg("s1", 0, 9), seg("s2", 0, 9)];
    metadata
        .write_descriptor("file.bin", &FileDescriptor { size: 30, segments, ..Default::default() })
        .unwrap();

    let pool = StubPool::new();
    pool.set("s0", Behavior::Ok(vec![1u8; 10])).await;
    pool.set("s1", Behavior::NotFound).await;
    pool.set("s2", Behavior::Ok(vec![3u8; 10])).await;

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("file.bin", metadata.clone(), health.clone(), pool, None, config(30))
        .unwrap();

    let mut buf = [0u8; 30];
    let mut delivered = 0usize;
    let err = loop {
        match vf.read(&mut buf[delivered..], None).await {
            Ok(0) => panic!("expected corruption before EOF"),
            Ok(n) => delivered += n,
            Err(e) => break e,
        }
    };
    assert_eq!(delivered, 10);
    match err {
        nzbfs::error::ReaderError::CorruptedFile { bytes_already_delivered, total_expected_size, .. } => {
            assert_eq!(bytes_already_delivered, 10);
            assert_eq!(total_expected_size, 30);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let descriptor = metadata.read_descriptor("file.bin").unwrap();
    assert!(descriptor.is_corrupted());
    let row = health.get("file.bin").unwrap();
    assert_eq!(row.status, nzbfs::health::HealthStatus::Pending);
}

/// Scenario D: max_prefetch=3, 100 segments. After consuming the first
/// segment, no more than `max_prefetch` segments are scheduled ahead of
/// the consumer at any instant.
#[tokio::test]
async fn scenario_d_prefetch_never_exceeds_max_prefetch() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));

    let pool = StubPool::new();
    let mut segments = Vec::new();
    for i in 0..100 {
        let id = format!("seg{i}");
        pool.set(id.clone(), Behavior::Delay(Duration::from_millis(20), Box::new(Behavior::Ok(vec![i as u8; 4])))).await;
        segments.push(seg(&id, 0, 3));
    }
    metadata
        .write_descriptor("big.bin", &FileDescriptor { size: 400, segments, ..Default::default() })
        .unwrap();

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("big.bin", metadata, health, pool.clone(), None, config(3)).unwrap();

    let mut buf = [0u8; 4];
    let n = vf.read(&mut buf, None).await.unwrap();
    assert_eq!(n, 4);

    // Give the scheduler a moment to fill its prefetch window, then check
    // that it hasn't scheduled more than max_prefetch segments ahead of
    // the single byte already consumed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let in_flight_or_done: u32 = futures_count(&pool, 1..100).await;
    assert!(in_flight_or_done <= 3, "observed {in_flight_or_done} segments touched ahead of consumer");
}

async fn futures_count(pool: &Arc<StubPool>, range: std::ops::Range<usize>) -> u32 {
    let mut count = 0;
    for i in range {
        if pool.attempts_for(&format!("seg{i}")).await > 0 {
            count += 1;
        }
    }
    count
}

/// Scenario E: nested file with inner_length [100, 200, 50] (L=350).
/// ReadAt(off=90, len=120) reads the last 10 bytes of source 0 and the
/// first 110 bytes of source 1.
#[tokio::test]
async fn scenario_e_nested_read_spans_two_inner_sources() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));

    let pool = StubPool::new();
    let source0: Vec<u8> = (0..100u32).map(|i| (i % 256) as u8).collect();
    let source1: Vec<u8> = (0..200u32).map(|i| ((i + 50) % 256) as u8).collect();
    let source2: Vec<u8> = (0..50u32).map(|i| ((i + 200) % 256) as u8).collect();
    pool.set("src0", Behavior::Ok(source0.clone())).await;
    pool.set("src1", Behavior::Ok(source1.clone())).await;
    pool.set("src2", Behavior::Ok(source2.clone())).await;

    let nested_sources = vec![
        nzbfs::meta::NestedSegmentSource {
            segments: vec![seg("src0", 0, 99)],
            inner_volume_size: 100,
            inner_offset: 0,
            inner_length: 100,
            aes_key: Vec::new(),
            aes_iv: Vec::new(),
        },
        nzbfs::meta::NestedSegmentSource {
            segments: vec![seg("src1", 0, 199)],
            inner_volume_size: 200,
            inner_offset: 0,
            inner_length: 200,
            aes_key: Vec::new(),
            aes_iv: Vec::new(),
        },
        nzbfs::meta::NestedSegmentSource {
            segments: vec![seg("src2", 0, 49)],
            inner_volume_size: 50,
            inner_offset: 0,
            inner_length: 50,
            aes_key: Vec::new(),
            aes_iv: Vec::new(),
        },
    ];
    metadata
        .write_descriptor("multi.bin", &FileDescriptor { size: 350, nested_sources, ..Default::default() })
        .unwrap();

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("multi.bin", metadata, health, pool, None, config(10)).unwrap();

    let mut buf = [0u8; 120];
    let cancel = CancellationToken::new();
    let n = vf.read_at(90, &mut buf, &cancel).await.unwrap();
    assert_eq!(n, 120);
    assert_eq!(&buf[..10], &source0[90..100]);
    assert_eq!(&buf[10..120], &source1[0..110]);
}

/// Scenario F: concurrent ReadAt calls on the same handle complete
/// independently and neither blocks the other.
#[tokio::test]
async fn scenario_f_concurrent_read_ats_are_independent() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));

    let pool = StubPool::new();
    let low: Vec<u8> = vec![9u8; 16 * 1024];
    let high: Vec<u8> = vec![7u8; 16 * 1024];
    pool.set("low", Behavior::Ok(low.clone())).await;
    pool.set("high", Behavior::Delay(Duration::from_millis(30), Box::new(Behavior::Ok(high.clone())))).await;

    let segments = vec![seg("low", 0, 16 * 1024 - 1), seg("high", 0, 16 * 1024 - 1)];
    metadata
        .write_descriptor("f.bin", &FileDescriptor { size: 32 * 1024, segments, ..Default::default() })
        .unwrap();

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = Arc::new(
        VirtualFile::open("f.bin", metadata, health, pool, None, config(10)).unwrap(),
    );

    let cancel = CancellationToken::new();
    let (vf1, cancel1) = (vf.clone(), cancel.clone());
    let t1 = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        vf1.read_at(0, &mut buf, &cancel1).await.unwrap();
        buf
    });
    let (vf2, cancel2) = (vf.clone(), cancel.clone());
    let t2 = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        vf2.read_at(16 * 1024, &mut buf, &cancel2).await.unwrap();
        buf
    });

    let (b1, b2) = tokio::join!(t1, t2);
    assert_eq!(b1.unwrap(), low);
    assert_eq!(b2.unwrap(), high);
}

/// Property: range-bytes equality across an alternating seek/read
/// sequence with varying chunk sizes.
#[tokio::test]
async fn range_bytes_equal_plaintext_across_seeks_and_varying_chunk_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));
    let plaintext: Vec<u8> = (0..97u32).map(|i| (i % 256) as u8).collect();

    let pool = StubPool::new();
    let mut segments = Vec::new();
    for (i, chunk) in plaintext.chunks(13).enumerate() {
        let id = format!("c{i}");
        pool.set(id.clone(), Behavior::Ok(chunk.to_vec())).await;
        segments.push(seg(&id, 0, chunk.len() as u64 - 1));
    }
    metadata
        .write_descriptor("rt.bin", &FileDescriptor { size: plaintext.len() as u64, segments, ..Default::default() })
        .unwrap();

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("rt.bin", metadata, health, pool, None, config(8)).unwrap();

    vf.seek(SeekFrom::Start(10)).await.unwrap();
    let mut out = Vec::new();
    for chunk_size in [3usize, 7, 1, 20] {
        let mut buf = vec![0u8; chunk_size];
        let n = vf.read(&mut buf, None).await.unwrap();
        out.extend_from_slice(&buf[..n]);
        if n < chunk_size {
            break;
        }
    }
    assert_eq!(out, plaintext[10..10 + out.len()]);
}

/// Property 9: an AES-CBC encrypted descriptor, read through the public
/// `VirtualFile` API with `ReadAt` at a non-aligned offset, yields the
/// original plaintext.
#[tokio::test]
async fn aes_cbc_descriptor_round_trips_through_read_at() {
    let key = [11u8; 32];
    let iv = [22u8; 16];
    let mut plaintext = [0u8; 64];
    for (i, b) in plaintext.iter_mut().enumerate() {
        *b = (i * 7) as u8;
    }
    let mut ciphertext = plaintext.to_vec();
    let encryptor = cbc::Encryptor::<Aes256>::new_from_slices(&key, &iv).unwrap();
    let ct = encryptor.encrypt_padded_mut::<NoPadding>(&mut ciphertext, 64).unwrap().to_vec();

    let tmp = tempfile::tempdir().unwrap();
    let metadata: Arc<dyn MetadataStore> = Arc::new(FsMetadataStore::new(tmp.path(), vec![]));
    metadata
        .write_descriptor(
            "enc.bin",
            &FileDescriptor {
                size: 64,
                encryption: Encryption::AesCbc as i32,
                aes_key: key.to_vec(),
                aes_iv: iv.to_vec(),
                segments: vec![seg("ct", 0, ct.len() as u64 - 1)],
                ..Default::default()
            },
        )
        .unwrap();

    let pool = StubPool::new();
    pool.set("ct", Behavior::Ok(ct)).await;

    let health = Arc::new(InMemoryHealthStore::new());
    let vf = VirtualFile::open("enc.bin", metadata, health, pool, None, config(10)).unwrap();

    let mut buf = [0u8; 12];
    let cancel = CancellationToken::new();
    let n = vf.read_at(20, &mut buf, &cancel).await.unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf[..], &plaintext[20..32]);
}
