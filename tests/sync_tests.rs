//! End-to-end synchronization scenarios over the in-memory fetcher

use rangesync::control::{build_control, MakeOptions};
use rangesync::error::Error;
use rangesync::fetch::{memory::MemoryFetcher, RangeFetcher, RemoteFetchAdapter};
use rangesync::progress::FetchProgress;
use rangesync::session::{SessionStatus, SyncSession, VerifyOutcome};
use std::path::Path;
use tempfile::TempDir;

const MIRROR_A: &str = "http://a.example.org/target";
const MIRROR_B: &str = "http://b.example.org/target";

fn target(len: usize) -> Vec<u8> {
    // Deterministic but aperiodic content.
    let mut state = 0x243f_6a88u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

fn control_for(data: &[u8], block_size: usize) -> Vec<u8> {
    build_control(
        data,
        &MakeOptions {
            block_size: Some(block_size),
            filename: Some("target.bin".into()),
            urls: vec![MIRROR_A.into(), MIRROR_B.into()],
            ..Default::default()
        },
    )
    .unwrap()
}

async fn begin(data: &[u8], block_size: usize, dir: &TempDir) -> SyncSession {
    let control = control_for(data, block_size);
    SyncSession::begin(&control[..], dir.path()).await.unwrap()
}

/// Run the fetch loop and finalize into `out`, returning the file bytes.
async fn fetch_and_finalize(
    mut session: SyncSession,
    fetcher: MemoryFetcher,
    out: &Path,
) -> Result<Vec<u8>, Error> {
    let progress = FetchProgress::new(false, 0);
    if session.status() != SessionStatus::Complete {
        let mut adapter = RemoteFetchAdapter::new(
            RangeFetcher::Memory(fetcher),
            vec![MIRROR_A.into(), MIRROR_B.into()],
            3,
            100,
        );
        adapter.run(&mut session, &progress).await?;
    }
    assert_eq!(session.complete().await?, VerifyOutcome::Verified);
    session.finalize(out).await?;
    Ok(std::fs::read(out).unwrap())
}

#[tokio::test]
async fn test_no_seeds_full_download() {
    let dir = TempDir::new().unwrap();
    let data = target(10 * 1024 + 37);
    let session = begin(&data, 1024, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone());

    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);

    // One request covering the whole file.
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.first().unwrap().0, 0);
}

#[tokio::test]
async fn test_exact_seed_means_zero_requests() {
    let dir = TempDir::new().unwrap();
    let data = target(16 * 512);
    let mut session = begin(&data, 512, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone());

    session
        .submit_seed(&mut &data[..], Path::new("seed"))
        .await
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Complete);

    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);
    assert!(fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_half_seed_fetches_one_range() {
    let dir = TempDir::new().unwrap();
    let blocks = 16usize;
    let bs = 512usize;
    let data = target(blocks * bs);
    let mut session = begin(&data, bs, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone());

    session
        .submit_seed(&mut &data[..blocks / 2 * bs], Path::new("half"))
        .await
        .unwrap();
    assert_eq!(session.blocks_todo(), (blocks / 2) as u64);

    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].1,
        vec![((blocks / 2 * bs) as u64, (blocks * bs - 1) as u64)]
    );
}

#[tokio::test]
async fn test_three_seeds_any_order_zero_remote_bytes() {
    let bs = 256usize;
    let data = target(12 * bs);
    let parts: [&[u8]; 3] = [
        &data[..4 * bs],
        &data[4 * bs..8 * bs],
        &data[8 * bs..],
    ];

    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0], [2, 1, 0]] {
        let dir = TempDir::new().unwrap();
        let mut session = begin(&data, bs, &dir).await;
        for &i in &order {
            let mut reader = parts[i];
            session
                .submit_seed(&mut reader, Path::new("part"))
                .await
                .unwrap();
        }
        assert_eq!(session.status(), SessionStatus::Complete, "order {:?}", order);
        assert_eq!(session.stats().bytes_received, 0);

        let fetcher = MemoryFetcher::new(data.clone());
        let out = dir.path().join("target.bin");
        let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
        assert_eq!(result, data, "order {:?}", order);
        assert!(fetcher.requests().is_empty());
    }
}

#[tokio::test]
async fn test_duplicate_seed_equals_single_seed() {
    let bs = 256usize;
    let data = target(10 * bs);

    let mut outputs = Vec::new();
    for copies in [1, 2] {
        let dir = TempDir::new().unwrap();
        let seed_path = dir.path().join("seed.bin");
        std::fs::write(&seed_path, &data[..5 * bs]).unwrap();

        let mut session = begin(&data, bs, &dir).await;
        for _ in 0..copies {
            session.submit_seed_path(&seed_path).await.unwrap();
        }

        let fetcher = MemoryFetcher::new(data.clone());
        let out = dir.path().join("target.bin");
        let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
        outputs.push((result, fetcher.requests().len()));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].0, data);
}

#[tokio::test]
async fn test_corrupt_local_copy_refetches_exact_blocks() {
    let bs = 256usize;
    let blocks = 16usize;
    let data = target(blocks * bs);
    let filelen = data.len();

    // A stale local copy with three flipped bytes.
    let mut stale = data.clone();
    stale[filelen / 2] ^= 0x01; // block 8
    stale[11] ^= 0x01; // block 0
    stale[filelen - 11] ^= 0x01; // block 15

    let dir = TempDir::new().unwrap();
    let mut session = begin(&data, bs, &dir).await;
    session
        .submit_seed(&mut &stale[..], Path::new("stale"))
        .await
        .unwrap();
    assert_eq!(session.blocks_todo(), 3);

    let fetcher = MemoryFetcher::new(data.clone());
    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].1,
        vec![
            (0, bs as u64 - 1),
            (8 * bs as u64, 9 * bs as u64 - 1),
            (15 * bs as u64, 16 * bs as u64 - 1),
        ]
    );
}

#[tokio::test]
async fn test_failing_mirror_falls_over() {
    let dir = TempDir::new().unwrap();
    let data = target(8 * 512);
    let session = begin(&data, 512, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone()).failing_url(MIRROR_A);

    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);

    // Whichever mirror was tried first, B must have served the data.
    let requests = fetcher.requests();
    assert_eq!(requests.last().unwrap().0, MIRROR_B);
}

#[tokio::test]
async fn test_corrupting_mirror_is_struck_out() {
    let dir = TempDir::new().unwrap();
    let data = target(8 * 512);
    let session = begin(&data, 512, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone()).corrupting_url(MIRROR_A);

    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher.clone(), &out).await.unwrap();
    assert_eq!(result, data);
}

#[tokio::test]
async fn test_all_mirrors_failing_exhausts() {
    let dir = TempDir::new().unwrap();
    let data = target(8 * 512);
    let mut session = begin(&data, 512, &dir).await;
    let fetcher = MemoryFetcher::new(data.clone())
        .failing_url(MIRROR_A)
        .failing_url(MIRROR_B);

    let progress = FetchProgress::new(false, 0);
    let mut adapter = RemoteFetchAdapter::new(
        RangeFetcher::Memory(fetcher),
        vec![MIRROR_A.into(), MIRROR_B.into()],
        3,
        100,
    );
    let err = adapter.run(&mut session, &progress).await.unwrap_err();
    assert!(matches!(err, Error::AllUrlsExhausted));

    // The scratch file survives for a later resume.
    assert!(session.params().filelen > 0);
    session.abort().await.unwrap();
}

#[tokio::test]
async fn test_resume_from_partial_file() {
    let bs = 512usize;
    let data = target(12 * bs);
    let dir = TempDir::new().unwrap();

    // First run: seed half, then abandon, keeping the partial file.
    let part_path = dir.path().join("target.bin.part");
    {
        let mut session = begin(&data, bs, &dir).await;
        session
            .submit_seed(&mut &data[..6 * bs], Path::new("half"))
            .await
            .unwrap();
        session.rename_scratch(&part_path).await.unwrap();
        // Session dropped here; the scratch file remains on disk.
    }
    assert!(part_path.exists());

    // Second run: the partial file is just another seed.
    let mut session = begin(&data, bs, &dir).await;
    session.submit_seed_path(&part_path).await.unwrap();
    assert!(session.blocks_todo() <= 6);

    let fetcher = MemoryFetcher::new(data.clone());
    let out = dir.path().join("target.bin");
    let result = fetch_and_finalize(session, fetcher, &out).await.unwrap();
    assert_eq!(result, data);
}

#[tokio::test]
async fn test_mtime_restored_on_finalize() {
    let bs = 256usize;
    let data = target(4 * bs);
    let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);

    let control = build_control(
        &data,
        &MakeOptions {
            block_size: Some(bs),
            urls: vec![MIRROR_A.into()],
            mtime: Some(mtime),
            ..Default::default()
        },
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let mut session = SyncSession::begin(&control[..], dir.path()).await.unwrap();
    session
        .submit_seed(&mut &data[..], Path::new("seed"))
        .await
        .unwrap();
    session.complete().await.unwrap();

    let out = dir.path().join("out.bin");
    session.finalize(&out).await.unwrap();

    let restored = std::fs::metadata(&out).unwrap().modified().unwrap();
    assert_eq!(restored, mtime);
}
