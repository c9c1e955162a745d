//! Drivers against an in-process store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use canload_client::{
    DownloadDriver, LocalEndpoint, TransferConfig, TransferEndpoint, TransferError, UploadDriver,
};
use canload_protocol::messages::{DownloadChunkRequest, FileDetailsRequest, UploadChunkRequest};
use canload_protocol::{ApiError, Namespace, StatusCodeRecord};
use canload_transfer::{Checkpoint, CheckpointStore, Direction, checksum_bytes};
use tokio_util::sync::CancellationToken;
use transfer_scenarios::{CALLER, FailOn, FlakyEndpoint, open_store, payload};

fn local(dir: &tempfile::TempDir) -> LocalEndpoint {
    LocalEndpoint::new(open_store(&dir.path().join("store")), Some(CALLER.into()))
}

fn details(name: &str) -> FileDetailsRequest {
    FileDetailsRequest {
        filename: name.into(),
        namespace: Namespace::Files,
    }
}

#[tokio::test]
async fn upload_then_download_round_trips_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let config = TransferConfig {
        verify_hash: true,
        ..Default::default()
    };

    let data = payload(10_000);
    let src = dir.path().join("weights.bin");
    std::fs::write(&src, &data).unwrap();

    let record = UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "weights.bin", 4096)
        .await
        .unwrap();
    assert_eq!(record.filesize, 10_000);
    assert_eq!(record.filesha256, checksum_bytes(&data));

    let dest = dir.path().join("copy.bin");
    let summary = DownloadDriver::new(&endpoint, &config, CancellationToken::new())
        .download("weights.bin", &dest, 4096)
        .await
        .unwrap();
    assert_eq!(summary.bytes, 10_000);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.filesha256.as_deref(), Some(record.filesha256.as_str()));
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn interleaved_names_do_not_mix() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let config = TransferConfig::default();

    let a = payload(7_000);
    let b: Vec<u8> = payload(5_000).into_iter().rev().collect();
    let path_a = dir.path().join("a.bin");
    let path_b = dir.path().join("b.bin");
    std::fs::write(&path_a, &a).unwrap();
    std::fs::write(&path_b, &b).unwrap();

    let up_a = UploadDriver::new(&endpoint, &config, CancellationToken::new());
    let up_b = UploadDriver::new(&endpoint, &config, CancellationToken::new());
    let (ra, rb) = tokio::join!(
        up_a.upload(&path_a, "a.bin", 1000),
        up_b.upload(&path_b, "b.bin", 700),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.filesha256, checksum_bytes(&a));
    assert_eq!(rb.filesha256, checksum_bytes(&b));

    let down = DownloadDriver::new(&endpoint, &config, CancellationToken::new());
    let out_a = dir.path().join("a.out");
    let out_b = dir.path().join("b.out");
    let (da, db) = tokio::join!(
        down.download("a.bin", &out_a, 999),
        down.download("b.bin", &out_b, 1234),
    );
    da.unwrap();
    db.unwrap();
    assert_eq!(std::fs::read(&out_a).unwrap(), a);
    assert_eq!(std::fs::read(&out_b).unwrap(), b);
}

#[tokio::test]
async fn fifteen_bytes_in_fives_flags_done_on_the_third_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let config = TransferConfig::default();

    let src = dir.path().join("fifteen.bin");
    std::fs::write(&src, b"abcdefghijklmno").unwrap();
    UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "fifteen.bin", 5)
        .await
        .unwrap();

    let mut flags = Vec::new();
    for offset in [0u64, 5, 10] {
        let req = DownloadChunkRequest {
            filename: "fifteen.bin".into(),
            chunksize: 5,
            offset,
            namespace: Namespace::Files,
        };
        let chunk = endpoint.download_chunk(&req).await.unwrap().unwrap();
        assert_eq!(chunk.chunk.len(), 5);
        assert_eq!(chunk.filesize, 15);
        flags.push(chunk.done);
    }
    assert_eq!(flags, [false, false, true]);

    let summary = DownloadDriver::new(&endpoint, &config, CancellationToken::new())
        .download("fifteen.bin", &dir.path().join("out.bin"), 5)
        .await
        .unwrap();
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.bytes, 15);
}

#[tokio::test(start_paused = true)]
async fn four_transient_failures_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = FlakyEndpoint::new(local(&dir), FailOn::Upload, 4);
    let config = TransferConfig::default();

    let src = dir.path().join("ten.bin");
    std::fs::write(&src, b"0123456789").unwrap();

    let start = tokio::time::Instant::now();
    let record = UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "ten.bin", 4)
        .await
        .unwrap();

    assert_eq!(record.filesize, 10);
    // Five attempts for the first chunk, one each for the other two.
    assert_eq!(endpoint.attempts(), 7);
    assert!(start.elapsed() >= Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn five_transient_failures_abort_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = FlakyEndpoint::new(local(&dir), FailOn::Upload, 5);
    let config = TransferConfig::default();

    let src = dir.path().join("ten.bin");
    std::fs::write(&src, b"0123456789").unwrap();

    let err = UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "ten.bin", 4)
        .await
        .unwrap_err();

    match err {
        TransferError::RetriesExhausted {
            offset, attempts, ..
        } => {
            assert_eq!(offset, 0);
            assert_eq!(attempts, 5);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(endpoint.attempts(), 5);
    let stored = endpoint
        .inner()
        .uploaded_file_details(&details("ten.bin"))
        .await
        .unwrap();
    assert!(stored.is_err());
}

#[tokio::test(start_paused = true)]
async fn download_retries_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = FlakyEndpoint::new(local(&dir), FailOn::Download, 2);
    let config = TransferConfig::default();

    let src = dir.path().join("ten.bin");
    std::fs::write(&src, b"0123456789").unwrap();
    UploadDriver::new(endpoint.inner(), &config, CancellationToken::new())
        .upload(&src, "ten.bin", 4)
        .await
        .unwrap();

    let dest = dir.path().join("out.bin");
    DownloadDriver::new(&endpoint, &config, CancellationToken::new())
        .download("ten.bin", &dest, 4)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    assert_eq!(endpoint.attempts(), 5);

    let strict = TransferConfig {
        retry_downloads: false,
        ..Default::default()
    };
    let flaky = FlakyEndpoint::new(local(&dir), FailOn::Download, 1);
    let err = DownloadDriver::new(&flaky, &strict, CancellationToken::new())
        .download("ten.bin", &dir.path().join("strict.bin"), 4)
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), Some(1));
}

#[tokio::test]
async fn details_follow_every_accepted_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let data = payload(3_000);

    let mut offset = 0;
    for chunk in data.chunks(1024) {
        let req = UploadChunkRequest {
            filename: "d.bin".into(),
            chunk: chunk.to_vec(),
            chunksize: 1024,
            offset: offset as u64,
            namespace: Namespace::Files,
        };
        let accepted = endpoint.upload_chunk(&req).await.unwrap().unwrap();
        offset += chunk.len();

        let first = endpoint
            .uploaded_file_details(&details("d.bin"))
            .await
            .unwrap()
            .unwrap();
        let second = endpoint
            .uploaded_file_details(&details("d.bin"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, accepted);
        assert_eq!(first.filesize, offset as u64);
        assert_eq!(first.filesha256, checksum_bytes(&data[..offset]));
    }
    assert_eq!(offset, 3_000);
}

#[tokio::test]
async fn two_names_keep_their_own_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let config = TransferConfig::default();

    let path_a = dir.path().join("a.src");
    let path_b = dir.path().join("b.src");
    std::fs::write(&path_a, b"AAAAA").unwrap();
    std::fs::write(&path_b, b"BBBBB").unwrap();

    let up = UploadDriver::new(&endpoint, &config, CancellationToken::new());
    up.upload(&path_a, "A", 2).await.unwrap();
    up.upload(&path_b, "B", 2).await.unwrap();

    let down = DownloadDriver::new(&endpoint, &config, CancellationToken::new());
    let out_a = dir.path().join("a.out");
    let out_b = dir.path().join("b.out");
    let summary_b = down.download("B", &out_b, 3).await.unwrap();
    let summary_a = down.download("A", &out_a, 3).await.unwrap();

    assert_eq!(std::fs::read(&out_a).unwrap(), b"AAAAA");
    assert_eq!(std::fs::read(&out_b).unwrap(), b"BBBBB");
    assert_eq!((summary_a.bytes, summary_a.chunks), (5, 2));
    assert_eq!((summary_b.bytes, summary_b.chunks), (5, 2));
}

/// Leaves `dest` and a checkpoint the way a download of `f.bin` that
/// stopped after its first five bytes of `AAAAAAAAAA` would.
fn interrupted_download(endpoint: &LocalEndpoint, store: &CheckpointStore, dest: &Path) {
    std::fs::write(dest, b"AAAAA").unwrap();
    let scope = format!("{}/files", endpoint.endpoint_id());
    let checkpoint = Checkpoint::new(scope, "f.bin", Direction::Download, 5)
        .with_prefix(checksum_bytes(b"AAAAA"))
        .with_remote(10, checksum_bytes(b"AAAAAAAAAA"));
    store.save(&checkpoint).unwrap();
}

#[tokio::test]
async fn interrupted_download_resumes_when_nothing_changed() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let config = TransferConfig {
        checkpoints: Some(store.clone()),
        ..Default::default()
    };

    let src = dir.path().join("f.src");
    std::fs::write(&src, b"AAAAAAAAAA").unwrap();
    UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "f.bin", 5)
        .await
        .unwrap();

    let dest = dir.path().join("f.out");
    interrupted_download(&endpoint, &store, &dest);

    let summary = DownloadDriver::new(&endpoint, &config, CancellationToken::new())
        .download("f.bin", &dest, 5)
        .await
        .unwrap();
    assert_eq!(summary.resumed_from, 5);
    assert_eq!(summary.chunks, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), b"AAAAAAAAAA");
}

#[tokio::test]
async fn interrupted_download_of_a_replaced_file_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let config = TransferConfig {
        checkpoints: Some(store.clone()),
        ..Default::default()
    };

    let dest = dir.path().join("f.out");
    interrupted_download(&endpoint, &store, &dest);

    // The remote name now holds other bytes of the same length.
    let src = dir.path().join("f.src");
    std::fs::write(&src, b"BBBBBBBBBB").unwrap();
    UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "f.bin", 5)
        .await
        .unwrap();

    let summary = DownloadDriver::new(&endpoint, &config, CancellationToken::new())
        .download("f.bin", &dest, 5)
        .await
        .unwrap();
    assert_eq!(summary.resumed_from, 0);
    assert_eq!(summary.chunks, 2);
    assert_eq!(std::fs::read(&dest).unwrap(), b"BBBBBBBBBB");
}

#[tokio::test]
async fn model_upload_is_loaded_and_ready() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = local(&dir);
    let config = TransferConfig::default();

    assert!(endpoint.ready().await.unwrap().is_err());

    let src = dir.path().join("tiny.gguf");
    std::fs::write(&src, payload(2_048)).unwrap();
    UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "models/tiny.gguf", 1024)
        .await
        .unwrap();

    assert_eq!(
        endpoint.store().loaded_model().as_deref(),
        Some("models/tiny.gguf")
    );
    assert_eq!(
        endpoint.ready().await.unwrap(),
        Ok(StatusCodeRecord { status_code: 200 })
    );
}

#[tokio::test]
async fn prompt_caches_are_private_to_their_caller() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("store"));
    let owner = LocalEndpoint::new(Arc::clone(&store), Some(CALLER.into()));
    let other = LocalEndpoint::new(Arc::clone(&store), Some("someone-else".into()));
    let config = TransferConfig {
        namespace: Namespace::PromptCache,
        ..Default::default()
    };

    let src = dir.path().join("session.cache");
    std::fs::write(&src, payload(600)).unwrap();
    UploadDriver::new(&owner, &config, CancellationToken::new())
        .upload(&src, "session.gguf", 256)
        .await
        .unwrap();
    // Prompt caches are never activated, whatever their suffix.
    assert_eq!(store.loaded_model(), None);

    let req = FileDetailsRequest {
        filename: "session.gguf".into(),
        namespace: Namespace::PromptCache,
    };
    assert_eq!(
        owner.uploaded_file_details(&req).await.unwrap().unwrap().filesize,
        600
    );
    assert!(other.uploaded_file_details(&req).await.unwrap().is_err());
}

#[tokio::test]
async fn anonymous_uploads_are_refused_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = LocalEndpoint::new(open_store(&dir.path().join("store")), None);
    let config = TransferConfig::default();

    let src = dir.path().join("x.bin");
    std::fs::write(&src, b"x").unwrap();
    let err = UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "x.bin", 1)
        .await
        .unwrap_err();
    match err {
        TransferError::Api { source, offset, .. } => {
            assert_eq!(source, ApiError::AccessDenied);
            assert_eq!(offset, 0);
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}
