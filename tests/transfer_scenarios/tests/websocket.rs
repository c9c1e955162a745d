//! Drivers against a store served over WebSocket.

use std::time::Duration;

use canload_client::{
    DownloadDriver, EndpointError, TransferConfig, TransferError, UploadDriver, WsEndpoint,
    check_health,
};
use canload_transfer::{RetryPolicy, checksum_bytes};
use tokio_util::sync::CancellationToken;
use transfer_scenarios::{BusyFirstHandler, CALLER, open_store, payload, start_server};

fn quick_retry(max_attempts: u32) -> TransferConfig {
    TransferConfig {
        retry: RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(20),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn busy_answers_are_retried_until_the_upload_lands() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("store"));
    let (server, url) = start_server(BusyFirstHandler::new(store, 2)).await;

    let endpoint = WsEndpoint::new(url, Some(CALLER.into()));
    let config = quick_retry(5);
    let cancel = CancellationToken::new();

    check_health(&endpoint, &config.retry, &cancel).await.unwrap();

    let data = payload(3_000);
    let src = dir.path().join("weights.bin");
    std::fs::write(&src, &data).unwrap();

    let record = UploadDriver::new(&endpoint, &config, cancel.clone())
        .upload(&src, "weights.bin", 1024)
        .await
        .unwrap();
    assert_eq!(record.filesize, 3_000);
    assert_eq!(record.filesha256, checksum_bytes(&data));
    assert_eq!(server.handler().refused(), 2);

    let dest = dir.path().join("copy.bin");
    DownloadDriver::new(&endpoint, &config, cancel)
        .download("weights.bin", &dest, 1024)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    endpoint.close().await;
    server.shutdown();
}

#[tokio::test]
async fn a_server_that_stays_busy_exhausts_the_retries() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("store"));
    let (server, url) = start_server(BusyFirstHandler::new(store, 100)).await;

    let endpoint = WsEndpoint::new(url, Some(CALLER.into()));
    let config = quick_retry(3);

    let src = dir.path().join("weights.bin");
    std::fs::write(&src, payload(100)).unwrap();

    let err = UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "weights.bin", 64)
        .await
        .unwrap_err();
    match err {
        TransferError::RetriesExhausted {
            offset,
            attempts,
            source,
            ..
        } => {
            assert_eq!(offset, 0);
            assert_eq!(attempts, 3);
            assert!(matches!(source, EndpointError::Busy(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(server.handler().refused(), 3);

    endpoint.close().await;
    server.shutdown();
}

#[tokio::test]
async fn model_upload_over_websocket_activates_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("store"));
    let (server, url) = start_server(BusyFirstHandler::new(store.clone(), 0)).await;

    let endpoint = WsEndpoint::new(url, Some(CALLER.into()));
    let config = quick_retry(5);

    let src = dir.path().join("tiny.gguf");
    std::fs::write(&src, payload(1_500)).unwrap();
    UploadDriver::new(&endpoint, &config, CancellationToken::new())
        .upload(&src, "tiny.gguf", 1024)
        .await
        .unwrap();

    assert_eq!(store.loaded_model().as_deref(), Some("tiny.gguf"));

    endpoint.close().await;
    server.shutdown();
}

#[tokio::test]
async fn unreachable_server_is_reported_after_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let endpoint = WsEndpoint::new(url, Some(CALLER.into()));
    let config = quick_retry(2);
    let err = check_health(&endpoint, &config.retry, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        TransferError::RetriesExhausted {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(matches!(source, EndpointError::Connect { .. }));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}
