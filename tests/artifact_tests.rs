mod common;

use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rpmforge::artifact::{self, ArtifactStore};
use rpmforge::broadcast::{LogBroadcaster, SessionLogSink};
use rpmforge::config::ArtifactSection;
use rpmforge::{server, ArtifactRef, BuildError, Orchestrator, SessionId};

fn write_topdir(topdir: &Path) {
    fs::create_dir_all(topdir.join("RPMS/x86_64")).unwrap();
    fs::write(topdir.join("RPMS/x86_64/tool-0.3-1.el9.x86_64.rpm"), b"binary payload").unwrap();
}

async fn package_into(store: &ArtifactStore, root: &Path) -> ArtifactRef {
    let topdir = root.join("rpmbuild");
    write_topdir(&topdir);
    let broadcaster = LogBroadcaster::new(1 << 20, None);
    let session = SessionId::new();
    broadcaster.open(session);
    let sink = SessionLogSink::new(broadcaster, session);
    artifact::package(store, session, &topdir, "tool", &[], false, &sink)
        .await
        .expect("packaging succeeds")
}

/// Minimal HTTP/1.1 GET; returns status code and body bytes.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    (status, raw[split + 4..].to_vec())
}

#[tokio::test]
async fn test_retrieval_is_stable() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let store = ArtifactStore::new(temp_dir.path().join("artifacts"), &ArtifactSection::default()).unwrap();
    let artifact = package_into(&store, temp_dir.path()).await;

    let first = fs::read(store.resolve(artifact.session_id, &artifact.file_name).unwrap()).unwrap();
    let second = fs::read(store.resolve(artifact.session_id, &artifact.file_name).unwrap()).unwrap();
    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_eq!(store.total_bytes(), first.len() as u64);
}

#[tokio::test]
async fn test_expired_and_unknown_are_distinct() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let settings = ArtifactSection {
        ttl_secs: 1,
        ..ArtifactSection::default()
    };
    let store = ArtifactStore::new(temp_dir.path().join("artifacts"), &settings).unwrap();
    let artifact = package_into(&store, temp_dir.path()).await;
    let on_disk = store.resolve(artifact.session_id, &artifact.file_name).unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let err = store
        .resolve(artifact.session_id, &artifact.file_name)
        .unwrap_err();
    assert!(matches!(err, BuildError::ArtifactExpired(_)), "{:?}", err);
    assert!(!on_disk.exists());

    let err = store.resolve(SessionId::new(), "nothing.tar.gz").unwrap_err();
    assert!(matches!(err, BuildError::ArtifactNotFound(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_download_and_expiry() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let mut config = common::host_config(temp_dir.path(), common::FAKE_RPMBUILD);
    config.artifacts.ttl_secs = 1;
    let orchestrator = Orchestrator::from_config(config).unwrap();
    let artifact = package_into(orchestrator.store(), temp_dir.path()).await;
    let expected = fs::read(
        orchestrator
            .store()
            .resolve(artifact.session_id, &artifact.file_name)
            .unwrap(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server::serve(listener, orchestrator.clone(), async move {
        let _ = stop_rx.await;
    }));

    let (status, body) = http_get(addr, &artifact.url_path()).await;
    assert_eq!(status, 200);
    assert_eq!(body, expected);
    let (status, again) = http_get(addr, &artifact.url_path()).await;
    assert_eq!(status, 200);
    assert_eq!(again, expected);

    let unknown = format!("/artifacts/{}/missing.tar.gz", SessionId::new());
    assert_eq!(http_get(addr, &unknown).await.0, 404);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let (status, body) = http_get(addr, &artifact.url_path()).await;
    assert_eq!(status, 410);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "artifact_expired");

    let _ = stop_tx.send(());
    serving.await.unwrap().unwrap();
}
