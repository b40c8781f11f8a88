// 客户端调度器 + HTTP 服务端联调

use chibi_upload::config::{AppConfig, ReceiverConfig};
use chibi_upload::error::{ErrorKind, UploadError};
use chibi_upload::uploader::{UploadEvent, UploadOutcome, UploadScheduler, UploaderOptions};
use chibi_upload::{build_router, AppState};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::TempDir;

async fn start_server(receiver: ReceiverConfig) -> SocketAddr {
    let config = AppConfig {
        receiver,
        ..AppConfig::default()
    };
    let app = build_router(AppState::new(config).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn receiver_config(root: &Path) -> ReceiverConfig {
    ReceiverConfig {
        destination_dir: root.join("files"),
        temp_dir: root.join("chunks"),
        max_file_size: 10_000,
        max_chunk_size: 100,
        ..ReceiverConfig::default()
    }
}

fn source_file(dir: &Path, name: &str, size: usize) -> (std::path::PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&content).unwrap();
    (path, content)
}

fn client_options(addr: SocketAddr, chunk_size: u64) -> UploaderOptions {
    let mut options = UploaderOptions::new(format!("http://{}/api/v1/upload", addr));
    options.chunk_size = chunk_size;
    options.max_parallel_uploads = 2;
    options.retries = 2;
    options.delay_before_retry_secs = 0.0;
    options
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn chunked_upload_round_trip() {
    let server_root = TempDir::new().unwrap();
    let addr = start_server(receiver_config(server_root.path())).await;

    let client_root = TempDir::new().unwrap();
    let (path, content) = source_file(client_root.path(), "report.bin", 250);

    let mut options = client_options(addr, 100);
    options.params.insert("owner".to_string(), "alice".to_string());
    let (scheduler, mut rx) = UploadScheduler::open(&path, options).await.unwrap();

    let outcome = scheduler.start().await.unwrap();
    let UploadOutcome::Completed {
        locator: Some(locator),
    } = outcome
    else {
        panic!("upload did not complete with a locator");
    };
    assert_eq!(locator, format!("/files/{}.bin", scheduler.session_id()));

    // 合并结果与源文件逐字节一致
    let stored = server_root
        .path()
        .join("files")
        .join(format!("{}.bin", scheduler.session_id()));
    assert_eq!(std::fs::read(&stored).unwrap(), content);
    assert!(!server_root
        .path()
        .join("chunks")
        .join(scheduler.session_id())
        .exists());

    // 通过静态文件路由取回
    let fetched = reqwest::get(format!("http://{}{}", addr, locator))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(fetched.as_ref(), content.as_slice());

    let events = drain(&mut rx);
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last(), Some(&100));
    assert!(matches!(events.last(), Some(UploadEvent::Finished { .. })));
}

#[tokio::test]
async fn single_shot_upload() {
    let server_root = TempDir::new().unwrap();
    let addr = start_server(receiver_config(server_root.path())).await;

    let client_root = TempDir::new().unwrap();
    let (path, content) = source_file(client_root.path(), "note.txt", 60);

    let (scheduler, _rx) = UploadScheduler::open(&path, client_options(addr, 100))
        .await
        .unwrap();
    let outcome = scheduler.start().await.unwrap();
    let UploadOutcome::Completed {
        locator: Some(locator),
    } = outcome
    else {
        panic!("upload did not complete with a locator");
    };
    assert!(locator.starts_with("/files/") && locator.ends_with(".txt"));

    let fetched = reqwest::get(format!("http://{}{}", addr, locator))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(fetched.as_ref(), content.as_slice());

    // 单次上传不产生会话目录
    let sessions = std::fs::read_dir(server_root.path().join("chunks"))
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(sessions, 0);
}

#[tokio::test]
async fn oversize_chunk_stops_session() {
    let server_root = TempDir::new().unwrap();
    let mut receiver = receiver_config(server_root.path());
    receiver.max_chunk_size = 50;
    let addr = start_server(receiver).await;

    let client_root = TempDir::new().unwrap();
    let (path, _) = source_file(client_root.path(), "big.bin", 500);

    let mut options = client_options(addr, 100);
    options.max_parallel_uploads = 1;
    let (scheduler, mut rx) = UploadScheduler::open(&path, options).await.unwrap();
    let err = scheduler.start().await.unwrap_err();
    assert!(matches!(err, UploadError::FatalTransport { status: 413, .. }));
    assert!(scheduler.is_stopped());

    let errors: Vec<ErrorKind> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            UploadEvent::Error { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorKind::FatalTransport]);

    // 服务端已清理该会话的分片
    assert!(!server_root
        .path()
        .join("chunks")
        .join(scheduler.session_id())
        .exists());
}

#[tokio::test]
async fn malformed_session_header_is_rejected() {
    let server_root = TempDir::new().unwrap();
    let addr = start_server(receiver_config(server_root.path())).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![1u8; 10]).file_name("blob"),
    );
    let response = reqwest::Client::new()
        .post(format!("http://{}/api/v1/upload", addr))
        .header("chibi-uuid", "not-a-uuid")
        .header("chibi-chunk-number", "1")
        .header("chibi-chunks-total", "2")
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 400);
    assert_eq!(body["data"]["kind"], "validation");
}

#[tokio::test]
async fn health_endpoint() {
    let server_root = TempDir::new().unwrap();
    let addr = start_server(receiver_config(server_root.path())).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
}
