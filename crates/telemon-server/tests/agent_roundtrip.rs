//! Drives the real agent sender against the real server over loopback TCP.

mod common;

use common::build_test_context_with;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration;
use telemon_agent::agent::report;
use telemon_agent::sender::{HttpSender, MetricSender, SendError};
use telemon_common::crypto::Encryptor;
use telemon_common::types::Metric;
use telemon_server::config::ServerConfig;
use telemon_storage::memory::MemStorage;
use telemon_storage::Storage;

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/updates/")
}

fn secured_config(key_path: &std::path::Path) -> ServerConfig {
    ServerConfig {
        hash_key: Some("shared".to_string()),
        crypto_key: Some(key_path.to_path_buf()),
        trusted_subnet: Some("127.0.0.0/8".to_string()),
        ..Default::default()
    }
}

fn key_pair(dir: &std::path::Path) -> (std::path::PathBuf, Encryptor) {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let path = dir.join("server.pem");
    std::fs::write(&path, private.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
    (path, Encryptor::from_pem(&public_pem).unwrap())
}

#[tokio::test]
async fn signed_encrypted_report_reaches_server_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (key_path, encryptor) = key_pair(dir.path());
    let ctx = build_test_context_with(secured_config(&key_path));
    let url = serve(ctx.app.clone()).await;

    let sender = HttpSender::new(url, Duration::from_secs(5))
        .unwrap()
        .with_hash_key("shared")
        .with_encryptor(encryptor)
        .with_real_ip("127.0.0.1");

    let cache = MemStorage::new(tracing::Span::none());
    cache.write(&Metric::gauge("Alloc", 1024.0)).await.unwrap();
    cache.write(&Metric::counter("PollCount", 3)).await.unwrap();

    let senders: Vec<Arc<dyn MetricSender>> = vec![Arc::new(sender)];
    report(&cache, &senders).await.unwrap();
    report(&cache, &senders).await.unwrap();

    assert_eq!(ctx.storage.read_gauge("Alloc").await.unwrap().value, Some(1024.0));
    // The second report carries a zero delta, so the server total stays put.
    assert_eq!(ctx.storage.read_counter("PollCount").await.unwrap().delta, Some(3));
    assert_eq!(cache.read_counter("PollCount").await.unwrap().delta, Some(0));
}

#[tokio::test]
async fn mismatched_secrets_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (key_path, encryptor) = key_pair(dir.path());
    let ctx = build_test_context_with(secured_config(&key_path));
    let url = serve(ctx.app.clone()).await;

    let wrong_key = HttpSender::new(url.clone(), Duration::from_secs(5))
        .unwrap()
        .with_hash_key("other")
        .with_encryptor(encryptor.clone())
        .with_real_ip("127.0.0.1");
    let err = wrong_key
        .send(&[Metric::counter("PollCount", 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Status { status, .. } if status == 400), "{err}");

    let outsider = HttpSender::new(url, Duration::from_secs(5))
        .unwrap()
        .with_hash_key("shared")
        .with_encryptor(encryptor)
        .with_real_ip("203.0.113.9");
    let err = outsider
        .send(&[Metric::counter("PollCount", 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Status { status, .. } if status == 403), "{err}");

    assert!(ctx.storage.list_counters().await.unwrap().is_empty());
}
