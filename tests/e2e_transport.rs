//! End-to-end transport tests.
//!
//! A real server on ephemeral ports, driven by [`EdgeClient`] over TCP and
//! QUIC, plus the HTTP admin API.

use std::time::Duration;

use offload::codec::{Algorithm, Compressor};
use offload::config::Config;
use offload::inference::{ClassificationModel, LayerStack, Model, Precision, Tensor};
use offload::protocol::{Action, Fragment, ERROR_KEY};
use offload::server::{Engine, Server, ServerHandle};
use offload::transport::TransportKind;
use offload::EdgeClient;
use serde_json::Value;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.port = 0;
    config.server.admin_port = Some(0);
    config.server.max_workers = 4;
    config
}

fn test_engine() -> Engine {
    let model = Model::Classification(ClassificationModel::new(
        LayerStack::identity(),
        vec!["cat".into(), "dog".into(), "fox".into(), "owl".into()],
        3,
    ));
    Engine::new(model, Compressor::default())
}

async fn start(config: Config) -> ServerHandle {
    Server::with_engine(config, test_engine())
        .start()
        .await
        .expect("server starts")
}

async fn stop(handle: ServerHandle) {
    handle.shutdown();
    timeout(TEST_TIMEOUT, handle.wait())
        .await
        .expect("server stops in time")
        .expect("clean shutdown");
}

fn activation() -> Tensor {
    Tensor::new(vec![1, 4], vec![0.5, 3.0, -1.0, 0.25]).unwrap()
}

#[tokio::test]
async fn test_tcp_offload_uncompressed() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr().expect("tcp enabled");

    let mut client = EdgeClient::connect(addr).await.unwrap();
    let payload = activation().to_bytes(Precision::Full);
    let response = timeout(TEST_TIMEOUT, client.offload("cam-1", &payload, 0, 7, false))
        .await
        .unwrap()
        .unwrap();

    assert!(!response.is_error());
    assert_eq!(response.keypairs["start_layer"], 0);
    assert_eq!(response.keypairs["top_class"], 1);
    let json = response.results_json().unwrap();
    assert_eq!(json["items"][0]["label"], "dog");
    assert_eq!(json["items"].as_array().unwrap().len(), 3);

    client.end("cam-1").await.unwrap();
    client.close().await.unwrap();
    stop(handle).await;
}

#[tokio::test]
async fn test_tcp_offload_compressed_half_precision() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr().unwrap();

    let packed = Compressor::new(Algorithm::Brotli)
        .with_precision(Precision::Half)
        .pack_tensor(&activation())
        .unwrap();

    let mut client = EdgeClient::connect(addr).await.unwrap();
    let response = timeout(TEST_TIMEOUT, client.offload("cam-2", &packed, 0, 5, true))
        .await
        .unwrap()
        .unwrap();
    assert!(!response.is_error());
    assert_eq!(response.keypairs["top_class"], 1);

    // Same session, second frame of video
    let next = Tensor::new(vec![1, 4], vec![0.0, 0.0, 0.0, 9.0]).unwrap();
    let packed = Compressor::new(Algorithm::Zlib).pack_tensor(&next).unwrap();
    let response = client.offload("cam-2", &packed, 0, 64, true).await.unwrap();
    assert_eq!(response.keypairs["top_class"], 3);

    client.close().await.unwrap();
    stop(handle).await;
}

#[tokio::test]
async fn test_error_response_keeps_stream_open() {
    let handle = start(test_config()).await;
    let mut client = EdgeClient::connect(handle.local_addr().unwrap())
        .await
        .unwrap();

    // Inference with nothing assembled
    client
        .send(&Fragment::new("early").with_action(Action::Inference))
        .await
        .unwrap();
    let response = timeout(TEST_TIMEOUT, client.recv())
        .await
        .unwrap()
        .unwrap()
        .expect("error response");
    assert_eq!(response.id, "early");
    assert_eq!(response.keypairs[ERROR_KEY], 1);

    // Layer past the end of the model
    let payload = activation().to_bytes(Precision::Full);
    let response = client.offload("late", &payload, 9, 1024, false).await.unwrap();
    assert_eq!(response.keypairs[ERROR_KEY], 3);

    // The stream still serves valid requests
    let response = client.offload("ok", &payload, 0, 1024, false).await.unwrap();
    assert!(!response.is_error());

    client.close().await.unwrap();
    stop(handle).await;
}

#[tokio::test]
async fn test_concurrent_streams() {
    let handle = start(test_config()).await;
    let addr = handle.local_addr().unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        tasks.push(tokio::spawn(async move {
            let mut client = EdgeClient::connect(addr).await.unwrap();
            let mut values = vec![0.0f32; 4];
            values[i] = 5.0;
            let payload = Tensor::new(vec![1, 4], values)
                .unwrap()
                .to_bytes(Precision::Full);
            let response = client.offload("shared-id", &payload, 0, 3, false).await.unwrap();
            client.close().await.unwrap();
            (i, response.keypairs["top_class"])
        }));
    }

    // The same id on different streams names different sessions
    for task in tasks {
        let (i, top) = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(top, i as i32);
    }
    stop(handle).await;
}

#[tokio::test]
async fn test_admin_api() {
    let handle = start(test_config()).await;
    let admin = handle.admin_addr().expect("admin enabled");

    let mut client = EdgeClient::connect(handle.local_addr().unwrap())
        .await
        .unwrap();
    let payload = activation().to_bytes(Precision::Full);
    client.offload("cam", &payload, 0, 2, false).await.unwrap();

    let http = reqwest::Client::new();
    let health: Value = http
        .get(format!("http://{admin}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let status: Value = http
        .get(format!("http://{admin}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["experiment"], "classification");
    assert_eq!(status["transport"], "TCP");
    assert_eq!(status["num_layers"], 0);
    assert_eq!(status["inferences"], 1);
    assert!(status["fragments_processed"].as_u64().unwrap() > 1);
    assert_eq!(status["active_streams"], 1);

    drop(http);
    client.close().await.unwrap();
    stop(handle).await;
}

#[tokio::test]
async fn test_shutdown_closes_idle_stream() {
    let handle = start(test_config()).await;
    let mut client = EdgeClient::connect(handle.local_addr().unwrap())
        .await
        .unwrap();
    client
        .send(&Fragment::new("cam").with_chunk(&b"partial"[..]))
        .await
        .unwrap();

    stop(handle).await;
    let closed = timeout(TEST_TIMEOUT, client.recv()).await.unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_quic_offload() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let mut config = test_config();
    config.server.transport = TransportKind::Both;
    config.server.quic_port = 0;
    config.server.tls_cert = Some(cert_path);
    config.server.tls_key = Some(key_path);
    let handle = start(config).await;
    assert!(handle.local_addr().is_some());
    let quic_addr = handle.quic_addr().expect("quic enabled");

    let root = rustls::Certificate(cert.serialize_der().unwrap());
    let mut client = timeout(
        TEST_TIMEOUT,
        EdgeClient::connect_quic(quic_addr, "localhost", &[root]),
    )
    .await
    .unwrap()
    .unwrap();

    let packed = Compressor::new(Algorithm::Zlib)
        .pack_tensor(&activation())
        .unwrap();
    let response = timeout(TEST_TIMEOUT, client.offload("drone", &packed, 0, 16, true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.keypairs["top_class"], 1);

    client.end("drone").await.unwrap();
    client.close().await.unwrap();
    stop(handle).await;
}
