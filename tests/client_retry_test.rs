// tests/client_retry_test.rs

use multisocks_dl::client::{RobustClient, build_transport};
use multisocks_dl::config::AppConfig;
use multisocks_dl::proxy::ProxyEndpoint;

#[tokio::test(flavor = "multi_thread")]
async fn test_client_retries_transient_server_errors() {
    // --- 1. Arrange (准备阶段) ---
    let mut server = mockito::Server::new_async().await;
    let server_url = server.url();

    // 默认测试配置只重试一次，因此应恰好收到两次请求
    let mock_503 = server
        .mock("HEAD", "/busy")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let config = AppConfig::default();
    let client = RobustClient::new(&config, None).expect("Failed to create client");

    // --- 2. Act (执行阶段) ---
    let response = client
        .head(format!("{}/busy", server_url))
        .await
        .expect("重试耗尽后应返回最后一次响应");

    // --- 3. Assert (断言阶段) ---
    assert_eq!(response.status(), 503);
    mock_503.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_raw_client_does_not_retry() {
    // --- 1. Arrange ---
    let mut server = mockito::Server::new_async().await;
    let mock_503 = server
        .mock("GET", "/busy")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let client = RobustClient::new(&AppConfig::default(), None).unwrap();

    // --- 2. Act ---
    let response = client
        .raw()
        .get(format!("{}/busy", server.url()))
        .send()
        .await
        .unwrap();

    // --- 3. Assert ---
    assert_eq!(response.status(), 503);
    mock_503.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_byte_request_sends_range_header() {
    // --- 1. Arrange ---
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/file")
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", "bytes 0-0/42")
        .with_body("x")
        .expect(1)
        .create_async()
        .await;
    let client = RobustClient::new(&AppConfig::default(), None).unwrap();

    // --- 2. Act ---
    let response = client
        .get_first_byte(format!("{}/file", server.url()))
        .await
        .unwrap();

    // --- 3. Assert ---
    assert_eq!(response.status(), 206);
    mock.assert_async().await;
}

#[test]
fn test_build_transport_labels() {
    let config = AppConfig::default();
    let endpoint = ProxyEndpoint::new("hk", "127.0.0.1", 1080).unwrap();

    let direct = build_transport(&config, None).unwrap();
    let proxied = build_transport(&config, Some(&endpoint)).unwrap();

    assert_eq!(direct.proxy_name(), None);
    assert_eq!(direct.label(), "直连");
    assert_eq!(proxied.proxy_name(), Some("hk"));
    assert_eq!(proxied.label(), "代理 hk");
}
