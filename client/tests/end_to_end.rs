use pretty_assertions::assert_eq;
use serde_json::json;
use storefront_client::StorefrontClient;
use storefront_client::StorefrontConfig;
use storefront_resilience::ErrorKind;
use storefront_resilience::HandleOptions;
use storefront_resilience::RetryKey;
use storefront_session::ApiRequest;
use storefront_session::SessionError;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn fast_config(server: &MockServer) -> StorefrontConfig {
    let mut config = StorefrontConfig::default();
    config.transport.base_url = server.uri();
    config.transport.timeout_ms = 2_000;
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 1_000;
    config
}

#[tokio::test]
async fn rate_limited_request_is_retried_then_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&server)
        .await;

    let client = StorefrontClient::new(fast_config(&server)).unwrap();
    let result = client
        .send(ApiRequest::get("/catalog"), HandleOptions::new("catalog", "browse"))
        .await;

    // 20 + 40 + 80 ms of backoff happened before the error came back.
    assert!(matches!(result, Err(SessionError::Http { status: 429, .. })));
    let records = client.errors().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ErrorKind::RateLimit);
    assert_eq!(records[0].operation, "browse");
    assert_eq!(
        client
            .errors()
            .scheduler()
            .attempts(&RetryKey::new("catalog", "browse")),
        0
    );
    assert_eq!(client.telemetry().snapshot().retries.exhausted, 1);
}

#[tokio::test]
async fn transient_failure_recovers_before_returning() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cart"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cart"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = StorefrontClient::new(fast_config(&server)).unwrap();
    let response = client
        .send(ApiRequest::get("/cart"), HandleOptions::new("cart", "load"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"items": []}));
    assert!(client.errors().records().is_empty());
    assert_eq!(client.telemetry().snapshot().retries.succeeded, 1);
}

#[tokio::test]
async fn permission_failure_is_surfaced_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/admin/products"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let client = StorefrontClient::new(fast_config(&server)).unwrap();
    let result = client
        .send(
            ApiRequest::post("/admin/products", json!({"name": "Lamp"})),
            HandleOptions::new("admin", "create_product"),
        )
        .await;

    assert!(matches!(result, Err(SessionError::Http { status: 403, .. })));
    let records = client.errors().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ErrorKind::Permission);
    assert!(!records[0].retryable);
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let mut config = StorefrontConfig::default();
    config.retry.base_delay_ms = 0;
    assert!(StorefrontClient::new(config).is_err());
}
