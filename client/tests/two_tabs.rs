use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use storefront_client::StorefrontClient;
use storefront_client::StorefrontConfig;
use storefront_session::ApiRequest;
use storefront_session::ReqwestTransport;
use storefront_session::Session;
use storefront_state_bus::MemoryBroadcastHub;
use storefront_state_bus::keys;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn config_for(server: &MockServer) -> StorefrontConfig {
    let mut config = StorefrontConfig::default();
    config.transport.base_url = server.uri();
    config.transport.timeout_ms = 2_000;
    config
}

fn tab(config: &StorefrontConfig, hub: &MemoryBroadcastHub) -> StorefrontClient {
    let transport = Arc::new(ReqwestTransport::new(&config.transport).unwrap());
    StorefrontClient::with_components(
        config.clone(),
        transport,
        hub.open(&config.bus.channel_name),
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn refresh_in_one_tab_updates_the_other_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/account/orders"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user": {"id": 9}})))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let hub = MemoryBroadcastHub::default();
    let tab_a = tab(&config, &hub);
    let tab_b = tab(&config, &hub);

    let response = tab_a
        .api()
        .send(ApiRequest::get("/account/orders").refresh_on_unauthorized())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    settle().await;

    let expected = Session {
        authenticated: true,
        profile: Some(json!({"id": 9})),
    };
    assert_eq!(tab_a.session().session(), expected);
    assert_eq!(tab_b.session().session(), expected);
    assert_eq!(
        tab_b.bus().current(keys::SESSION_CHANGED),
        Some(json!({"authenticated": true, "profile": {"id": 9}}))
    );

    // Original call, refresh and replay, all from tab A.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(tab_b.bus().stats().posted, 0);
}

#[tokio::test]
async fn logout_in_one_tab_ends_the_session_everywhere() {
    let server = MockServer::start().await;
    let config = config_for(&server);
    let hub = MemoryBroadcastHub::default();
    let tab_a = tab(&config, &hub);
    let tab_b = tab(&config, &hub);

    tab_a.session().mark_authenticated(Some(json!({"id": 1})));
    settle().await;
    assert!(tab_b.session().session().authenticated);

    tab_a.session().logout();
    settle().await;
    assert_eq!(tab_b.session().session(), Session::default());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn error_banner_is_shared_across_tabs() {
    let server = MockServer::start().await;
    let config = config_for(&server);
    let hub = MemoryBroadcastHub::default();
    let tab_a = tab(&config, &hub);
    let tab_b = tab(&config, &hub);

    tab_a.report(
        &storefront_resilience::RawFailure::http(403, "forbidden"),
        storefront_resilience::HandleOptions::new("admin", "open"),
    );
    settle().await;

    assert_eq!(
        tab_b.bus().current(keys::ERROR_BANNER),
        Some(json!({"visible": true, "count": 1, "severity": "high"}))
    );
    assert!(tab_b.errors().records().is_empty());
}
