//! Resource client tests against mock token and resource servers

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::Client;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_oauth_bridge::error::{AuthErrorKind, ResourceError};
use mcp_oauth_bridge::oauth::{ClientAuthMethod, Credential, OAuthTokenManager, TokenEndpoint, TokenStore};
use mcp_oauth_bridge::resource::ResourceClient;
use mcp_oauth_bridge::retry::RetryPolicy;

fn token_manager(token_server: &MockServer, dir: &Path, stored: Option<Credential>) -> Arc<OAuthTokenManager> {
    let store = TokenStore::new(dir.join("credential.json"));
    if let Some(ref credential) = stored {
        store.save(credential).unwrap();
    }
    let endpoint = TokenEndpoint::new(
        Client::new(),
        format!("{}/token", token_server.uri()),
        "client".to_string(),
        "secret".to_string(),
        ClientAuthMethod::default_order(),
    );
    OAuthTokenManager::new(endpoint, store, Duration::from_secs(60), RetryPolicy::disabled())
}

fn valid_credential() -> Credential {
    Credential::from_response(
        "at-1".to_string(),
        Some("Bearer".to_string()),
        Some("rt-1".to_string()),
        Some(3600),
        None,
    )
}

fn client_for(resource: &MockServer, tokens: Arc<OAuthTokenManager>) -> ResourceClient {
    let headers = HashMap::from([("x-tenant".to_string(), "acme".to_string())]);
    ResourceClient::new(
        &format!("{}/mcp", resource.uri()),
        &headers,
        Duration::from_secs(2),
        tokens,
    )
    .unwrap()
}

async fn mount_refresh(token_server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-2",
            "refresh_token": "rt-2",
            "expires_in": 3600
        })))
        .expect(expected_calls)
        .mount(token_server)
        .await;
}

#[tokio::test]
async fn call_sends_bearer_and_unwraps_result() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-1"))
        .and(header("x-tenant", "acme"))
        .and(header_exists("mcp-protocol-version"))
        .and(body_partial_json(json!({"jsonrpc": "2.0", "method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": [{"name": "search"}]}
        })))
        .expect(1)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    let result = client.call("tools/list", None).await.unwrap();
    assert_eq!(result, json!({"tools": [{"name": "search"}]}));
}

#[tokio::test]
async fn second_rejection_is_auth_rejected_after_one_refresh() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    mount_refresh(&token_server, 1).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    match client.call("tools/call", Some(json!({"name": "search"}))).await {
        Err(ResourceError::AuthRejected { status, auth_kind, .. }) => {
            assert_eq!(status, Some(401));
            assert_eq!(auth_kind, None);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn rejection_refreshes_and_retries_with_new_token() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    mount_refresh(&token_server, 1).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&resource)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "ok"
        })))
        .expect(1)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let tokens = token_manager(&token_server, dir.path(), Some(valid_credential()));
    let client = client_for(&resource, Arc::clone(&tokens));

    assert_eq!(client.call("ping", None).await.unwrap(), json!("ok"));
    assert_eq!(tokens.status().refreshes, 1);
}

#[tokio::test]
async fn concurrent_rejections_share_one_refresh() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    mount_refresh(&token_server, 1).await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&resource)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": 1})))
        .expect(5)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(client_for(
        &resource,
        token_manager(&token_server, dir.path(), Some(valid_credential())),
    ));

    let results = futures::future::join_all((0..5).map(|_| {
        let client = Arc::clone(&client);
        async move { client.call("tools/list", None).await }
    }))
    .await;
    assert!(results.iter().all(Result::is_ok));
}

#[tokio::test]
async fn other_statuses_are_upstream_errors() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .expect(1)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    match client.call("tools/list", None).await {
        Err(ResourceError::Upstream { status, body }) => {
            assert_eq!(status, 502);
            assert_eq!(body, "bad gateway");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let token_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = ResourceClient::new(
        &format!("http://127.0.0.1:{port}/mcp"),
        &HashMap::new(),
        Duration::from_secs(2),
        token_manager(&token_server, dir.path(), Some(valid_credential())),
    )
    .unwrap();

    assert!(matches!(
        client.call("tools/list", None).await,
        Err(ResourceError::Unavailable(_))
    ));
}

#[tokio::test]
async fn slow_server_times_out_as_unavailable() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = ResourceClient::new(
        &format!("{}/mcp", resource.uri()),
        &HashMap::new(),
        Duration::from_millis(200),
        token_manager(&token_server, dir.path(), Some(valid_credential())),
    )
    .unwrap();

    assert!(matches!(
        client.call("tools/list", None).await,
        Err(ResourceError::Unavailable(_))
    ));
}

#[tokio::test]
async fn missing_credential_never_reaches_server() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), None));

    match client.call("tools/list", None).await {
        Err(ResourceError::AuthRejected { status, auth_kind, .. }) => {
            assert_eq!(status, None);
            assert_eq!(auth_kind, Some(AuthErrorKind::InvalidGrant));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn remote_error_object_is_returned() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32602, "message": "unknown tool", "data": {"name": "x"}}
        })))
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    match client.call("tools/call", Some(json!({"name": "x"}))).await {
        Err(ResourceError::Remote(error)) => {
            assert_eq!(error.code, -32602);
            assert_eq!(error.data, Some(json!({"name": "x"})));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn event_stream_response_is_decoded() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    let body = "event: message\n\
                data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[]}}\n\n";
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    assert_eq!(
        client.call("tools/call", None).await.unwrap(),
        json!({"content": []})
    );
}

#[tokio::test]
async fn session_id_is_echoed() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "s-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 2, "result": "second"})))
        .expect(1)
        .mount(&resource)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "s-1")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "first"})),
        )
        .up_to_n_times(1)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    assert_eq!(client.call("initialize", None).await.unwrap(), json!("first"));
    assert_eq!(client.session_id().as_deref(), Some("s-1"));
    assert_eq!(client.call("tools/list", None).await.unwrap(), json!("second"));
}

#[tokio::test]
async fn notification_accepts_empty_202() {
    let token_server = MockServer::start().await;
    let resource = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&resource)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&resource, token_manager(&token_server, dir.path(), Some(valid_credential())));

    client.notify("notifications/initialized", None).await.unwrap();
    let requests = resource.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("id").is_none());
}
