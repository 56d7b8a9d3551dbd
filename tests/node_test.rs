mod common;

use common::*;
use kurve_identity::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn node_config(authority: &str) -> ConfigBuilder {
    init_tracing();
    ConfigBuilder::new()
        .client_id(CLIENT_ID)
        .redirect_uri(REDIRECT_URI)
        .unwrap()
        .authority(authority)
        .unwrap()
        .client_secret("s3cret")
}

fn node_identity(authority: &str) -> Identity {
    Identity::node(node_config(authority).build().unwrap()).unwrap()
}

/// Walks an anonymous request through the redirect and the code exchange.
async fn sign_in(identity: &Identity, mock_server: &MockServer) {
    sign_in_across(identity, identity, mock_server, 0, 3600).await;
}

/// Starts the login on `first` and delivers the callback to `second`. The
/// access token carries `serial`; the ID token lives `id_lifetime` seconds.
async fn sign_in_across(first: &Identity, second: &Identity, mock_server: &MockServer, serial: usize, id_lifetime: u64) {
    let code = format!("code-{serial}");
    let anonymous = CallbackRequest::from_uri("/reports").unwrap();
    let url = match first.handle_node_callback(&anonymous).await.unwrap() {
        NodeCallback::Redirect(url) => url,
        other => panic!("expected a redirect, got {other:?}"),
    };
    let params = query_params(&url);
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["response_mode"], "query");
    assert_eq!(first.login_state(), LoginState::LoginPending);

    Mock::given(method("POST"))
        .and(path("/common/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(format!("code={code}")))
        .and(body_string_contains("client_secret=s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": "3600",
            "access_token": access_token("https://graph.microsoft.com", 3600, serial),
            "refresh_token": "refresh-1",
            "id_token": id_token(&params["nonce"], id_lifetime),
        })))
        .expect(1)
        .mount(mock_server)
        .await;

    let callback = CallbackRequest::from_uri(&format!("/callback?code={code}&state={}", params["state"])).unwrap();
    let outcome = second.handle_node_callback(&callback).await.unwrap();
    assert_eq!(outcome, NodeCallback::Authenticated);
}

#[tokio::test]
async fn code_is_exchanged_for_a_session() {
    let mock_server = MockServer::start().await;
    let identity = node_identity(&mock_server.uri());

    sign_in(&identity, &mock_server).await;

    assert_eq!(identity.login_state(), LoginState::Authenticated);
    assert!(identity.is_logged_in());
    assert_eq!(
        identity.get_id_token().unwrap().preferred_username.as_deref(),
        Some("ada@contoso.com")
    );
    let anonymous = CallbackRequest::from_uri("/reports").unwrap();
    assert_eq!(
        identity.handle_node_callback(&anonymous).await.unwrap(),
        NodeCallback::Authenticated
    );
}

#[tokio::test]
async fn other_resources_use_the_refresh_token() {
    let mock_server = MockServer::start().await;
    let identity = node_identity(&mock_server.uri());
    sign_in(&identity, &mock_server).await;

    Mock::given(method("POST"))
        .and(path("/common/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("resource=https%3A%2F%2Fmanagement.azure.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": 3600,
            "access_token": access_token("https://management.azure.com", 3600, 1),
            "refresh_token": "refresh-2",
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let first = identity
        .get_access_token_async("https://management.azure.com")
        .await
        .unwrap();
    let second = identity
        .get_access_token_async("https://management.azure.com")
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn unknown_state_is_rejected_without_calling_the_provider() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;
    let identity = node_identity(&mock_server.uri());

    let callback = CallbackRequest::from_uri("/callback?code=auth-code&state=unknown").unwrap();
    let result = identity.handle_node_callback(&callback).await;

    assert!(matches!(result, Err(KurveError::StateMismatch)));
    assert_eq!(identity.login_state(), LoginState::Unauthenticated);
}

#[tokio::test]
async fn form_posted_provider_errors_fail_the_login() {
    let mock_server = MockServer::start().await;
    let identity = node_identity(&mock_server.uri());
    let anonymous = CallbackRequest::from_uri("/").unwrap();
    let NodeCallback::Redirect(url) = identity.handle_node_callback(&anonymous).await.unwrap() else {
        panic!("expected a redirect");
    };

    let body = format!(
        "error=consent_required&error_description=AADSTS65001&state={}",
        query_params(&url)["state"]
    );
    let result = identity
        .handle_node_callback(&CallbackRequest::from_form(&body).unwrap())
        .await;

    assert!(matches!(result, Err(KurveError::InteractionRequired(_))));
    assert_eq!(identity.login_state(), LoginState::Unauthenticated);
}

#[tokio::test]
async fn log_out_clears_the_server_session() {
    let mock_server = MockServer::start().await;
    let identity = node_identity(&mock_server.uri());
    sign_in(&identity, &mock_server).await;

    identity.log_out();

    assert!(!identity.is_logged_in());
    let result = identity.get_access_token_async("https://graph.microsoft.com").await;
    assert!(matches!(result, Err(KurveError::NotAuthenticated)));
}

#[tokio::test]
async fn pending_requests_survive_in_a_shared_store() {
    let mock_server = MockServer::start().await;
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let first = Identity::node(node_config(&mock_server.uri()).store(store.clone()).build().unwrap()).unwrap();
    let second = Identity::node(node_config(&mock_server.uri()).store(store).build().unwrap()).unwrap();

    sign_in_across(&first, &second, &mock_server, 0, 3600).await;

    assert!(second.is_logged_in());
    assert!(!first.is_logged_in());
    let token = second.get_access_token_async("https://graph.microsoft.com").await;
    assert!(token.is_ok());
}

#[tokio::test]
async fn sessions_sharing_a_store_keep_their_own_tokens() {
    let mock_server = MockServer::start().await;
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let alice = Identity::node(node_config(&mock_server.uri()).store(store.clone()).build().unwrap()).unwrap();
    let bob = Identity::node(node_config(&mock_server.uri()).store(store).build().unwrap()).unwrap();
    assert_ne!(alice.session_id(), bob.session_id());

    sign_in_across(&alice, &alice, &mock_server, 111, 3600).await;
    sign_in_across(&bob, &bob, &mock_server, 222, 3600).await;

    let alices = alice.get_access_token_async("https://graph.microsoft.com").await.unwrap();
    let bobs = bob.get_access_token_async("https://graph.microsoft.com").await.unwrap();
    assert_eq!(serial_of(&alices), Some(111));
    assert_eq!(serial_of(&bobs), Some(222));

    bob.log_out();

    let after = alice.get_access_token_async("https://graph.microsoft.com").await.unwrap();
    assert_eq!(after, alices);
}

#[tokio::test]
async fn renewal_without_a_new_id_token_waits_for_the_access_token() {
    let mock_server = MockServer::start().await;
    let config = node_config(&mock_server.uri())
        .renewal_skew(Duration::from_secs(1))
        .build()
        .unwrap();
    let identity = Identity::node(config).unwrap();
    let mut events = identity.renewal_events();
    sign_in_across(&identity, &identity, &mock_server, 0, 3).await;

    Mock::given(method("POST"))
        .and(path("/common/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": "3600",
            "access_token": access_token("https://graph.microsoft.com", 3600, 1),
            "refresh_token": "refresh-2",
        })))
        .mount(&mock_server)
        .await;

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        RenewalEvent::Renewed { expires_at } => assert!(expires_at > now() + 3_000),
        other => panic!("unexpected event {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let refreshes = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| String::from_utf8_lossy(&request.body).contains("grant_type=refresh_token"))
        .count();
    assert_eq!(refreshes, 1);
}

fn serial_of(token: &str) -> Option<u64> {
    kurve_identity::codec::decode(token).unwrap().get("serial")?.as_u64()
}
