use std::time::Duration;

use realtime_sync::api::{HttpMarketplaceApi, MarketplaceApi, MessageType, SendChatRequest};
use realtime_sync::core::{RealtimeError, Role, Session};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api(server: &MockServer) -> HttpMarketplaceApi {
    HttpMarketplaceApi::new(&format!("{}/api", server.uri()), Duration::from_secs(5)).unwrap()
}

fn json(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/json")
}

fn request(text: &str) -> SendChatRequest {
    SendChatRequest {
        receiver_id: "peer".into(),
        message_text: text.into(),
        message_type: MessageType::Text,
    }
}

#[tokio::test]
async fn notifications_use_role_path_paging_and_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/servicer/notifications"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "20"))
        .and(header("authorization", "Bearer tok-9"))
        .respond_with(json(
            r#"{"notifications":[
                {"_id":"n2","title":"Paid","message":"Payment received","notification_type":"payment",
                 "created_at":"2024-05-01T08:02:00Z"},
                {"id":"n1","title":"Booked","is_read":true}
            ],"total":2}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let session = Session::new("tok-9", "u1", Role::Servicer);
    let items = api(&server).fetch_notifications(&session, 2, 20).await.unwrap();
    let ids: Vec<&str> = items.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["n2", "n1"]);
    assert_eq!(items[0].notification_type.as_deref(), Some("payment"));
    assert!(items[0].created_at.is_some());
    assert!(items[1].is_read);
}

#[tokio::test]
async fn chat_history_is_read_from_customer_booking_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/customer/bookings/b1/chat"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(json(
            r#"{"messages":[{"_id":"m1","sender_id":"peer","message_text":"hi","created_at":"2024-05-01T08:00:00Z"}]}"#,
        ))
        .mount(&server)
        .await;

    let session = Session::new("tok", "me", Role::Customer);
    let history = api(&server).fetch_chat(&session, "b1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message_text, "hi");
    assert_eq!(history[0].booking_id, None);
}

#[tokio::test]
async fn send_accepts_wrapped_and_bare_responses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/customer/bookings/b1/chat"))
        .and(body_string_contains(r#""message_text":"wrapped""#))
        .respond_with(json(
            r#"{"success":true,"message":{"_id":"m7","sender_id":"me","message_text":"wrapped"}}"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/customer/bookings/b1/chat"))
        .and(body_string_contains(r#""message_text":"bare""#))
        .respond_with(json(r#"{"_id":"m8","sender_id":"me","message_text":"bare"}"#))
        .mount(&server)
        .await;

    let session = Session::new("tok", "me", Role::Customer);
    let client = api(&server);
    assert_eq!(client.send_chat(&session, "b1", request("wrapped")).await.unwrap().id, "m7");
    assert_eq!(client.send_chat(&session, "b1", request("bare")).await.unwrap().id, "m8");

    let received = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&received[0].body).to_string();
    assert!(body.contains(r#""receiver_id":"peer""#));
    assert!(body.contains(r#""message_type":"text""#));
}

#[tokio::test]
async fn http_errors_map_to_poll_and_send_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("receiver missing"))
        .mount(&server)
        .await;

    let session = Session::new("tok", "me", Role::Customer);
    let client = api(&server);
    match client.fetch_notifications(&session, 1, 20).await {
        Err(RealtimeError::PollFailure { endpoint, error }) => {
            assert_eq!(endpoint, "/api/customer/notifications");
            assert!(error.contains("503"));
            assert!(error.contains("maintenance"));
        }
        other => panic!("expected poll failure, got {other:?}"),
    }
    assert!(matches!(
        client.fetch_chat(&session, "b1").await,
        Err(RealtimeError::PollFailure { .. })
    ));
    match client.send_chat(&session, "b1", request("hi")).await {
        Err(RealtimeError::SendFailure { message }) => assert!(message.contains("422")),
        other => panic!("expected send failure, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_body_is_a_poll_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(json("<html>oops</html>"))
        .mount(&server)
        .await;

    let session = Session::new("tok", "me", Role::Servicer);
    match api(&server).fetch_notifications(&session, 1, 20).await {
        Err(RealtimeError::PollFailure { error, .. }) => assert!(error.starts_with("decode")),
        other => panic!("expected decode failure, got {other:?}"),
    }
}
