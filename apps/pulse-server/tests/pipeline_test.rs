mod common;

use serde_json::json;

use pulse_server::config::RateLimitConfig;

#[tokio::test]
async fn welcome_announces_protocol() {
    let server = common::start(common::test_config(), common::test_services()).await;
    let (_ws, welcome) = common::connect(&server).await;
    assert_eq!(welcome["version"], "1.0.0");
    assert_eq!(welcome["requiresAuth"], false);
    assert!(welcome["serverTime"].as_i64().unwrap() > 0);

    let server_auth =
        common::start(common::test_config(), common::with_auth(common::test_services())).await;
    let (_ws, welcome) = common::connect(&server_auth).await;
    assert_eq!(welcome["requiresAuth"], true);
}

#[tokio::test]
async fn malformed_frames_leave_connection_usable() {
    let server = common::start(common::test_config(), common::test_services()).await;
    let (mut ws, _) = common::connect(&server).await;

    use futures_util::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Text("{oops".into()))
        .await
        .unwrap();
    let err = common::next_reply(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["id"], 0);
    assert_eq!(err["code"], "PARSE_ERROR");

    let err = common::request(&mut ws, json!([1, 2, 3])).await;
    assert_eq!(err["code"], "PARSE_ERROR");

    let err = common::request(&mut ws, json!({"type": "store.get"})).await;
    assert_eq!(err["code"], "INVALID_REQUEST");

    let err = common::request(&mut ws, json!({"id": 7, "type": ""})).await;
    assert_eq!(err["code"], "INVALID_REQUEST");
    assert_eq!(err["id"], 7);

    let err = common::request(&mut ws, json!({"id": 8, "type": "nope.nothing"})).await;
    assert_eq!(err["code"], "UNKNOWN_OPERATION");

    let ok = common::request(
        &mut ws,
        json!({"id": 9, "type": "store.set", "bucket": "b", "key": "k", "value": true}),
    )
    .await;
    assert_eq!(ok, json!({"id": 9, "type": "result", "data": true}));
}

#[tokio::test]
async fn responses_keep_request_order() {
    let server = common::start(common::test_config(), common::test_services()).await;
    let (mut ws, _) = common::connect(&server).await;

    for id in 1..=20 {
        common::send_json(
            &mut ws,
            json!({"id": id, "type": "store.set", "bucket": "b", "key": "k", "value": id}),
        )
        .await;
    }
    for id in 1..=20 {
        let reply = common::next_reply(&mut ws).await;
        assert_eq!(reply["id"], id);
    }
}

#[tokio::test]
async fn authentication_and_authorization() {
    let server =
        common::start(common::test_config(), common::with_auth(common::test_services())).await;
    let (mut ws, _) = common::connect(&server).await;

    let err = common::request(&mut ws, json!({"id": 1, "type": "store.list", "bucket": "b"})).await;
    assert_eq!(err["code"], "UNAUTHORIZED");

    let login = common::request(
        &mut ws,
        json!({"id": 2, "type": "auth.login", "token": "token-alice"}),
    )
    .await;
    assert_eq!(login["data"]["userId"], "alice");

    let ok = common::request(&mut ws, json!({"id": 3, "type": "store.list", "bucket": "b"})).await;
    assert_eq!(ok["type"], "result");

    let denied =
        common::request(&mut ws, json!({"id": 4, "type": "store.list", "bucket": "secrets"})).await;
    assert_eq!(denied["code"], "FORBIDDEN");

    let who = common::request(&mut ws, json!({"id": 5, "type": "auth.whoami"})).await;
    assert_eq!(who["data"]["authenticated"], true);
}

#[tokio::test]
async fn rate_limit_applies_per_key() {
    let config = pulse_server::config::ServerConfig {
        rate_limit: Some(RateLimitConfig {
            max_requests: 3,
            window_ms: 1000,
        }),
        ..common::test_config()
    };
    let server = common::start(config, common::with_auth(common::test_services())).await;
    let (mut ws, _) = common::connect(&server).await;

    // Unauthenticated requests still count against the IP.
    for id in 1..=2 {
        let reply = common::request(&mut ws, json!({"id": id, "type": "auth.whoami"})).await;
        assert_eq!(reply["type"], "result");
    }
    let login = common::request(
        &mut ws,
        json!({"id": 3, "type": "auth.login", "token": "token-bob"}),
    )
    .await;
    assert_eq!(login["type"], "result");

    // Fresh budget under the user id.
    for id in 4..=6 {
        let reply =
            common::request(&mut ws, json!({"id": id, "type": "store.list", "bucket": "b"})).await;
        assert_eq!(reply["type"], "result", "request {id}");
    }
    let limited =
        common::request(&mut ws, json!({"id": 7, "type": "store.list", "bucket": "b"})).await;
    assert_eq!(limited["code"], "RATE_LIMITED");
    assert!(limited["details"]["retryAfterMs"].as_u64().unwrap() > 0);

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let again =
        common::request(&mut ws, json!({"id": 8, "type": "store.list", "bucket": "b"})).await;
    assert_eq!(again["type"], "result");
}

#[tokio::test]
async fn subscription_pushes_follow_changes() {
    let server = common::start(common::test_config(), common::test_services()).await;
    let (mut watcher, _) = common::connect(&server).await;
    let (mut writer, _) = common::connect(&server).await;

    let sub = common::request(
        &mut watcher,
        json!({"id": 1, "type": "store.subscribe", "bucket": "todos"}),
    )
    .await;
    let subscription_id = sub["data"]["subscriptionId"].as_str().unwrap().to_string();
    assert_eq!(sub["data"]["initial"], json!({}));

    common::request(
        &mut writer,
        json!({"id": 1, "type": "store.set", "bucket": "todos", "key": "a", "value": 1}),
    )
    .await;

    let push = common::next_reply(&mut watcher).await;
    assert_eq!(push["type"], "push");
    assert_eq!(push["channel"], "subscription");
    assert_eq!(push["subscriptionId"], subscription_id.as_str());
    assert_eq!(push["data"], json!({"a": 1}));

    let done = common::request(
        &mut watcher,
        json!({"id": 2, "type": "store.unsubscribe", "subscriptionId": subscription_id}),
    )
    .await;
    assert_eq!(done["data"]["unsubscribed"], true);
}

#[tokio::test]
async fn unconfigured_rules_engine_is_unavailable() {
    let server = common::start(common::test_config(), common::test_services()).await;
    let (mut ws, _) = common::connect(&server).await;
    let err = common::request(&mut ws, json!({"id": 1, "type": "rules.emit", "topic": "x"})).await;
    assert_eq!(err["code"], "RULES_UNAVAILABLE");
}
