use std::time::Duration;

use super::*;
use axum::{body, body::Body, http::Request};
use multiplexer::{MissingFileFetcher, MuxOptions};
use shared::protocol::{ContentMessage, JoinConfig};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

async fn test_state() -> (Arc<AppState>, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (mux, _task) = spawn_multiplexer(
        MuxOptions::default(),
        Arc::new(JsonCodec),
        Arc::new(MissingFileFetcher),
        Arc::new(storage.clone()),
    );
    let state = Arc::new(AppState {
        mux,
        storage: storage.clone(),
    });
    (state, storage)
}

async fn serve(state: Arc<AppState>) -> SocketAddr {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn next_event<S>(stream: &mut S) -> ClientEvent
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("client event json");
        }
    }
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (state, _storage) = test_state().await;
    let app = build_router(state);
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn websocket_client_gets_snapshot_and_request_errors() {
    let (state, _storage) = test_state().await;
    let addr = serve(state).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    assert_eq!(
        next_event(&mut socket).await,
        ClientEvent::Snapshot {
            messages: Vec::new(),
            connection: shared::domain::ConnectionState::Closed,
        }
    );

    socket
        .send(WsMessage::Text("{\"type\":\"nope\"}".to_string()))
        .await
        .expect("send garbage");
    match next_event(&mut socket).await {
        ClientEvent::Error(err) => assert_eq!(err.code, ErrorCode::Decode),
        other => panic!("unexpected event: {other:?}"),
    }

    let join = ClientRequest::Join {
        config: JoinConfig {
            endpoint: "https://chat.example.com/socket".to_string(),
            member_id: "member-1".into(),
            member_name: None,
            eagerly_connect: true,
        },
    };
    socket
        .send(WsMessage::Text(serde_json::to_string(&join).expect("json")))
        .await
        .expect("send join");
    match next_event(&mut socket).await {
        ClientEvent::Error(err) => assert_eq!(err.code, ErrorCode::InvalidEndpoint),
        other => panic!("unexpected event: {other:?}"),
    }

    socket.close(None).await.expect("close");
}

#[tokio::test]
async fn websocket_snapshot_starts_after_last_known_id() {
    let (state, storage) = test_state().await;
    for id in ["m1", "m2"] {
        storage
            .upsert_message(&ContentMessage::plaintext(MessageId::from(id), id))
            .await
            .expect("seed");
    }
    let addr = serve(state).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws?last_known_id=m1"))
        .await
        .expect("connect");

    match next_event(&mut socket).await {
        ClientEvent::Snapshot { messages, .. } => {
            let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["m2"]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
