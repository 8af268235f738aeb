use std::net::SocketAddr;
use std::time::Duration;

use callbox_proto::{ClientEnvelope, RelayEnvelope};
use callbox_relay::{app, ConnectionRegistry, HealthStatus, RelayState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let state = RelayState::new(ConnectionRegistry::new());
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.expect("relay serve");
    });
    addr
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("websocket connect");
    socket
}

async fn send(socket: &mut Socket, envelope: &ClientEnvelope) {
    let text = serde_json::to_string(envelope).expect("encode envelope");
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("send envelope");
}

async fn recv(socket: &mut Socket) -> RelayEnvelope {
    let deadline = Duration::from_secs(3);
    loop {
        let frame = timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return RelayEnvelope::parse(text.as_str()).expect("relay envelope parses");
        }
    }
}

async fn expect_silence(socket: &mut Socket) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(300), socket.next()).await
    {
        panic!("expected no delivery, got {text}");
    }
}

async fn register(addr: SocketAddr, identity: &str) -> Socket {
    let mut socket = connect(addr).await;
    send(
        &mut socket,
        &ClientEnvelope::Register {
            user_id: identity.into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut socket).await,
        RelayEnvelope::Registered {
            user_id: identity.into()
        }
    );
    socket
}

async fn health(addr: SocketAddr) -> HealthStatus {
    reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body")
}

async fn wait_for_users(addr: SocketAddr, users: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if health(addr).await.users == users {
            return;
        }
        if Instant::now() >= deadline {
            panic!("registry never reached {users} users");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn offer_and_chat_are_relayed_with_sender_identity() {
    let addr = spawn_relay().await;
    let mut sun = register(addr, "sun-star-3").await;
    let mut ocean = register(addr, "calm-ocean-7").await;

    let offer = json!({"type": "offer", "sdp": "v=0\r\ns=-\r\n"});
    send(
        &mut sun,
        &ClientEnvelope::Offer {
            target: "calm-ocean-7".into(),
            offer: offer.clone(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut ocean).await,
        RelayEnvelope::Offer {
            from: "sun-star-3".into(),
            offer
        }
    );

    send(
        &mut sun,
        &ClientEnvelope::Message {
            target: "calm-ocean-7".into(),
            message: "hi".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut ocean).await,
        RelayEnvelope::Message {
            from: "sun-star-3".into(),
            message: "hi".into()
        }
    );
    expect_silence(&mut sun).await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn health_reports_registered_users() {
    let addr = spawn_relay().await;
    assert_eq!(health(addr).await.users, 0);

    let _sun = register(addr, "sun-star-3").await;
    let status = health(addr).await;
    assert_eq!(status.users, 1);
    assert!(status.status.ends_with("running"));

    let root: HealthStatus = reqwest::get(format!("http://{addr}/"))
        .await
        .expect("root request")
        .json()
        .await
        .expect("root body");
    assert_eq!(root.users, 1);
}

#[test_timeout::tokio_timeout_test(20)]
async fn closed_target_receives_nothing_and_is_unregistered() {
    let addr = spawn_relay().await;
    let mut sun = register(addr, "sun-star-3").await;
    let ocean = register(addr, "calm-ocean-7").await;
    wait_for_users(addr, 2).await;

    drop(ocean);
    wait_for_users(addr, 1).await;

    send(
        &mut sun,
        &ClientEnvelope::Answer {
            target: "calm-ocean-7".into(),
            answer: json!({"type": "answer", "sdp": ""}),
        },
    )
    .await;
    send(
        &mut sun,
        &ClientEnvelope::Candidate {
            target: "never-registered".into(),
            candidate: json!({"candidate": ""}),
        },
    )
    .await;
    expect_silence(&mut sun).await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn newest_registration_wins() {
    let addr = spawn_relay().await;
    let mut sun = register(addr, "sun-star-3").await;
    let mut first = register(addr, "calm-ocean-7").await;
    let mut second = register(addr, "calm-ocean-7").await;

    send(
        &mut sun,
        &ClientEnvelope::Message {
            target: "calm-ocean-7".into(),
            message: "which one?".into(),
        },
    )
    .await;

    assert_eq!(
        recv(&mut second).await,
        RelayEnvelope::Message {
            from: "sun-star-3".into(),
            message: "which one?".into()
        }
    );
    expect_silence(&mut first).await;

    // Closing the orphaned socket leaves the newer binding in place.
    drop(first);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(health(addr).await.users, 2);
}

#[test_timeout::tokio_timeout_test(20)]
async fn malformed_frames_leave_connection_open() {
    let addr = spawn_relay().await;
    let mut socket = connect(addr).await;

    socket
        .send(Message::Text("this is not json".into()))
        .await
        .expect("send garbage");
    socket
        .send(Message::Text(r#"{"type":"dance","target":"x"}"#.into()))
        .await
        .expect("send unknown type");
    expect_silence(&mut socket).await;

    send(
        &mut socket,
        &ClientEnvelope::Register {
            user_id: "still-here".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut socket).await,
        RelayEnvelope::Registered {
            user_id: "still-here".into()
        }
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn api_path_accepts_websocket_clients() {
    let addr = spawn_relay().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/api"))
        .await
        .expect("connect on /api");
    send(
        &mut socket,
        &ClientEnvelope::Register {
            user_id: "via-api".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut socket).await,
        RelayEnvelope::Registered {
            user_id: "via-api".into()
        }
    );
}
