use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use handoff_core::signaling::{ClientMessage, JoinRejectReason, ServerMessage};
use handoff_signal::{RoomRegistry, SignalConfig, SignalServer};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, Arc<RoomRegistry>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SignalServer::new(SignalConfig::default());
    let registry = server.registry();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener, token).await;
    });
    (format!("ws://{}/ws", addr), registry, shutdown)
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.expect("Failed to connect");
    socket
}

async fn send(socket: &mut Socket, msg: ClientMessage) {
    socket
        .send(Message::Text(msg.to_json().into()))
        .await
        .unwrap();
}

/// Next signaling message, skipping transport frames
async fn next(socket: &mut Socket) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerMessage>(text.as_str()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    })
    .await
    .expect("Timeout waiting for server message")
}

async fn open_room(url: &str) -> (Socket, handoff_core::Code) {
    let mut owner = connect(url).await;
    send(&mut owner, ClientMessage::CreateRoom).await;
    match next(&mut owner).await {
        ServerMessage::RoomCreated { code, .. } => (owner, code),
        other => panic!("expected room_created, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_is_forwarded_verbatim() {
    let (url, _registry, shutdown) = start_server().await;
    let (mut owner, code) = open_room(&url).await;

    // Sent before anyone joined: parked for the receiver
    let offer = r#"{"kind":"offer","anything":[1,2,3]}"#.to_string();
    send(
        &mut owner,
        ClientMessage::Relay {
            payload: offer.clone(),
        },
    )
    .await;

    let mut receiver = connect(&url).await;
    send(&mut receiver, ClientMessage::JoinRoom { code: code.clone() }).await;
    assert_eq!(next(&mut receiver).await, ServerMessage::Joined { code });
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::Relay { payload: offer }
    );
    assert_eq!(next(&mut owner).await, ServerMessage::PeerJoined);

    send(
        &mut receiver,
        ClientMessage::Relay {
            payload: "answer".to_string(),
        },
    )
    .await;
    assert_eq!(
        next(&mut owner).await,
        ServerMessage::Relay {
            payload: "answer".to_string()
        }
    );

    send(&mut owner, ClientMessage::Ping).await;
    assert_eq!(next(&mut owner).await, ServerMessage::Pong);
    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_joins_over_the_wire() {
    let (url, _registry, shutdown) = start_server().await;
    let (_owner, code) = open_room(&url).await;

    let mut first = connect(&url).await;
    let mut second = connect(&url).await;
    tokio::join!(
        send(&mut first, ClientMessage::JoinRoom { code: code.clone() }),
        send(&mut second, ClientMessage::JoinRoom { code: code.clone() }),
    );
    let (a, b) = tokio::join!(next(&mut first), next(&mut second));

    let outcomes = [a, b];
    let joined = outcomes
        .iter()
        .filter(|m| matches!(m, ServerMessage::Joined { .. }))
        .count();
    let claimed = outcomes
        .iter()
        .filter(|m| {
            **m == ServerMessage::JoinRejected {
                reason: JoinRejectReason::AlreadyClaimed,
            }
        })
        .count();
    assert_eq!((joined, claimed), (1, 1));
    shutdown.cancel();
}

#[tokio::test]
async fn test_closing_socket_acts_as_leave() {
    let (url, registry, shutdown) = start_server().await;
    let (owner, code) = open_room(&url).await;

    let mut receiver = connect(&url).await;
    send(&mut receiver, ClientMessage::JoinRoom { code }).await;
    assert!(matches!(
        next(&mut receiver).await,
        ServerMessage::Joined { .. }
    ));

    // Sender closes the tab mid-handshake
    drop(owner);
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::PeerDisconnected {
            reason: "connection closed".to_string()
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.room_count().await, 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_explicit_leave_carries_reason() {
    let (url, registry, shutdown) = start_server().await;
    let (mut owner, code) = open_room(&url).await;
    let mut receiver = connect(&url).await;
    send(&mut receiver, ClientMessage::JoinRoom { code }).await;
    next(&mut receiver).await;
    next(&mut owner).await;

    send(
        &mut receiver,
        ClientMessage::Leave {
            reason: "user cancelled".to_string(),
        },
    )
    .await;
    assert_eq!(
        next(&mut owner).await,
        ServerMessage::PeerDisconnected {
            reason: "user cancelled".to_string()
        }
    );
    assert_eq!(registry.room_count().await, 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_frame_gets_error() {
    let (url, _registry, shutdown) = start_server().await;
    let mut socket = connect(&url).await;
    socket
        .send(Message::Text(r#"{"type":"teleport"}"#.to_string().into()))
        .await
        .unwrap();
    assert!(matches!(next(&mut socket).await, ServerMessage::Error { .. }));

    send(&mut socket, ClientMessage::Leave { reason: "no room".to_string() }).await;
    send(&mut socket, ClientMessage::Ping).await;
    assert_eq!(next(&mut socket).await, ServerMessage::Pong);
    shutdown.cancel();
}
