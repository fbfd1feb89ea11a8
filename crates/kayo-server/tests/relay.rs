//! Real server on an ephemeral port, real WebSocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kayo_core::messages::{FileAnnouncement, OfferRequest};
use kayo_core::{
    ClientMessage, Identity, Role, ServerConfig, ServerMessage, SessionDescription, TargetSelector,
};
use kayo_server::{Registry, SignalingServer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (SocketAddr, std::sync::Arc<Registry>, kayo_server::ShutdownHandle) {
    let config = ServerConfig { bind_address: "127.0.0.1".into(), port: 0, ..ServerConfig::default() };
    let server = SignalingServer::bind(config).await.expect("bind");
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let handle = server.shutdown_handle();
    tokio::spawn(server.run());
    (addr, registry, handle)
}

async fn connect(addr: SocketAddr, key: &str) -> Ws {
    let url = format!("ws://{addr}/?projectID={key}");
    tokio_tungstenite::connect_async(url).await.expect("connect").0
}

async fn send(ws: &mut Ws, msg: ClientMessage) {
    ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
}

async fn next(ws: &mut Ws) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("frame within 5s")
        .expect("stream open")
        .expect("no socket error")
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    match next(ws).await {
        Message::Text(text) => ServerMessage::from_json(&text).expect("server frame parses"),
        other => panic!("expected text, got {other:?}"),
    }
}

async fn silent(ws: &mut Ws) -> bool {
    tokio::time::timeout(Duration::from_millis(200), ws.next()).await.is_err()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn role_of(msg: ServerMessage) -> (Role, u64) {
    match msg {
        ServerMessage::RoleAssignment(a) => (a.role, a.id),
        other => panic!("expected role assignment, got {other:?}"),
    }
}

#[tokio::test]
async fn leader_and_follower_negotiate_through_the_relay() {
    let (addr, registry, _stop) = start().await;

    let mut leader = connect(addr, "abc").await;
    assert_eq!(role_of(recv(&mut leader).await), (Role::Leader, 0));
    let mut follower = connect(addr, "abc").await;
    assert_eq!(role_of(recv(&mut follower).await), (Role::Follower, 1));

    // readiness in the "wrong" order still reaches the leader
    send(&mut follower, ClientMessage::FollowerReady).await;
    send(&mut leader, ClientMessage::LeaderReady).await;
    match recv(&mut leader).await {
        ServerMessage::NewFollower(identity) => assert_eq!(identity.id, 1),
        other => panic!("unexpected {other:?}"),
    }

    send(
        &mut leader,
        ClientMessage::Offer(OfferRequest {
            target: Identity::with_id(1),
            offer: SessionDescription::offer("v=0 leader"),
        }),
    )
    .await;
    let ServerMessage::Offer(offer) = recv(&mut follower).await else {
        panic!("follower should get the offer");
    };
    assert_eq!((offer.origin.id, offer.target.id), (0, 1));
    assert!(offer.origin.origin.is_some(), "origin carries the remote address");

    send(
        &mut follower,
        ClientMessage::Offer(OfferRequest {
            target: offer.origin.clone(),
            offer: SessionDescription::answer("v=0 follower"),
        }),
    )
    .await;
    let ServerMessage::Offer(answer) = recv(&mut leader).await else {
        panic!("leader should get the answer");
    };
    assert_eq!(answer.origin.id, 1);
    assert!(!answer.offer.is_offer());

    drop(leader);
    drop(follower);
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn offer_to_unknown_identity_is_dropped() {
    let (addr, _registry, _stop) = start().await;
    let mut leader = connect(addr, "k").await;
    recv(&mut leader).await;
    let mut follower = connect(addr, "k").await;
    recv(&mut follower).await;

    send(
        &mut leader,
        ClientMessage::Offer(OfferRequest {
            target: Identity::with_id(999),
            offer: SessionDescription::offer("v=0"),
        }),
    )
    .await;
    assert!(silent(&mut follower).await);

    // the sender's connection is still usable
    send(&mut leader, ClientMessage::Text("still here".into())).await;
    send(&mut leader, ClientMessage::LeaderReady).await;
    send(&mut follower, ClientMessage::FollowerReady).await;
    assert!(matches!(recv(&mut leader).await, ServerMessage::NewFollower(_)));
}

#[tokio::test]
async fn missing_session_key_is_rejected_at_handshake() {
    let (addr, registry, _stop) = start().await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect_err("handshake refused");
    match err {
        WsError::Http(response) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("unexpected {other:?}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn signaling_channel_file_goes_to_the_selected_targets() {
    let (addr, _registry, _stop) = start().await;
    let mut leader = connect(addr, "files").await;
    recv(&mut leader).await;
    let mut a = connect(addr, "files").await;
    recv(&mut a).await;
    let mut b = connect(addr, "files").await;
    recv(&mut b).await;

    let ann = FileAnnouncement { target: TargetSelector::AllButSender, file_name: "notes.txt".into() };
    send(&mut a, ClientMessage::StartOfFile(ann.clone())).await;
    a.send(Message::Binary(b"payload".to_vec())).await.unwrap();
    send(&mut a, ClientMessage::EndOfFile(ann)).await;

    for ws in [&mut leader, &mut b] {
        let ServerMessage::StartOfFile(info) = recv(ws).await else { panic!("start expected") };
        assert_eq!(info.file_name, "notes.txt");
        assert_eq!(next(ws).await, Message::Binary(b"payload".to_vec()));
        assert!(matches!(recv(ws).await, ServerMessage::EndOfFile(_)));
    }
    assert!(silent(&mut a).await, "sender is excluded");
}

#[tokio::test]
async fn sessions_are_isolated_by_key() {
    let (addr, registry, _stop) = start().await;
    let mut one = connect(addr, "one").await;
    let mut two = connect(addr, "two").await;
    assert_eq!(role_of(recv(&mut one).await).0, Role::Leader);
    assert_eq!(role_of(recv(&mut two).await).0, Role::Leader);
    wait_until(|| registry.len() == 2).await;
}

#[tokio::test]
async fn shutdown_closes_connections_and_drains() {
    let (addr, registry, stop) = start().await;
    let mut ws = connect(addr, "bye").await;
    recv(&mut ws).await;

    stop.shutdown();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection closed after shutdown");
    assert!(registry.is_empty());
}
