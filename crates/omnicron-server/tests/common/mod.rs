//! Shared test helpers for server integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use omnicron_core::event::Event;
use omnicron_core::mem_journal::MemJournal;
use omnicron_server::bus::EventBus;
use omnicron_server::router::CommandRouter;
use omnicron_server::state::AppState;
use omnicron_test_support::ticker;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State with a `ticker` aggregate over a fresh in-memory journal.
pub fn ticker_state() -> AppState {
    let router = CommandRouter::new().with("ticker", Arc::new(ticker(Arc::new(MemJournal::new()))));
    AppState::new(router, EventBus::new(64))
}

/// Serves `state` on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, omnicron_server::app(state)).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    socket
}

pub async fn send(socket: &mut Socket, message: Value) {
    socket.send(Message::text(message.to_string())).await.unwrap();
}

pub async fn send_command(socket: &mut Socket, command_type: &str, stream: &str) {
    send(socket, json!({"type": command_type, "streamId": stream})).await;
}

/// Next event on `socket`, failing the test after two seconds.
pub async fn recv(socket: &mut Socket) -> Event {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for an event")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Asserts nothing arrives on `socket` for a short while.
pub async fn assert_silent(socket: &mut Socket) {
    let next = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "unexpected message: {next:?}");
}

/// Subscribes and waits until the server has processed the subscription,
/// using a state query as a barrier.
pub async fn subscribe(socket: &mut Socket, stream: &str) {
    send_command(socket, "__Subscribe", stream).await;
    send_command(socket, "__getState", stream).await;
    let reply = recv(socket).await;
    assert_eq!(reply.event_type, "__state");
}
