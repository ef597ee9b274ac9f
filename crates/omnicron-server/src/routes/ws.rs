//! WebSocket endpoint.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::{HOST, USER_AGENT};
use axum::response::Response;
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use omnicron_core::event::Event;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::state::AppState;

/// Returns the WebSocket router, served at `/` and `/ws`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, headers: HeaderMap) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let ip = header("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_owned()))
        .or_else(|| header(HOST.as_str()));
    let agent = header(USER_AGENT.as_str());

    ws.on_upgrade(move |socket| serve(socket, Connection::new(state, ip, agent)))
}

/// Drives one socket until either side closes it.
async fn serve(socket: WebSocket, mut connection: Connection) {
    let mut broadcasts = connection.state().bus.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    for reply in connection.on_text(text.as_str()).await {
                        if let Err(err) = send(&mut sender, &reply).await {
                            debug!(connection = %connection.id(), error = %err, "send failed, closing");
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection = %connection.id(), error = %err, "socket error");
                    return;
                }
            },
            broadcast = broadcasts.recv() => match broadcast {
                Ok(event) if connection.wants(&event) => {
                    if let Err(err) = send(&mut sender, &event).await {
                        debug!(connection = %connection.id(), error = %err, "send failed, closing");
                        return;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection = %connection.id(), skipped, "connection lagged behind the event bus");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, event: &Event) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(|err| {
        error!(stream = %event.stream_id, error = %err, "event serialization failed");
        axum::Error::new(err)
    })?;
    sender.send(Message::Text(text.into())).await
}
