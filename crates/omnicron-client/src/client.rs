//! WebSocket driver for a [`StreamSubscription`].

use backon::ExponentialBuilder;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use omnicron_core::command::Command;
use omnicron_core::event::Event;
use omnicron_core::stream::StreamId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::subscription::{StreamSubscription, default_backoff};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Buffered events not yet taken by the consumer.
const EVENT_BUFFER: usize = 256;

/// A live subscription to one stream on an Omnicron server.
///
/// The connection runs on a background task that reconnects with backoff
/// after unclean closes and re-subscribes every time it reconnects.
/// Dropping the client unsubscribes and closes the socket.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::Receiver<Result<Event, ClientError>>,
    task: JoinHandle<()>,
}

impl Client {
    /// Subscribes to `stream` on the server at `url` (`ws://host:port/ws`).
    #[must_use]
    pub fn subscribe(url: impl Into<String>, stream: StreamId, token: Option<String>) -> Self {
        Self::subscribe_with_backoff(url, stream, token, default_backoff())
    }

    /// Like [`Client::subscribe`] with a custom reconnect backoff.
    #[must_use]
    pub fn subscribe_with_backoff(
        url: impl Into<String>,
        stream: StreamId,
        token: Option<String>,
        backoff: ExponentialBuilder,
    ) -> Self {
        let (commands, outgoing) = mpsc::unbounded_channel();
        let (incoming, events) = mpsc::channel(EVENT_BUFFER);
        let subscription = StreamSubscription::with_backoff(stream, token, backoff);
        let task = tokio::spawn(drive(url.into(), subscription, outgoing, incoming));
        Self {
            commands,
            events,
            task,
        }
    }

    /// Sends `command`, or queues it until the connection is open.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` once the subscription has ended.
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    /// Waits for the next event. A terminal error is yielded once, after
    /// which the stream ends.
    pub async fn next(&mut self) -> Option<Result<Event, ClientError>> {
        self.events.recv().await
    }

    /// Unsubscribes, closes the socket and waits for the driver to finish.
    pub async fn close(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            warn!(error = %err, "client task failed");
        }
    }
}

enum Session {
    /// The socket dropped without a close handshake.
    Lost,
    /// The subscription is over.
    Ended,
}

async fn drive(
    url: String,
    mut subscription: StreamSubscription,
    mut outgoing: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::Sender<Result<Event, ClientError>>,
) {
    loop {
        let session = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => run(socket, &mut subscription, &mut outgoing, &incoming).await,
            Err(err) => {
                debug!(%url, error = %err, "connect failed");
                Session::Lost
            }
        };
        if matches!(session, Session::Ended) {
            return;
        }

        let Some(delay) = subscription.on_close(false) else {
            let _ = incoming
                .send(Err(ClientError::Connect(format!("could not reach {url}"))))
                .await;
            return;
        };

        // Keep accepting commands while waiting; they queue until reopened.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                command = outgoing.recv() => match command {
                    Some(command) => {
                        if let Err(err) = subscription.send(command) {
                            let _ = incoming.send(Err(err)).await;
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }
}

async fn run(
    socket: Socket,
    subscription: &mut StreamSubscription,
    outgoing: &mut mpsc::UnboundedReceiver<Command>,
    incoming: &mpsc::Sender<Result<Event, ClientError>>,
) -> Session {
    let (mut sink, mut source) = socket.split();

    let Ok(subscribe) = subscription.on_open() else {
        return Session::Ended;
    };
    if write(&mut sink, &subscribe).await.is_err() {
        return Session::Lost;
    }
    while let Some(command) = subscription.next_queued() {
        if write(&mut sink, &command).await.is_err() {
            return Session::Lost;
        }
        subscription.confirm_sent();
    }

    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(command) => match subscription.send(command) {
                    Ok(Some(command)) => {
                        if write(&mut sink, &command).await.is_err() {
                            return Session::Lost;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = incoming.send(Err(err)).await;
                        return Session::Ended;
                    }
                },
                None => {
                    if let Some(unsubscribe) = subscription.unsubscribe() {
                        let _ = write(&mut sink, &unsubscribe).await;
                    }
                    let _ = sink.close().await;
                    return Session::Ended;
                }
            },
            frame = source.next() => match read(frame, subscription) {
                Frame::Event(event) => {
                    if incoming.send(Ok(event)).await.is_err() {
                        subscription.unsubscribe();
                        let _ = sink.close().await;
                        return Session::Ended;
                    }
                }
                Frame::Skip => {}
                Frame::Failed(err) => {
                    let _ = incoming.send(Err(err)).await;
                    let _ = sink.close().await;
                    return Session::Ended;
                }
                Frame::Closed => {
                    subscription.on_close(true);
                    let _ = incoming.send(Err(ClientError::Closed)).await;
                    return Session::Ended;
                }
                Frame::Lost => return Session::Lost,
            },
        }
    }
}

enum Frame {
    Event(Event),
    Skip,
    Failed(ClientError),
    Closed,
    Lost,
}

fn read(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    subscription: &mut StreamSubscription,
) -> Frame {
    match frame {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Event>(text.as_str()) {
            Ok(event) => match subscription.on_event(event) {
                Ok(Some(event)) => Frame::Event(event),
                Ok(None) => Frame::Skip,
                Err(err) => Frame::Failed(err),
            },
            Err(err) => {
                warn!(error = %err, "undecodable event");
                Frame::Skip
            }
        },
        Some(Ok(Message::Close(_))) => Frame::Closed,
        Some(Ok(_)) => Frame::Skip,
        Some(Err(err)) => {
            debug!(error = %err, "socket error");
            Frame::Lost
        }
        None => Frame::Lost,
    }
}

async fn write(
    sink: &mut SplitSink<Socket, Message>,
    command: &Command,
) -> Result<(), ClientError> {
    let text = serde_json::to_string(command).map_err(|e| ClientError::Codec(e.to_string()))?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| ClientError::Codec(e.to_string()))
}
