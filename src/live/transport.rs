//! # Realtime Transport
//!
//! Opens the bidirectional channel to the voice service and adapts it to two
//! plain queues the session can `select!` on.
//!
//! ## Channel Lifecycle:
//! 1. **Connect**: WebSocket handshake, then the `setup` message
//! 2. **Setup**: wait for `setupComplete` before reporting the channel open
//! 3. **Streaming**: a writer task drains `outbound`; a reader task parses
//!    frames into [`TransportEvent`]s on `inbound`
//! 4. **Close**: dropping the outbound sender sends a close frame; remote
//!    close or errors arrive as `Closed` / `Failed`

use crate::live::error::{LiveError, LiveResult};
use crate::live::protocol::{ClientMessage, ServerMessage};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Something that happened on the inbound side of the channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// A well-formed server message
    Message(ServerMessage),
    /// A frame that could not be parsed; the channel is still usable
    Malformed(LiveError),
    /// The remote side closed the channel
    Closed(Option<String>),
    /// The channel broke
    Failed(LiveError),
}

/// An open channel: client messages go out, events come in.
pub struct LiveChannel {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<TransportEvent>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveChannel {
    /// A channel backed by plain queues, with no I/O tasks attached.
    pub fn new(outbound: mpsc::Sender<ClientMessage>, inbound: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            outbound,
            inbound,
            writer: None,
            reader: None,
        }
    }

    /// Close the outbound side and give the writer a moment to send the
    /// close frame before the reader is cancelled.
    pub async fn close(mut self) {
        let (dead_tx, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.outbound, dead_tx));

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                debug!("Writer did not finish closing in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        for task in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Opens realtime channels.
///
/// The returned future performs the whole handshake, `setup` included; the
/// session bounds it with its connect timeout.
pub trait LiveConnector: Send + Sync {
    fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, LiveResult<LiveChannel>>;
}

/// Connector for the Gemini Live WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    url: String,
    api_key: String,
    queue_capacity: usize,
}

/// What a WebSocket frame means to the session.
enum Frame {
    Json(String),
    Skip,
    Close(Option<String>),
}

fn classify(message: Message) -> LiveResult<Frame> {
    match message {
        Message::Text(text) => Ok(Frame::Json(text)),
        Message::Binary(bytes) => String::from_utf8(bytes)
            .map(Frame::Json)
            .map_err(|_| LiveError::Decode("binary frame is not UTF-8 JSON".to_string())),
        Message::Close(frame) => Ok(Frame::Close(
            frame.map(|f| f.reason.to_string()).filter(|reason| !reason.is_empty()),
        )),
        _ => Ok(Frame::Skip),
    }
}

impl GeminiLiveConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn endpoint(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, self.api_key)
    }
}

impl LiveConnector for GeminiLiveConnector {
    fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, LiveResult<LiveChannel>> {
        let endpoint = self.endpoint();
        let capacity = self.queue_capacity;

        Box::pin(async move {
            let (socket, _) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
            let (mut sink, mut stream) = socket.split();

            sink.send(Message::Text(setup.to_json()?)).await?;

            // Nothing may be sent before the service acknowledges setup
            loop {
                let message = match stream.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(LiveError::Transport("channel closed during setup".to_string())),
                };
                match classify(message) {
                    Ok(Frame::Json(text)) => {
                        let parsed = ServerMessage::parse(&text)
                            .map_err(|e| LiveError::Transport(format!("unexpected setup reply: {}", e)))?;
                        if parsed.setup_complete.is_some() {
                            break;
                        }
                    }
                    Ok(Frame::Skip) => {}
                    Ok(Frame::Close(reason)) => {
                        return Err(LiveError::Transport(format!(
                            "channel closed during setup: {}",
                            reason.unwrap_or_else(|| "no reason given".to_string())
                        )));
                    }
                    Err(e) => return Err(LiveError::Transport(e.to_string())),
                }
            }
            info!("Realtime channel open");

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(capacity);
            let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(capacity);

            let writer_events = inbound_tx.clone();
            let writer = tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        let _ = writer_events.send(TransportEvent::Failed(e.into())).await;
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                debug!("Realtime writer finished");
            });

            let reader = tokio::spawn(async move {
                loop {
                    let event = match stream.next().await {
                        Some(Ok(message)) => match classify(message) {
                            Ok(Frame::Json(text)) => match ServerMessage::parse(&text) {
                                Ok(parsed) => TransportEvent::Message(parsed),
                                Err(e) => TransportEvent::Malformed(e),
                            },
                            Ok(Frame::Skip) => continue,
                            Ok(Frame::Close(reason)) => TransportEvent::Closed(reason),
                            Err(e) => TransportEvent::Malformed(e),
                        },
                        Some(Err(e)) => TransportEvent::Failed(e.into()),
                        None => TransportEvent::Closed(None),
                    };

                    let terminal = matches!(event, TransportEvent::Closed(_) | TransportEvent::Failed(_));
                    if inbound_tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
            });

            Ok(LiveChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
                writer: Some(writer),
                reader: Some(reader),
            })
        })
    }
}
