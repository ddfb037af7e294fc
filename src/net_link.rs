use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, tungstenite};
use url::Url;

use crate::audio::pcm_codec::WireChunk;
use crate::config::LiveConfig;
use crate::error::SessionError;
use crate::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};

#[derive(Debug)]
pub enum NetEvent {
    /// A parsed server message.
    Server(ServerMessage),
    /// The peer closed the connection normally.
    Closed(Option<String>),
    /// Transport failure or abnormal close.
    Failed(String),
}

#[derive(Debug)]
pub enum NetCommand {
    Media(WireChunk),
    Close,
}

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Full,
    Closed,
}

/// Session-side ends of an open live channel.
///
/// Outbound sends never wait; the queue in front of the socket is the only
/// buffering on the send path.
pub struct LiveChannel {
    commands: Option<mpsc::Sender<NetCommand>>,
    events: mpsc::Receiver<NetEvent>,
}

impl LiveChannel {
    pub fn new(commands: mpsc::Sender<NetCommand>, events: mpsc::Receiver<NetEvent>) -> Self {
        Self {
            commands: Some(commands),
            events,
        }
    }

    pub fn send_media(&self, chunk: WireChunk) -> SendOutcome {
        let Some(commands) = &self.commands else {
            return SendOutcome::Closed;
        };
        match commands.try_send(NetCommand::Media(chunk)) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Next event from the link. A link task that vanished without a word
    /// reads as a failure.
    pub async fn recv(&mut self) -> NetEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => NetEvent::Failed("link task ended".into()),
        }
    }

    /// Ask the link to close. The socket shuts down in the background.
    /// Returns false if the channel was already closed.
    pub fn close(&mut self) -> bool {
        match self.commands.take() {
            Some(commands) => {
                // If the queue is full, dropping the sender still ends the link.
                let _ = commands.try_send(NetCommand::Close);
                true
            }
            None => false,
        }
    }
}

/// Opens live channels. The session calls this once per `start`.
#[async_trait]
pub trait LiveConnector {
    async fn connect(&self) -> Result<LiveChannel, SessionError>;
}

/// WebSocket connector for the Gemini Live endpoint.
pub struct NetLink {
    config: LiveConfig,
    outbound_queue: usize,
}

impl NetLink {
    pub fn new(config: LiveConfig, outbound_queue: usize) -> Self {
        Self {
            config,
            outbound_queue: outbound_queue.max(1),
        }
    }

    fn endpoint(&self) -> Result<Url, SessionError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| SessionError::ChannelOpenFailure("no API key configured".into()))?;
        let mut url = Url::parse(&self.config.ws_url)
            .map_err(|e| SessionError::ChannelOpenFailure(format!("bad ws_url: {}", e)))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }
}

#[async_trait]
impl LiveConnector for NetLink {
    async fn connect(&self) -> Result<LiveChannel, SessionError> {
        let url = self.endpoint()?;
        // The query string carries the key, so only the host is logged.
        log::info!("Connecting to {}...", url.host_str().unwrap_or("live endpoint"));

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::ChannelOpenFailure(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let setup = SetupMessage::audio(
            &self.config.model,
            Some(self.config.system_instruction.as_str()),
        );
        let setup_json = serde_json::to_string(&setup)
            .map_err(|e| SessionError::ChannelOpenFailure(e.to_string()))?;
        log::debug!("Sending setup: {}", setup_json);
        write
            .send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| SessionError::ChannelOpenFailure(e.to_string()))?;

        let timeout = Duration::from_millis(self.config.setup_timeout_ms);
        match tokio::time::timeout(timeout, wait_for_setup(&mut read)).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = write.close().await;
                return Err(SessionError::ChannelOpenFailure(format!(
                    "no setupComplete within {} ms",
                    self.config.setup_timeout_ms
                )));
            }
        }
        log::info!("Live channel ready (model {})", self.config.model);

        let (cmd_tx, cmd_rx) = mpsc::channel(self.outbound_queue);
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(run_link(write, read, cmd_rx, event_tx));

        Ok(LiveChannel::new(cmd_tx, event_rx))
    }
}

type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;
type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

async fn wait_for_setup<S>(read: &mut S) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| SessionError::ChannelOpenFailure(e.to_string()))?;
        match msg {
            Message::Close(frame) => {
                return Err(SessionError::ChannelOpenFailure(format!(
                    "server closed during setup: {}",
                    describe_close(frame.as_ref())
                )));
            }
            other => {
                if let Some(Ok(server)) = server_payload(&other).map(ServerMessage::parse) {
                    if server.is_setup_complete() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Err(SessionError::ChannelOpenFailure(
        "connection ended during setup".into(),
    ))
}

// 主循环，处理读取和写入
async fn run_link(
    mut write: WsWrite,
    mut read: WsRead,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    event_tx: mpsc::Sender<NetEvent>,
) {
    loop {
        tokio::select! {
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Close(frame))) => Some(close_event(frame.as_ref())),
                    Some(Ok(other)) => {
                        match server_payload(&other).map(ServerMessage::parse) {
                            Some(Ok(server)) => {
                                if event_tx.send(NetEvent::Server(server)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => log::warn!("Ignoring unparsable server message: {}", e),
                            None => {}
                        }
                        None
                    }
                    Some(Err(e)) => Some(NetEvent::Failed(e.to_string())),
                    None => Some(NetEvent::Closed(None)),
                };
                if let Some(event) = event {
                    let _ = event_tx.send(event).await;
                    break;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NetCommand::Media(chunk)) => {
                        let json = match serde_json::to_string(&RealtimeInputMessage::media(&chunk)) {
                            Ok(json) => json,
                            Err(e) => {
                                log::error!("Failed to serialize audio chunk: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            let _ = event_tx.send(NetEvent::Failed(e.to_string())).await;
                            break;
                        }
                    }
                    Some(NetCommand::Close) | None => {
                        log::debug!("Closing live channel");
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Live channel task finished");
}

/// JSON text of a data frame. The server may send JSON in binary frames.
fn server_payload(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

fn close_event(frame: Option<&CloseFrame>) -> NetEvent {
    let reason = frame.map(|f| describe_close(Some(f)));
    match frame.map(|f| f.code) {
        None | Some(CloseCode::Normal) | Some(CloseCode::Away) => NetEvent::Closed(reason),
        Some(_) => NetEvent::Failed(describe_close(frame)),
    }
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) if f.reason.is_empty() => format!("code {}", u16::from(f.code)),
        Some(f) => format!("code {}: {}", u16::from(f.code), f.reason.as_str()),
        None => "no close frame".to_string(),
    }
}
