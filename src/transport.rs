//! Duplex session transport
//!
//! Owns the WebSocket lifecycle for the live endpoint: connect with a
//! short-lived credential, the split reader/writer tasks, and translation of
//! raw server messages into the ordered [`LiveEvent`] stream consumed by the
//! session loop. One reader task preserves arrival order; one writer task
//! serializes every outbound message from all producers.

use crate::auth::EphemeralToken;
use crate::events::LiveEvent;
use crate::protocol::{ClientMessage, Content, GenerationConfig, ServerMessage, SessionSetup};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type WsSinkHalf = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStreamHalf = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("event channel closed")]
    ChannelClosed,

    #[error("setup not acknowledged")]
    SetupNotComplete,

    #[error("timed out waiting for setup")]
    Timeout,
}

/// Configuration for a live connection.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub response_modalities: Vec<String>,
    pub setup_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: None,
            temperature: Some(0.7),
            response_modalities: vec!["AUDIO".to_string()],
            setup_timeout: Duration::from_secs(10),
        }
    }
}

/// An open duplex connection: an ordered inbound event stream plus an
/// outbound message channel shared by all producers.
pub struct LiveConnection {
    events: Option<mpsc::Receiver<Result<LiveEvent, TransportError>>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl LiveConnection {
    /// Dial the endpoint with a freshly minted credential, spawn the
    /// reader/writer tasks and perform the setup handshake.
    pub async fn connect(
        config: &LiveConfig,
        credential: &EphemeralToken,
        tools: Option<serde_json::Value>,
    ) -> Result<Self, TransportError> {
        let url = format!("{}?access_token={}", config.url, credential.token);
        info!("connecting to live endpoint at {}", config.url);

        let (ws, _resp) = connect_async(&url).await.map_err(TransportError::WebSocket)?;
        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel::<Result<LiveEvent, TransportError>>(100);
        let reader = tokio::spawn(read_loop(stream, event_tx));

        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(write_loop(sink, out_rx));

        let mut conn = Self {
            events: Some(event_rx),
            outbound: out_tx,
            reader,
            _writer: writer,
        };
        conn.setup(config, tools).await?;
        info!("live session setup complete");
        Ok(conn)
    }

    /// Send the setup message and wait for the acknowledgment.
    async fn setup(
        &mut self,
        config: &LiveConfig,
        tools: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let setup = SessionSetup {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                temperature: config.temperature,
                speech_config: None,
            }),
            system_instruction: config
                .system_instruction
                .as_deref()
                .map(Content::system_text),
            tools,
            input_audio_transcription: Some(serde_json::json!({})),
            output_audio_transcription: Some(serde_json::json!({})),
        };
        self.outbound
            .send(ClientMessage::Setup(setup))
            .map_err(|_| TransportError::ChannelClosed)?;

        let events = self.events.as_mut().ok_or(TransportError::ChannelClosed)?;
        tokio::time::timeout(config.setup_timeout, async {
            loop {
                match events.recv().await {
                    Some(Ok(LiveEvent::SetupComplete)) => return Ok(()),
                    Some(Ok(other)) => {
                        debug!("ignoring pre-setup event: {:?}", other);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::ChannelClosed),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    /// A handle for sending outbound messages. Clones may be handed to the
    /// capture pipeline and tool dispatcher; the socket closes once every
    /// clone is dropped and the queue drains.
    pub fn outbound(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    /// Take the inbound event stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Result<LiveEvent, TransportError>>> {
        self.events.take()
    }

    /// Stop reading from the socket. Safe to call more than once.
    pub fn shutdown(&self) {
        self.reader.abort();
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Drain the outbound queue onto the socket, then close it.
async fn write_loop(mut sink: WsSinkHalf, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg.to_wire_json() {
            Ok(json) => {
                if let Err(e) = sink.send(Message::text(json)).await {
                    error!("websocket send failed: {}", e);
                    break;
                }
            }
            Err(e) => error!("failed to serialize outbound message: {}", e),
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    debug!("writer task finished");
}

/// Read raw frames and translate them into ordered events.
async fn read_loop(
    mut stream: WsStreamHalf,
    tx: mpsc::Sender<Result<LiveEvent, TransportError>>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if handle_wire_text(&text, &tx).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => {
                // The endpoint sometimes delivers JSON frames as binary.
                match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        if handle_wire_text(&text, &tx).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!("ignoring non-UTF8 binary frame ({} bytes)", bytes.len()),
                }
            }
            Ok(Message::Close(frame)) => {
                info!("websocket closed: {:?}", frame);
                let _ = tx.send(Err(TransportError::ConnectionClosed)).await;
                break;
            }
            Ok(_) => {} // ping/pong
            Err(e) => {
                let _ = tx.send(Err(TransportError::WebSocket(e))).await;
                break;
            }
        }
    }
    debug!("reader task finished");
}

/// Parse one wire frame and emit its events. Returns `Err` only when the
/// event channel is gone and reading should stop.
async fn handle_wire_text(
    text: &str,
    tx: &mpsc::Sender<Result<LiveEvent, TransportError>>,
) -> Result<(), ()> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            // Unknown frames are skipped; they must not kill the session.
            warn!("unparseable server message ({}): {}", e, text);
            return Ok(());
        }
    };

    match message {
        ServerMessage::SetupComplete { .. } => {
            tx.send(Ok(LiveEvent::SetupComplete)).await.map_err(|_| ())?;
        }
        ServerMessage::Content { server_content } => {
            handle_server_content(server_content, tx).await?;
        }
        ServerMessage::ToolCall { tool_call } => {
            tx.send(Ok(LiveEvent::ToolCall(tool_call.function_calls)))
                .await
                .map_err(|_| ())?;
        }
        ServerMessage::ToolCallCancellation { tool_call_cancellation } => {
            info!("tool call cancelled by server: {}", tool_call_cancellation);
        }
        ServerMessage::GoAway { .. } => {
            tx.send(Ok(LiveEvent::GoAway)).await.map_err(|_| ())?;
        }
    }
    Ok(())
}

/// Walk a serverContent payload, which can carry transcriptions, audio,
/// interruption and completion flags in one message.
async fn handle_server_content(
    content: serde_json::Value,
    tx: &mpsc::Sender<Result<LiveEvent, TransportError>>,
) -> Result<(), ()> {
    if let Some(transcription) = content.get("inputTranscription") {
        if let Some(event) = transcription_event(transcription, true) {
            tx.send(Ok(event)).await.map_err(|_| ())?;
        }
    }

    if let Some(transcription) = content.get("outputTranscription") {
        if let Some(event) = transcription_event(transcription, false) {
            tx.send(Ok(event)).await.map_err(|_| ())?;
        }
    }

    if let Some(model_turn) = content.get("modelTurn") {
        let is_complete = content
            .get("generationComplete")
            .and_then(|g| g.as_bool())
            .unwrap_or(false);
        let parts = model_turn.get("parts").and_then(|p| p.as_array());
        for part in parts.into_iter().flatten() {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    tx.send(Ok(LiveEvent::OutputTranscription {
                        text: text.to_string(),
                        is_final: is_complete,
                    }))
                    .await
                    .map_err(|_| ())?;
                }
            } else if let Some(inline) = part.get("inlineData") {
                let data = inline.get("data").and_then(|d| d.as_str());
                if let Some(data) = data {
                    if !data.is_empty() {
                        let mime_type = inline
                            .get("mimeType")
                            .and_then(|m| m.as_str())
                            .unwrap_or("audio/pcm;rate=24000");
                        tx.send(Ok(LiveEvent::AudioDelta {
                            data: data.to_string(),
                            mime_type: mime_type.to_string(),
                        }))
                        .await
                        .map_err(|_| ())?;
                    }
                } else {
                    warn!("inline data part without data field: {:?}", inline);
                }
            }
        }
    }

    if content.get("interrupted").and_then(|i| i.as_bool()) == Some(true) {
        tx.send(Ok(LiveEvent::Interrupted)).await.map_err(|_| ())?;
    }

    if content.get("generationComplete").and_then(|g| g.as_bool()) == Some(true) {
        tx.send(Ok(LiveEvent::GenerationComplete)).await.map_err(|_| ())?;
    }

    if content.get("turnComplete").and_then(|t| t.as_bool()) == Some(true) {
        tx.send(Ok(LiveEvent::TurnComplete)).await.map_err(|_| ())?;
    }

    Ok(())
}

fn transcription_event(transcription: &serde_json::Value, input: bool) -> Option<LiveEvent> {
    let text = match transcription.get("text").and_then(|t| t.as_str()) {
        Some(t) => t.to_string(),
        None => {
            warn!("transcription without text field: {:?}", transcription);
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }

    let is_final = transcription
        .get("isFinal")
        .and_then(|f| f.as_bool())
        .unwrap_or(false);

    Some(if input {
        LiveEvent::InputTranscription { text, is_final }
    } else {
        LiveEvent::OutputTranscription { text, is_final }
    })
}
