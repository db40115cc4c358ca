//! Live session
//!
//! The owning value for one duplex conversation: connection state machine,
//! microphone pipeline, playback scheduler, history reconciliation and tool
//! dispatch, driven by a single event loop that applies inbound transport
//! events strictly in arrival order. Tool handlers and persistence run on
//! their own tasks and never block that loop.

use crate::auth::{AuthError, TokenMinter};
use crate::capture::{CaptureError, CapturePipeline, CaptureSource, SessionFlags, DEFAULT_FRAME_SAMPLES};
use crate::events::LiveEvent;
use crate::history::{HistoryLog, Role};
use crate::pcm;
use crate::playback::{PlaybackScheduler, PlaybackSink};
use crate::protocol::ClientMessage;
use crate::tools::ToolRegistry;
use crate::transport::{LiveConfig, LiveConnection, TransportError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Connection lifecycle of a session. A failed or closed session goes back
/// to `Disconnected`; reconnecting means a fresh `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// User-visible session status published over a watch channel.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// One live conversation, owned by the surface that created it.
pub struct LiveSession {
    config: LiveConfig,
    minter: TokenMinter,
    tools: Arc<ToolRegistry>,
    history: Arc<HistoryLog>,
    playback: Arc<PlaybackScheduler>,
    flags: Arc<SessionFlags>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    status_rx: watch::Receiver<SessionStatus>,
    connection: Option<LiveConnection>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    capture: Option<CapturePipeline>,
    loop_task: Option<JoinHandle<()>>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        minter: TokenMinter,
        tools: ToolRegistry,
        history: Arc<HistoryLog>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            last_error: None,
        });
        Self {
            config,
            minter,
            tools: Arc::new(tools),
            history,
            playback: Arc::new(PlaybackScheduler::new(sink)),
            flags: Arc::new(SessionFlags::default()),
            status_tx: Arc::new(status_tx),
            status_rx,
            connection: None,
            outbound: None,
            capture: None,
            loop_task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Subscribe to user-visible status updates.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn history(&self) -> Arc<HistoryLog> {
        self.history.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.flags.is_muted()
    }

    /// Mute gates the microphone (frames dropped) and the output gain;
    /// capture and playback scheduling keep running while silenced.
    pub fn set_muted(&self, muted: bool) {
        self.flags.muted.store(muted, Ordering::Relaxed);
        self.playback.set_muted(muted);
    }

    /// Mint a fresh credential, dial the endpoint, start the microphone and
    /// spawn the event loop. On any failure the session lands back in
    /// `Disconnected` with the error surfaced in the status.
    pub async fn connect(&mut self, source: impl CaptureSource) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        self.set_status(ConnectionState::Connecting, None);

        let token = match self.minter.mint().await {
            Ok(token) => token,
            Err(e) => {
                self.set_status(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e.into());
            }
        };

        let mut connection =
            match LiveConnection::connect(&self.config, &token, self.tool_declarations()).await {
                Ok(conn) => conn,
                Err(e) => {
                    self.set_status(ConnectionState::Disconnected, Some(e.to_string()));
                    return Err(e.into());
                }
            };

        let events = connection
            .take_events()
            .ok_or(SessionError::Transport(TransportError::ChannelClosed))?;
        let outbound = connection.outbound();

        let (error_tx, error_rx) = mpsc::channel::<CaptureError>(4);
        let capture = match CapturePipeline::start(
            source,
            self.flags.clone(),
            outbound.clone(),
            error_tx,
            DEFAULT_FRAME_SAMPLES,
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                connection.shutdown();
                self.set_status(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e.into());
            }
        };

        self.flags.connected.store(true, Ordering::Relaxed);
        self.set_status(ConnectionState::Connected, None);
        info!("live session connected");

        let ctx = EventLoopCtx {
            playback: self.playback.clone(),
            history: self.history.clone(),
            tools: self.tools.clone(),
            outbound: outbound.clone(),
            status: self.status_tx.clone(),
            flags: self.flags.clone(),
        };
        self.loop_task = Some(tokio::spawn(run_event_loop(events, error_rx, ctx)));
        self.connection = Some(connection);
        self.outbound = Some(outbound);
        self.capture = Some(capture);
        Ok(())
    }

    /// Send a typed message. The user item is appended locally (final,
    /// manual) before transmission so the UI reflects it instantly. While
    /// disconnected this rejects and leaves the history untouched.
    pub fn send_text(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(SessionError::NotConnected)?;
        self.history.append_manual(text);
        outbound
            .send(ClientMessage::user_text(text))
            .map_err(|_| SessionError::NotConnected)
    }

    /// Tear the session down: stop the microphone, cut playback, close the
    /// socket and cancel pending persistence. Safe to call repeatedly and
    /// from a teardown path.
    pub fn disconnect(&mut self) {
        self.flags.connected.store(false, Ordering::Relaxed);
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.playback.interrupt();
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        self.outbound = None;
        self.history.close();
        if self.state() != ConnectionState::Disconnected {
            self.set_status(ConnectionState::Disconnected, None);
            info!("live session disconnected");
        }
    }

    fn tool_declarations(&self) -> Option<serde_json::Value> {
        let names = self.tools.names();
        if names.is_empty() {
            return None;
        }
        let declarations: Vec<_> = names
            .into_iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        Some(serde_json::json!([{ "functionDeclarations": declarations }]))
    }

    fn set_status(&self, state: ConnectionState, last_error: Option<String>) {
        self.status_tx.send_replace(SessionStatus { state, last_error });
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct EventLoopCtx {
    playback: Arc<PlaybackScheduler>,
    history: Arc<HistoryLog>,
    tools: Arc<ToolRegistry>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    status: Arc<watch::Sender<SessionStatus>>,
    flags: Arc<SessionFlags>,
}

/// Apply inbound events strictly in arrival order. Capture device errors are
/// folded in as connection-level failures.
async fn run_event_loop(
    mut events: mpsc::Receiver<Result<LiveEvent, TransportError>>,
    mut capture_errors: mpsc::Receiver<CaptureError>,
    ctx: EventLoopCtx,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => {
                    mark_disconnected(&ctx, Some("connection closed".to_string()));
                    break;
                }
                Some(Err(e)) => {
                    error!("transport failed: {}", e);
                    mark_disconnected(&ctx, Some(e.to_string()));
                    break;
                }
                Some(Ok(event)) => handle_event(event, &ctx),
            },
            Some(e) = capture_errors.recv() => {
                error!("capture failed mid-session: {}", e);
                mark_disconnected(&ctx, Some(e.to_string()));
                break;
            }
        }
    }
}

fn handle_event(event: LiveEvent, ctx: &EventLoopCtx) {
    match event {
        LiveEvent::AudioDelta { data, mime_type } => {
            let rate = pcm::rate_from_mime(&mime_type).unwrap_or(pcm::OUTPUT_SAMPLE_RATE);
            match pcm::decode_from_wire(&data, rate, 1) {
                Ok(buffer) => ctx.playback.enqueue(buffer),
                // A bad chunk is dropped; later chunks still play.
                Err(e) => warn!("dropping malformed audio chunk: {}", e),
            }
        }
        LiveEvent::InputTranscription { text, is_final } => {
            ctx.history.apply_transcription(Role::User, &text, is_final);
        }
        LiveEvent::OutputTranscription { text, is_final } => {
            ctx.history.apply_transcription(Role::Model, &text, is_final);
        }
        LiveEvent::GenerationComplete => {
            ctx.history.finalize_role(Role::Model);
        }
        LiveEvent::TurnComplete => {
            ctx.history.finalize_all();
        }
        LiveEvent::Interrupted => {
            ctx.playback.interrupt();
            ctx.history.finalize_role(Role::Model);
        }
        LiveEvent::ToolCall(calls) => {
            for call in &calls {
                ctx.history.append_function_call(&call.name, &call.args);
            }
            ctx.tools.dispatch(calls, ctx.outbound.clone());
        }
        LiveEvent::SetupComplete => {}
        LiveEvent::GoAway => {
            info!("server announced imminent disconnect");
        }
    }
}

fn mark_disconnected(ctx: &EventLoopCtx, last_error: Option<String>) {
    ctx.flags.connected.store(false, Ordering::Relaxed);
    ctx.status.send_replace(SessionStatus {
        state: ConnectionState::Disconnected,
        last_error,
    });
}
