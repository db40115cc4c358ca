//! TutorLive demo binary
//!
//! Wires the conversation engine from environment variables, connects a live
//! session, and forwards stdin lines as typed messages. With the "pulse"
//! feature enabled the real microphone is used; otherwise the session runs
//! with a silent capture source.

#![forbid(unsafe_code)]

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tutorlive::playback::{PlaybackSink, ScheduledFrame};
use tutorlive::{
    HistoryLog, HttpHistoryStore, HttpToolHandler, LiveConfig, LiveSession, TokenMinter,
    ToolRegistry,
};

/// Logs delivered audio instead of feeding a device; playback output is the
/// embedding application's concern.
struct LoggingSink;

impl PlaybackSink for LoggingSink {
    fn play(&self, frame: ScheduledFrame) {
        info!(
            "playing {:?} of synthesized speech ({} Hz)",
            frame.buffer.duration(),
            frame.buffer.sample_rate
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    info!("starting tutorlive");

    let live_url =
        std::env::var("TUTORLIVE_LIVE_URL").context("TUTORLIVE_LIVE_URL must be set")?;
    let token_url =
        std::env::var("TUTORLIVE_TOKEN_URL").context("TUTORLIVE_TOKEN_URL must be set")?;
    let history_url = std::env::var("TUTORLIVE_HISTORY_URL")
        .context("TUTORLIVE_HISTORY_URL must be set")?;
    let tool_url = std::env::var("TUTORLIVE_TOOL_URL").ok();
    let conversation_key = std::env::var("TUTORLIVE_CONVERSATION")
        .unwrap_or_else(|_| "tutorlive-demo".to_string());

    let config = LiveConfig {
        url: live_url,
        system_instruction: Some(
            "You are a patient language tutor. Speak clearly, correct gently, and \
             flag vocabulary the learner seems unfamiliar with."
                .to_string(),
        ),
        ..Default::default()
    };

    let mut tools = ToolRegistry::new();
    if let Some(url) = tool_url {
        tools.register("extract_unfamiliar_words", Arc::new(HttpToolHandler::new(url)));
    }

    let history = Arc::new(HistoryLog::new(
        Arc::new(HttpHistoryStore::new(history_url)),
        conversation_key,
    ));
    let mut session = LiveSession::new(
        config,
        TokenMinter::new(token_url),
        tools,
        history.clone(),
        Arc::new(LoggingSink),
    );

    #[cfg(feature = "pulse")]
    session
        .connect(tutorlive::pulse::PulseSource::new("tutorlive"))
        .await?;
    #[cfg(not(feature = "pulse"))]
    {
        warn!("built without the pulse feature; capturing silence");
        session.connect(tutorlive::SilenceSource::new()).await?;
    }

    let mut status = session.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow().clone();
            match &current.last_error {
                Some(err) => warn!("session {:?}: {}", current.state, err),
                None => info!("session {:?}", current.state),
            }
        }
    });

    info!("connected; type a message and press enter, Ctrl-C to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = session.send_text(line.trim()) {
                        warn!("could not send: {}", e);
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect();
    info!("tutorlive stopped");
    Ok(())
}
