//! TutorLive - realtime conversation engine for a language-tutoring client
//!
//! This crate implements the live half of a language-tutoring application:
//! a duplex session against a speech-in/speech-out AI endpoint. Microphone
//! PCM streams up, synthesized speech streams down with gapless playback and
//! barge-in, streaming transcripts reconcile into an ordered conversation
//! history with debounced persistence, and model-issued tool calls are
//! bridged to backend endpoints without stalling the audio path.

#![forbid(unsafe_code)]

/// Access-credential minting for the live endpoint
pub mod auth;
/// Microphone capture pipeline
pub mod capture;
/// Typed inbound event union
pub mod events;
/// Transcript/history reconciliation and persistence
pub mod history;
/// PCM codec utilities
pub mod pcm;
/// Gapless playback scheduling
pub mod playback;
/// Wire protocol types
pub mod protocol;
/// PulseAudio capture backend (enabled with the "pulse" feature)
#[cfg(feature = "pulse")]
pub mod pulse;
/// The owning session value and event loop
pub mod session;
/// Tool-call dispatch
pub mod tools;
/// Duplex session transport
pub mod transport;

pub use auth::TokenMinter;
pub use capture::{CaptureSource, SilenceSource};
pub use history::{HistoryLog, HttpHistoryStore};
pub use playback::{PlaybackSink, ScheduledFrame};
pub use session::{ConnectionState, LiveSession, SessionError, SessionStatus};
pub use tools::{HttpToolHandler, ToolRegistry};
pub use transport::LiveConfig;
