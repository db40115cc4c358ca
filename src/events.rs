//! Typed inbound events delivered by the transport to the session loop.

use crate::protocol::FunctionCall;

/// One event from the live endpoint, in arrival order.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// The endpoint acknowledged session setup.
    SetupComplete,
    /// A base64 PCM chunk of synthesized speech.
    AudioDelta { data: String, mime_type: String },
    /// Partial or final transcription of the user's audio.
    InputTranscription { text: String, is_final: bool },
    /// Partial or final text of the model's speech.
    OutputTranscription { text: String, is_final: bool },
    /// The model finished generating for the current turn.
    GenerationComplete,
    /// The current turn is over for both roles.
    TurnComplete,
    /// The model's output was cut off by user activity.
    Interrupted,
    /// The model wants one or more tools invoked.
    ToolCall(Vec<FunctionCall>),
    /// The server will close the connection soon.
    GoAway,
}
