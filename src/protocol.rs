//! Wire protocol for the live endpoint
//!
//! Message shapes for the bidirectional generate-content channel: setup,
//! realtime input and tool responses going out; the untagged server message
//! union coming in. Field names follow the endpoint's camelCase JSON dialect.

use crate::pcm::WireAudio;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_serialization() {
        let setup = SessionSetup {
            model: "models/tutor-live-001".to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: Some(0.7),
                speech_config: None,
            }),
            system_instruction: Some(Content::system_text("You are a patient language tutor.")),
            tools: None,
            input_audio_transcription: Some(serde_json::json!({})),
            output_audio_transcription: Some(serde_json::json!({})),
        };

        let msg = ClientMessage::Setup(setup);
        let json = msg.to_wire_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["setup"]["model"], "models/tutor-live-001");
        assert_eq!(parsed["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            parsed["setup"]["systemInstruction"]["parts"][0]["text"],
            "You are a patient language tutor."
        );
        assert!(parsed["setup"].get("tools").is_none());
    }

    #[test]
    fn test_realtime_audio_serialization() {
        let msg = ClientMessage::realtime_audio(WireAudio {
            data: "base64data".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        let json = msg.to_wire_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["realtimeInput"]["audio"]["data"], "base64data");
        assert_eq!(parsed["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert!(parsed["realtimeInput"].get("activityStart").is_none());
    }

    #[test]
    fn test_user_text_serialization() {
        let msg = ClientMessage::user_text("hola");
        let json = msg.to_wire_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(parsed["clientContent"]["turns"][0]["parts"][0]["text"], "hola");
        assert_eq!(parsed["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = ClientMessage::tool_response(vec![FunctionResponse {
            id: Some("call-1".to_string()),
            name: "extract_unfamiliar_words".to_string(),
            response: serde_json::json!({"words": ["ubiquitous"]}),
        }]);
        let json = msg.to_wire_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        let fr = &parsed["toolResponse"]["functionResponses"][0];
        assert_eq!(fr["id"], "call-1");
        assert_eq!(fr["name"], "extract_unfamiliar_words");
        assert_eq!(fr["response"]["words"][0], "ubiquitous");
    }

    #[test]
    fn test_server_message_deserialization() {
        let parsed: ServerMessage =
            serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(matches!(parsed, ServerMessage::SetupComplete { .. }));

        let parsed: ServerMessage = serde_json::from_str(
            r#"{"serverContent": {"modelTurn": {"parts": [{"text": "hello"}]}, "turnComplete": true}}"#,
        )
        .unwrap();
        match parsed {
            ServerMessage::Content { server_content } => {
                assert_eq!(server_content["modelTurn"]["parts"][0]["text"], "hello");
                assert_eq!(server_content["turnComplete"], true);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_deserialization() {
        let parsed: ServerMessage = serde_json::from_str(
            r#"{"toolCall": {"functionCalls": [{"id": "c1", "name": "translate", "args": {"text": "hi"}}]}}"#,
        )
        .unwrap();
        match parsed {
            ServerMessage::ToolCall { tool_call } => {
                assert_eq!(tool_call.function_calls.len(), 1);
                let call = &tool_call.function_calls[0];
                assert_eq!(call.id.as_deref(), Some("c1"));
                assert_eq!(call.name, "translate");
                assert_eq!(call.args["text"], "hi");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

/// Generation configuration carried in the setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn system_text(text: &str) -> Self {
        Self {
            role: Some("SYSTEM".to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Session setup sent once after the socket opens.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

/// A chunk of realtime input (audio or streamed text).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<RealtimeAudio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

/// One function call issued by the model.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The model's tool-call batch.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// One result sent back for a function call, correlated by id.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponsePayload {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Setup(SessionSetup),
    RealtimeInput(RealtimeInput),
    ClientContent(serde_json::Value),
    ToolResponse(ToolResponsePayload),
}

impl ClientMessage {
    /// Serialize with the top-level key the endpoint expects.
    pub fn to_wire_json(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            ClientMessage::Setup(setup) => {
                serde_json::json!({ "setup": setup })
            }
            ClientMessage::RealtimeInput(input) => {
                serde_json::json!({ "realtimeInput": input })
            }
            ClientMessage::ClientContent(content) => {
                serde_json::json!({ "clientContent": content })
            }
            ClientMessage::ToolResponse(response) => {
                serde_json::json!({ "toolResponse": response })
            }
        };
        serde_json::to_string(&value)
    }

    /// A realtime-input frame carrying one encoded PCM chunk.
    pub fn realtime_audio(wire: WireAudio) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(RealtimeAudio {
                data: wire.data,
                mime_type: wire.mime_type,
            }),
            ..Default::default()
        })
    }

    /// A complete typed user turn.
    pub fn user_text(text: &str) -> Self {
        ClientMessage::ClientContent(serde_json::json!({
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true
        }))
    }

    /// A tool-response batch answering model-issued function calls.
    pub fn tool_response(responses: Vec<FunctionResponse>) -> Self {
        ClientMessage::ToolResponse(ToolResponsePayload {
            function_responses: responses,
        })
    }
}

/// Server -> client messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    Content {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: ToolCallPayload,
    },
    ToolCallCancellation {
        #[serde(rename = "toolCallCancellation")]
        tool_call_cancellation: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}
