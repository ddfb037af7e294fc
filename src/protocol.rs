use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::pcm_codec::{WireChunk, INBOUND_SAMPLE_RATE};

// ======================== Shared ========================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

// ======================== Client → server ========================

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

/// First message on a fresh connection.
#[derive(Serialize, Debug)]
pub struct SetupMessage {
    setup: Setup,
}

impl SetupMessage {
    /// Audio-only session for `model`. A bare model name gets the `models/`
    /// prefix the endpoint expects.
    pub fn audio(model: &str, system_instruction: Option<&str>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        let system_instruction = system_instruction
            .filter(|text| !text.trim().is_empty())
            .map(|text| Content {
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            });

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                },
                system_instruction,
            },
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

/// Streams one captured chunk to the server.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

impl RealtimeInputMessage {
    pub fn media(chunk: &WireChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: Some(chunk.mime_type().to_string()),
                    data: chunk.data().to_string(),
                }],
            },
        }
    }
}

// ======================== Server → client ========================

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Any message the server sends. Unknown fields are ignored.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio carried in the first part of the model turn, if any.
    pub fn audio_chunk(&self) -> Option<WireChunk> {
        let blob = self
            .server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()?;
        Some(WireChunk::from_blob(
            blob.mime_type.as_deref(),
            blob.data.clone(),
            INBOUND_SAMPLE_RATE,
        ))
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .is_some_and(|content| content.turn_complete)
    }

    pub fn interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .is_some_and(|content| content.interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_message_shape() {
        let msg = SetupMessage::audio("gemini-live", Some("Be brief."));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-live",
                    "generationConfig": { "responseModalities": ["AUDIO"] },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn blank_instruction_is_omitted() {
        let msg = SetupMessage::audio("models/x", Some("  "));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["setup"]["model"], "models/x");
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn realtime_input_shape() {
        let chunk = WireChunk::pcm16("AAAA".to_string(), 16000);
        let value = serde_json::to_value(RealtimeInputMessage::media(&chunk)).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAAA" }]
                }
            })
        );
    }

    #[test]
    fn audio_is_taken_from_first_part() {
        let msg = ServerMessage::parse(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AEA="}},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"ignored"}}
            ]}}}"#,
        )
        .unwrap();
        let chunk = msg.audio_chunk().unwrap();
        assert_eq!(chunk.data(), "AEA=");
        assert_eq!(chunk.sample_rate(), 24000);
    }

    #[test]
    fn missing_audio_is_not_an_error() {
        let text_only = ServerMessage::parse(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"}]}}}"#,
        )
        .unwrap();
        assert!(text_only.audio_chunk().is_none());

        let turn_done = ServerMessage::parse(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert!(turn_done.audio_chunk().is_none());
        assert!(turn_done.turn_complete());
        assert!(!turn_done.interrupted());
    }

    #[test]
    fn setup_complete_and_unknown_fields() {
        let msg = ServerMessage::parse(r#"{"setupComplete":{},"usageMetadata":{"x":1}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.audio_chunk().is_none());
    }
}
