//! Wire types for the conversational-AI provider's streaming socket.

use serde::{Deserialize, Serialize};

/// First message on a fresh agent socket: overrides the agent prompt and
/// opening line for this specific call.
#[derive(Serialize, Debug)]
pub struct InitiationMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
    conversation_config_override: ConversationConfigOverride,
}

#[derive(Serialize, Debug)]
struct ConversationConfigOverride {
    agent: AgentOverride,
}

#[derive(Serialize, Debug)]
struct AgentOverride {
    prompt: PromptOverride,
    first_message: String,
}

#[derive(Serialize, Debug)]
struct PromptOverride {
    prompt: String,
}

const FIRST_MESSAGE: &str = "Hola soy Karyme te hablo de Getnet, y quisiera ofrecerte una de \
     nuestras terminales, ¿te interesaría saber un poco mas sobre nuestra propuesta?";

impl InitiationMessage {
    pub fn for_call(name: &str, phone_number: &str) -> Self {
        let prompt = format!(
            "Eres un agente que vende punto de venta de Getnet y siempre busca cerrar una venta \
             mas, eres amable y profesional, así mismo intentas siempre hacer preguntas cortas \
             para determinar si es o no un prospecto para venta. Tienes un objetivo, el cual es \
             decidir si es o no un prospecto, si es un prospecto debes recopilar su numero, y su \
             nombre, mencionándole que en un momento le contactaran para cerrar el proceso de \
             venta. El cliente se llama {name} y su numero es {phone_number}."
        );
        Self {
            message_type: "conversation_initiation_client_data",
            conversation_config_override: ConversationConfigOverride {
                agent: AgentOverride {
                    prompt: PromptOverride { prompt },
                    first_message: FIRST_MESSAGE.to_string(),
                },
            },
        }
    }
}

/// Caller audio forwarded to the agent.  This message carries no `type` tag.
#[derive(Serialize, Debug)]
pub struct UserAudioChunk {
    pub user_audio_chunk: String,
}

/// Liveness reply; must echo the `event_id` of the ping it answers.
#[derive(Serialize, Debug)]
pub struct Pong {
    #[serde(rename = "type")]
    message_type: &'static str,
    pub event_id: u64,
}

impl Pong {
    pub fn answering(event_id: u64) -> Self {
        Self {
            message_type: "pong",
            event_id,
        }
    }
}

/// Events the agent sends us.  The provider has shipped audio under two
/// different shapes, so both are modeled and normalized in
/// [`AgentEvent::into_audio_payload`].
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: Option<serde_json::Value>,
    },
    Audio {
        #[serde(default)]
        audio: Option<AudioChunk>,
        #[serde(default)]
        audio_event: Option<AudioEventPayload>,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Option<serde_json::Value>,
    },
    Ping {
        #[serde(default)]
        ping_event: Option<PingEvent>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
pub struct AudioChunk {
    pub chunk: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AudioEventPayload {
    pub audio_base_64: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct PingEvent {
    pub event_id: u64,
}

impl AgentEvent {
    /// Base64 audio payload of an `audio` event, whichever shape it arrived
    /// in.  `None` for any other event or an audio event with no payload.
    pub fn into_audio_payload(self) -> Option<String> {
        match self {
            AgentEvent::Audio { audio, audio_event } => audio
                .and_then(|a| a.chunk)
                .or_else(|| audio_event.and_then(|e| e.audio_base_64)),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct SignedUrlResponse {
    pub signed_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_event_direct_chunk_shape() {
        let json = r#"{"type": "audio", "audio": {"chunk": "Zm9v"}}"#;
        let event: AgentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.into_audio_payload().as_deref(), Some("Zm9v"));
    }

    #[test]
    fn audio_event_wrapped_shape() {
        let json = r#"{"type": "audio", "audio_event": {"audio_base_64": "YmFy"}}"#;
        let event: AgentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.into_audio_payload().as_deref(), Some("YmFy"));
    }

    #[test]
    fn audio_event_without_payload() {
        let json = r#"{"type": "audio"}"#;
        let event: AgentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.into_audio_payload(), None);
    }

    #[test]
    fn ping_event_carries_id() {
        let json = r#"{"type": "ping", "ping_event": {"event_id": 42}}"#;
        match serde_json::from_str::<AgentEvent>(json).unwrap() {
            AgentEvent::Ping { ping_event } => {
                assert_eq!(ping_event.unwrap().event_id, 42);
            }
            _ => panic!("expected ping"),
        }
    }

    #[test]
    fn pong_echoes_event_id() {
        let json = serde_json::to_string(&Pong::answering(42)).unwrap();
        assert!(json.contains(r#""type":"pong""#));
        assert!(json.contains(r#""event_id":42"#));
    }

    #[test]
    fn unrecognized_types_map_to_unknown() {
        let json = r#"{"type": "agent_response", "agent_response_event": {}}"#;
        assert!(matches!(
            serde_json::from_str::<AgentEvent>(json).unwrap(),
            AgentEvent::Unknown
        ));
    }

    #[test]
    fn initiation_message_embeds_call_context() {
        let message = InitiationMessage::for_call("Ana", "+5212345678901");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"conversation_initiation_client_data""#));
        assert!(json.contains("Ana"));
        assert!(json.contains("+5212345678901"));
        assert!(json.contains("first_message"));
    }
}
