pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Connect")]
        Connect(ConnectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ConnectAction {
        #[xmlserde(ty = "untag")]
        pub connection: Connection,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Connection {
        #[xmlserde(name = b"Stream")]
        Stream(StreamAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamAction {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: Option<String>,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<StreamTrack>,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        StreamTrack {
            Inbound => "inbound_track",
            Outbound => "outbound_track",
            Both => "both_tracks",
        }
    }
}
pub use twiml::*;

mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    /// Frames we send down the media stream to Twilio.
    #[derive(Clone, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        Media {
            media: OutboundMediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Clear {
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Clone, Serialize, Deserialize)]
    pub struct OutboundMediaMeta {
        pub payload: String,
    }

    /// Frames Twilio sends up the media stream to us.
    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioMessage {
        Connected {
            protocol: String,
            version: String,
        },
        Start {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            start: StartMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            media: MediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Stop {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            stop: StopMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct StartMeta {
        #[serde(rename = "streamSid")]
        pub stream_sid: String,
        #[serde(rename = "accountSid")]
        pub account_sid: String,
        #[serde(rename = "callSid")]
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        #[serde(rename = "customParameters", default)]
        pub custom_parameters: HashMap<String, String>,
        #[serde(rename = "mediaFormat")]
        pub media_format: MediaFormat,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MediaFormat {
        pub encoding: String,
        #[serde(rename = "sampleRate")]
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Serialize, Deserialize)]
    pub struct MediaMeta {
        pub track: MediaTrack,
        pub chunk: String,
        pub timestamp: String,
        pub payload: String,
    }

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MediaTrack {
        Inbound,
        Outbound,
    }

    #[derive(Serialize, Deserialize)]
    pub struct StopMeta {
        #[serde(rename = "accountSid")]
        pub account_sid: String,
        #[serde(rename = "callSid")]
        pub call_sid: String,
    }
}
pub use ws::*;

mod status {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Initiated,
        Ringing,
        Answered,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        /// A terminal status is one after which the provider will make no
        /// further progress on the call.
        pub fn is_terminal(self) -> bool {
            matches!(
                self,
                CallStatus::Completed
                    | CallStatus::Busy
                    | CallStatus::Failed
                    | CallStatus::NoAnswer
                    | CallStatus::Canceled
            )
        }
    }

    /// Body of the provider's status webhook, form-urlencoded.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusCallbackPayload {
        pub call_sid: String,
        pub call_status: CallStatus,
        pub answered_by: Option<String>,
        pub duration: Option<String>,
    }

    impl StatusCallbackPayload {
        pub fn duration_secs(&self) -> Option<u64> {
            self.duration.as_deref().and_then(|d| d.parse().ok())
        }
    }
}
pub use status::*;
