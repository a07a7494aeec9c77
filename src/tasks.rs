use crate::agent_types::{AgentEvent, Pong, UserAudioChunk};
use crate::coordinator::CoordinatorMsg;
use crate::error::AppError;
use crate::twilio_types::{OutboundMediaMeta, TwilioMessage, TwilioOutbound};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub type AgentSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type AgentStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Task that is the funnel of all frames going to the voice-agent socket.
/// Both relay tasks write through this channel, so the initiation override,
/// caller audio and pongs never interleave mid-frame.
pub async fn send_agent_messages(
    mut agent_outbound: mpsc::Receiver<tungstenite::Message>,
    mut agent_sink: AgentSink,
) -> Result<(), AppError> {
    while let Some(frame) = agent_outbound.recv().await {
        agent_sink.send(frame).await.map_err(|e| {
            error!(error=%e, "failed to send frame to voice agent");
            AppError::MediaStream("failed to send frame to voice agent")
        })?;
    }

    Ok(())
}

/// Task that forwards caller audio from the telephony media stream to the
/// voice agent, verbatim base64 passthrough.
pub async fn relay_caller_audio(
    mut twilio_stream: SplitStream<WebSocket>,
    agent_tx: mpsc::Sender<tungstenite::Message>,
) -> Result<(), AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Media { media, .. } => {
                            let chunk = UserAudioChunk {
                                user_audio_chunk: media.payload,
                            };
                            let json = serde_json::to_string(&chunk).map_err(|e| {
                                error!(error=%e, "failed to serialize caller audio chunk");
                                AppError::MediaStream("failed to serialize caller audio chunk")
                            })?;
                            if agent_tx.send(tungstenite::Message::Text(json)).await.is_err() {
                                debug!("agent sink closed; stopping caller audio relay");
                                break Ok(());
                            }
                        }
                        TwilioMessage::Stop {
                            sequence_number, ..
                        } => {
                            debug!("got stop message {sequence_number}");
                            // Ask the funnel to close the agent socket too.
                            let _ = agent_tx.send(tungstenite::Message::Close(None)).await;
                            break Ok(());
                        }
                        _ => {
                            break Err(AppError::MediaStream(
                                "unexpected connected or start frame mid-stream",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to parse telephony text frame");
                        break Err(AppError::MediaStream("undecodable telephony frame"));
                    }
                },
                Ok(Message::Ping(_)) => (),
                Ok(m) => {
                    warn!(message=?m, "unsupported frame type from telephony stream");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to receive frame from telephony stream");
                    break Err(AppError::MediaStream("telephony stream receive error"));
                }
            },
            None => {
                info!("end of telephony media stream");
                let _ = agent_tx.send(tungstenite::Message::Close(None)).await;
                break Ok(());
            }
        }
    }
}

/// Task that translates voice-agent events into telephony media-stream
/// frames and coordinator signals.
pub async fn relay_agent_events(
    mut agent_stream: AgentStream,
    mut twilio_sink: SplitSink<WebSocket, Message>,
    agent_tx: mpsc::Sender<tungstenite::Message>,
    stream_sid: String,
    call_sid: String,
    coordinator: mpsc::Sender<CoordinatorMsg>,
) -> Result<(), AppError> {
    loop {
        match agent_stream.next().await {
            Some(Ok(tungstenite::Message::Text(json))) => {
                let event = match serde_json::from_str::<AgentEvent>(&json) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error=%e, "failed to parse voice-agent event");
                        continue;
                    }
                };
                match event {
                    AgentEvent::ConversationInitiationMetadata { .. } => {
                        info!("voice agent acknowledged conversation initiation");
                        let started = CoordinatorMsg::ConversationStarted {
                            call_sid: call_sid.clone(),
                        };
                        if coordinator.send(started).await.is_err() {
                            debug!("coordinator gone; dropping conversation-started signal");
                        }
                    }
                    AgentEvent::Audio { .. } => {
                        let Some(payload) = event.into_audio_payload() else {
                            debug!("audio event carried no payload");
                            continue;
                        };
                        let outbound = TwilioOutbound::Media {
                            media: OutboundMediaMeta { payload },
                            stream_sid: stream_sid.clone(),
                        };
                        send_twilio_frame(&mut twilio_sink, &outbound).await?;
                        let _ = coordinator
                            .send(CoordinatorMsg::AudioActivity {
                                call_sid: call_sid.clone(),
                            })
                            .await;
                    }
                    AgentEvent::Interruption { .. } => {
                        debug!("caller interrupted the agent; clearing playback");
                        let outbound = TwilioOutbound::Clear {
                            stream_sid: stream_sid.clone(),
                        };
                        send_twilio_frame(&mut twilio_sink, &outbound).await?;
                        let _ = coordinator
                            .send(CoordinatorMsg::AudioActivity {
                                call_sid: call_sid.clone(),
                            })
                            .await;
                    }
                    AgentEvent::Ping { ping_event } => {
                        let Some(ping_event) = ping_event else {
                            continue;
                        };
                        let pong = Pong::answering(ping_event.event_id);
                        let json = serde_json::to_string(&pong).map_err(|e| {
                            error!(error=%e, "failed to serialize pong");
                            AppError::MediaStream("failed to serialize pong")
                        })?;
                        if agent_tx.send(tungstenite::Message::Text(json)).await.is_err() {
                            debug!("agent sink closed; dropping pong");
                        }
                    }
                    AgentEvent::Unknown => {
                        debug!("unhandled voice-agent event type");
                    }
                }
            }
            Some(Ok(tungstenite::Message::Close(_))) => {
                info!("voice agent closed the socket");
                break Ok(());
            }
            Some(Ok(_)) => (),
            Some(Err(e)) => {
                error!(error=%e, "voice-agent transport error");
                break Err(AppError::MediaStream("voice-agent transport error"));
            }
            None => {
                info!("voice-agent stream ended");
                break Ok(());
            }
        }
    }
}

async fn send_twilio_frame(
    twilio_sink: &mut SplitSink<WebSocket, Message>,
    outbound: &TwilioOutbound,
) -> Result<(), AppError> {
    let json = serde_json::to_string(outbound).map_err(|e| {
        error!(error=%e, "failed to serialize telephony outbound frame");
        AppError::MediaStream("failed to serialize telephony outbound frame")
    })?;
    twilio_sink.send(Message::Text(json)).await.map_err(|e| {
        error!(error=%e, "failed to send frame to telephony stream");
        AppError::MediaStream("failed to send frame to telephony stream")
    })
}
