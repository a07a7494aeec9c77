use crate::agent_types::{InitiationMessage, SignedUrlResponse};
use crate::coordinator::CoordinatorMsg;
use crate::error::{handle_error, AppError};
use crate::store::ContactedRecord;
use crate::tasks::{
    relay_agent_events, relay_caller_audio, send_agent_messages, AgentSink, AgentStream,
};
use crate::twilio_types::{
    wrap_twiml, ConnectAction, Connection, Response, ResponseAction, StartMeta, StatusCallbackPayload,
    StreamAction, TwilioMessage,
};
use crate::types::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use futures_util::stream::{SplitStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::client::IntoClientRequest};
use tracing::{debug, error, info, trace, warn};

const SIGNED_URL_ENDPOINT: &str =
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url";
const SIGNED_URL_TIMEOUT: Duration = Duration::from_secs(10);

/// Placeholder number the agent tooling uses during dry runs; registering it
/// would pollute the contacted table.
const PLACEHOLDER_NUMBER: &str = "5212345678901";

/// Fire-and-forget trigger for the next outbound call.
pub async fn outbound_call(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    if app_state
        .coordinator
        .send(CoordinatorMsg::Trigger)
        .await
        .is_err()
    {
        error!("coordinator is not running");
    }
    Json(json!({ "success": true }))
}

/// Provider status webhook.  Always answers success, whatever happened
/// internally, so the provider does not retry-storm us.
pub async fn call_status(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "status callback body");
    match serde_urlencoded::from_str::<StatusCallbackPayload>(&body) {
        Ok(payload) => {
            let msg = CoordinatorMsg::StatusCallback {
                duration_secs: payload.duration_secs(),
                call_sid: payload.call_sid,
                status: payload.call_status,
                answered_by: payload.answered_by,
            };
            if app_state.coordinator.send(msg).await.is_err() {
                error!("coordinator is not running");
            }
        }
        Err(e) => warn!(error=%e, "failed to deserialize status callback"),
    }
    Json(json!({ "success": true }))
}

/// TwiML answering the provider's fetch when the call connects: open a
/// bidirectional media stream back to us.
pub async fn outbound_call_twiml(Host(host): Host) -> impl IntoResponse {
    let url = format!("wss://{host}/outbound-media-stream");
    let stream_action = StreamAction {
        url,
        ..Default::default()
    };
    let response = Response {
        actions: vec![ResponseAction::Connect(ConnectAction {
            connection: Connection::Stream(stream_action),
        })],
    };
    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
    (headers, twiml)
}

#[derive(Deserialize, Debug)]
pub struct RegisterCallPayload {
    pub name: String,
    pub phone_number: String,
    pub disposition: String,
}

/// Manual insert into the contacted table, for calls handled outside the bot.
pub async fn register_call(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RegisterCallPayload>,
) -> impl IntoResponse {
    info!(?payload, "manual call registration");
    if payload.phone_number == PLACEHOLDER_NUMBER {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "placeholder number" })),
        );
    }
    let record = ContactedRecord {
        name: payload.name,
        phone_number: payload.phone_number,
        disposition: payload.disposition,
    };
    match app_state.store.register_contact(&record).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "success": true }))),
        Err(e) => {
            error!(error=%e, "failed to register contacted number");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false })),
            )
        }
    }
}

/// Manual termination of the current call.
pub async fn end_call(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    if app_state
        .coordinator
        .send(CoordinatorMsg::EndCall)
        .await
        .is_err()
    {
        error!("coordinator is not running");
    }
    Json(json!({ "success": true }))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| media_stream_handler(socket, app_state))
}

/// One media stream corresponds to one call: resolve the call's context from
/// the coordinator, bridge the stream to a fresh voice-agent socket, and
/// relay in both directions until either side hangs up.
async fn media_stream_handler(socket: WebSocket, app_state: Arc<AppState>) {
    info!("telephony provider connected to media stream");
    let (twilio_sink, mut twilio_stream) = socket.split();

    let start_meta = match get_stream_start(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "media stream started");

    let (respond, context_rx) = oneshot::channel();
    let query = CoordinatorMsg::StreamContext {
        call_sid: start_meta.call_sid.clone(),
        respond,
    };
    if app_state.coordinator.send(query).await.is_err() {
        error!("coordinator is not running");
        return;
    }
    let context = match context_rx.await {
        Ok(Some(context)) => context,
        _ => {
            warn!(call_sid=%start_meta.call_sid, "no active call for media stream; closing");
            return;
        }
    };

    let (agent_sink, agent_stream) = match connect_agent(&app_state).await {
        Ok(split) => split,
        Err(e) => {
            // Do not leave the call hanging in dead air.
            let failed = CoordinatorMsg::BridgeFailed {
                call_sid: start_meta.call_sid.clone(),
            };
            let _ = app_state.coordinator.send(failed).await;
            handle_error(e).await;
            return;
        }
    };
    info!("opened connection to voice agent");

    let (agent_tx, agent_rx) = mpsc::channel(8);
    tokio::spawn(send_agent_messages(agent_rx, agent_sink));

    // The initiation override must be the first frame the agent sees.
    let init = InitiationMessage::for_call(&context.name, &context.phone_number);
    let json = match serde_json::to_string(&init) {
        Ok(json) => json,
        Err(e) => {
            error!(error=%e, "failed to serialize initiation message");
            return;
        }
    };
    if agent_tx
        .send(tungstenite::Message::Text(json))
        .await
        .is_err()
    {
        error!("agent sink closed before initiation");
        return;
    }

    let _res = tokio::try_join!(
        relay_caller_audio(twilio_stream, agent_tx.clone()),
        relay_agent_events(
            agent_stream,
            twilio_sink,
            agent_tx,
            start_meta.stream_sid,
            start_meta.call_sid,
            app_state.coordinator.clone(),
        ),
    );
}

/// Capture the Start media message from the beginning of a telephony
/// websocket stream for the stream and call ids.
async fn get_stream_start(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Connected { protocol, version } => {
                            trace!("got connected message with {protocol} and {version}");
                        }
                        TwilioMessage::Start { start, .. } => {
                            break Ok(start);
                        }
                        _ => {
                            break Err(AppError::MediaStream(
                                "expected a connected or start frame at stream open",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize telephony text frame");
                        break Err(AppError::MediaStream("undecodable telephony frame"));
                    }
                },
                _ => {
                    break Err(AppError::MediaStream(
                        "unexpected websocket frame type at stream open",
                    ));
                }
            },
            None => break Err(AppError::MediaStream("media stream ended before start frame")),
        }
    }
}

/// Short-lived signed socket url from the voice-agent token endpoint.
async fn get_signed_url(app_state: &Arc<AppState>) -> Result<String, AppError> {
    let resp = app_state
        .http_client
        .get(SIGNED_URL_ENDPOINT)
        .query(&[("agent_id", app_state.config.elevenlabs_agent_id.as_str())])
        .header("xi-api-key", &app_state.config.elevenlabs_api_key)
        .timeout(SIGNED_URL_TIMEOUT)
        .send()
        .await
        .map_err(|e| AppError::SignedUrl(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(AppError::SignedUrl(format!(
            "token endpoint returned {}",
            resp.status()
        )));
    }
    let body: SignedUrlResponse = resp
        .json()
        .await
        .map_err(|e| AppError::SignedUrl(e.to_string()))?;
    Ok(body.signed_url)
}

/// Open the streaming socket to the voice-agent provider.
async fn connect_agent(app_state: &Arc<AppState>) -> Result<(AgentSink, AgentStream), AppError> {
    let signed_url = get_signed_url(app_state).await?;
    let request = signed_url
        .into_client_request()
        .map_err(|e| AppError::BridgeConnect(e.to_string()))?;
    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| AppError::BridgeConnect(e.to_string()))?;
    Ok(ws_stream.split())
}
