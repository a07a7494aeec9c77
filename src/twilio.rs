use crate::config::Config;
use crate::error::TelephonyError;
use crate::twilio_types::CallStatus;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Error codes Twilio returns for destinations the account may not call
/// (geo-permissions, unverified numbers on trial accounts).
const NOT_PERMITTED_CODES: &[u32] = &[21215, 21216];

/// Thin contract the coordinator consumes from the telephony provider.
#[async_trait]
pub trait TelephonyApi: Send + Sync {
    /// Originate a call and return the provider's call id.
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError>;
    async fn call_status(&self, call_sid: &str) -> Result<CallStatus, TelephonyError>;
    async fn end_call(&self, call_sid: &str) -> Result<(), TelephonyError>;
}

pub struct TwilioClient {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    public_host: String,
    ring_timeout_secs: u32,
}

#[derive(Deserialize, Debug)]
struct CallResource {
    sid: String,
    status: CallStatus,
}

#[derive(Deserialize, Debug, Default)]
struct TwilioApiError {
    code: Option<u32>,
    message: Option<String>,
}

impl TwilioClient {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            http,
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from_number: config.twilio_phone_number.clone(),
            public_host: config.public_host.clone(),
            ring_timeout_secs: config.policy.ring_timeout_secs,
        }
    }

    fn calls_url(&self) -> String {
        format!("{TWILIO_API_BASE}/Accounts/{}/Calls.json", self.account_sid)
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{TWILIO_API_BASE}/Accounts/{}/Calls/{call_sid}.json",
            self.account_sid
        )
    }

    fn transport_error(e: reqwest::Error) -> TelephonyError {
        if e.is_connect() || e.is_timeout() {
            TelephonyError::TransientConnection(e.to_string())
        } else {
            TelephonyError::Api(e.to_string())
        }
    }

    async fn api_error(resp: reqwest::Response) -> TelephonyError {
        let status = resp.status();
        let err: TwilioApiError = resp.json().await.unwrap_or_default();
        if err
            .code
            .map(|c| NOT_PERMITTED_CODES.contains(&c))
            .unwrap_or(false)
        {
            TelephonyError::NumberNotAllowed
        } else {
            TelephonyError::Api(format!(
                "{status}: {}",
                err.message.unwrap_or_else(|| "unknown error".to_string())
            ))
        }
    }
}

#[async_trait]
impl TelephonyApi for TwilioClient {
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError> {
        let twiml_url = format!("https://{}/outbound-call-twiml", self.public_host);
        let status_callback = format!("https://{}/call-status", self.public_host);
        let ring_timeout = self.ring_timeout_secs.to_string();
        let params: &[(&str, &str)] = &[
            ("From", &self.from_number),
            ("To", to),
            ("Url", &twiml_url),
            ("StatusCallback", &status_callback),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
            ("StatusCallbackMethod", "POST"),
            ("MachineDetection", "DetectMessageEnd"),
            ("Timeout", &ring_timeout),
        ];
        let resp = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(params)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let call: CallResource = resp
            .json()
            .await
            .map_err(|e| TelephonyError::Api(e.to_string()))?;
        debug!(call_sid=%call.sid, status=?call.status, "originated call");
        Ok(call.sid)
    }

    async fn call_status(&self, call_sid: &str) -> Result<CallStatus, TelephonyError> {
        let resp = self
            .http
            .get(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let call: CallResource = resp
            .json()
            .await
            .map_err(|e| TelephonyError::Api(e.to_string()))?;
        Ok(call.status)
    }

    async fn end_call(&self, call_sid: &str) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Ok(())
    }
}
