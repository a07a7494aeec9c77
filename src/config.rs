use crate::error::AppError;

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// What the coordinator does when the pending queue runs dry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnEmpty {
    /// Stay idle until the next external trigger.
    Idle,
    /// Re-check the queue after the given delay.
    Poll(Duration),
}

/// Tunables governing a single call attempt and the queue drain.  Everything
/// here has a default; the environment can override each knob individually.
#[derive(Clone, Debug)]
pub struct CallPolicy {
    /// Seconds the provider lets the destination ring before giving up.
    pub ring_timeout_secs: u32,
    /// How long without agent audio before a call is considered dead air.
    pub watchdog_threshold: Duration,
    pub watchdog_tick: Duration,
    /// Delay before re-triggering after a transient provider failure.
    pub originate_backoff: Duration,
    /// Circuit breaker: abandon the drain after this many consecutive
    /// origination failures.
    pub max_originate_failures: u32,
    /// Minimum reported duration before a non-human answer terminates the
    /// call.
    pub machine_min_duration_secs: u64,
    pub on_empty: OnEmpty,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 15,
            watchdog_threshold: Duration::from_secs(20),
            watchdog_tick: Duration::from_secs(2),
            originate_backoff: Duration::from_secs(5),
            max_originate_failures: 5,
            machine_min_duration_secs: 1,
            on_empty: OnEmpty::Idle,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub elevenlabs_api_key: String,
    pub elevenlabs_agent_id: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    /// Externally reachable hostname used in webhook and TwiML urls.
    pub public_host: String,
    pub db_host: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub bind_addr: SocketAddr,
    pub policy: CallPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let policy = CallPolicy {
            ring_timeout_secs: optional("RING_TIMEOUT_SECS")?.unwrap_or(15),
            watchdog_threshold: Duration::from_secs(
                optional("WATCHDOG_THRESHOLD_SECS")?.unwrap_or(20),
            ),
            watchdog_tick: Duration::from_secs(optional("WATCHDOG_TICK_SECS")?.unwrap_or(2)),
            originate_backoff: Duration::from_secs(
                optional("ORIGINATE_BACKOFF_SECS")?.unwrap_or(5),
            ),
            max_originate_failures: optional("MAX_ORIGINATE_FAILURES")?.unwrap_or(5),
            machine_min_duration_secs: optional("MACHINE_MIN_DURATION_SECS")?.unwrap_or(1),
            on_empty: on_empty_from_env()?,
        };

        Ok(Self {
            elevenlabs_api_key: required("ELEVENLABS_API_KEY")?,
            elevenlabs_agent_id: required("ELEVENLABS_AGENT_ID")?,
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            twilio_phone_number: required("TWILIO_PHONE_NUMBER")?,
            public_host: required("PUBLIC_HOST")?,
            db_host: required("DB_HOST")?,
            db_user: required("DB_USER")?,
            db_password: required("DB_PASSWORD")?,
            db_name: required("DB_NAME")?,
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
                .parse()
                .map_err(|_| AppError::ConfigValue("BIND_ADDR"))?,
            policy,
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_name
        )
    }
}

fn required(name: &'static str) -> Result<String, AppError> {
    env::var(name).map_err(|_| AppError::Config(name))
}

fn optional<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::ConfigValue(name)),
        Err(_) => Ok(None),
    }
}

/// `ON_EMPTY` is either `idle` or `poll:<secs>`.
fn on_empty_from_env() -> Result<OnEmpty, AppError> {
    let raw = match env::var("ON_EMPTY") {
        Ok(raw) => raw,
        Err(_) => return Ok(OnEmpty::Idle),
    };
    match raw.as_str() {
        "idle" => Ok(OnEmpty::Idle),
        other => match other.strip_prefix("poll:").and_then(|s| s.parse().ok()) {
            Some(secs) => Ok(OnEmpty::Poll(Duration::from_secs(secs))),
            None => Err(AppError::ConfigValue("ON_EMPTY")),
        },
    }
}
