use crate::config::{CallPolicy, OnEmpty};
use crate::error::TelephonyError;
use crate::store::QueueStore;
use crate::timer::{CallTimer, NO_DURATION};
use crate::twilio::TelephonyApi;
use crate::twilio_types::CallStatus;

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How a resolved call is classified, and therefore which record it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Contacted,
    Unreachable,
}

/// Events funneled into the coordinator's single serialized processing path.
/// Webhook handlers, bridge tasks and scheduled retries all talk to the
/// coordinator exclusively through these.
#[derive(Debug)]
pub enum CoordinatorMsg {
    /// Attempt to originate the next queued call.  No-op unless idle.
    Trigger,
    /// Provider status webhook for some call id.
    StatusCallback {
        call_sid: String,
        status: CallStatus,
        answered_by: Option<String>,
        duration_secs: Option<u64>,
    },
    /// The voice agent acknowledged the conversation; start the talk timer.
    ConversationStarted { call_sid: String },
    /// Agent audio reached the caller; feeds the silence watchdog.
    AudioActivity { call_sid: String },
    /// The bridge could not be established or died during setup.
    BridgeFailed { call_sid: String },
    /// A media stream asks for the context of the call it belongs to.  `None`
    /// answers streams for stale or unknown calls.
    StreamContext {
        call_sid: String,
        respond: oneshot::Sender<Option<CallContext>>,
    },
    /// Manual termination of the current call.
    EndCall,
}

/// The slice of the active call a bridge is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub name: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Originating,
    InProgress,
    Terminating,
}

/// The single in-flight call.  Owned exclusively by the coordinator; bridges
/// get a [`CallContext`] copy, never a handle to this.
struct ActiveCall {
    call_sid: String,
    name: String,
    phone_number: String,
    timer: CallTimer,
    created_at: OffsetDateTime,
}

pub struct Coordinator {
    telephony: Arc<dyn TelephonyApi>,
    store: Arc<dyn QueueStore>,
    policy: CallPolicy,
    /// Handle to our own inbox, for scheduled re-triggers.
    self_tx: mpsc::Sender<CoordinatorMsg>,
    phase: Phase,
    active: Option<ActiveCall>,
    last_activity: Instant,
    consecutive_failures: u32,
}

impl Coordinator {
    pub fn new(
        telephony: Arc<dyn TelephonyApi>,
        store: Arc<dyn QueueStore>,
        policy: CallPolicy,
        self_tx: mpsc::Sender<CoordinatorMsg>,
    ) -> Self {
        Self {
            telephony,
            store,
            policy,
            self_tx,
            phase: Phase::Idle,
            active: None,
            last_activity: Instant::now(),
            consecutive_failures: 0,
        }
    }

    /// Event loop.  All state transitions happen on this task; the watchdog
    /// shares it so a tick can never interleave with a webhook.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorMsg>) {
        let mut ticker = interval(self.policy.watchdog_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = ticker.tick() => self.check_watchdog().await,
            }
        }
        debug!("coordinator inbox closed; shutting down");
    }

    async fn handle(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::Trigger => self.trigger().await,
            CoordinatorMsg::StatusCallback {
                call_sid,
                status,
                answered_by,
                duration_secs,
            } => {
                self.on_status(&call_sid, status, answered_by.as_deref(), duration_secs)
                    .await
            }
            CoordinatorMsg::ConversationStarted { call_sid } => {
                if self.matches_active(&call_sid) {
                    self.last_activity = Instant::now();
                    if let Some(active) = self.active.as_mut() {
                        active.timer.start();
                    }
                } else {
                    debug!(%call_sid, "conversation started for stale call");
                }
            }
            CoordinatorMsg::AudioActivity { call_sid } => {
                if self.matches_active(&call_sid) {
                    self.last_activity = Instant::now();
                }
            }
            CoordinatorMsg::BridgeFailed { call_sid } => {
                warn!(%call_sid, "voice-agent bridge failed; resolving call as unreachable");
                self.terminate(&call_sid, Outcome::Unreachable).await;
            }
            CoordinatorMsg::StreamContext { call_sid, respond } => {
                let context = match &self.active {
                    Some(active)
                        if active.call_sid == call_sid && self.phase == Phase::InProgress =>
                    {
                        Some(CallContext {
                            name: active.name.clone(),
                            phone_number: active.phone_number.clone(),
                        })
                    }
                    _ => {
                        debug!(%call_sid, "media stream for stale or unknown call");
                        None
                    }
                };
                let _ = respond.send(context);
            }
            CoordinatorMsg::EndCall => self.end_call().await,
        }
    }

    fn matches_active(&self, call_sid: &str) -> bool {
        self.active
            .as_ref()
            .map(|active| active.call_sid == call_sid)
            .unwrap_or(false)
    }

    /// Originate the next queued call.  Consumes numbers the provider refuses
    /// outright, backs off on transient provider faults, and trips a circuit
    /// breaker after too many consecutive failures.
    async fn trigger(&mut self) {
        if self.phase != Phase::Idle {
            debug!(phase = ?self.phase, "trigger ignored; a call is already in flight");
            return;
        }
        match self.store.bot_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                info!("outbound calling is disabled");
                return;
            }
            Err(e) => {
                error!(error=%e, "failed to read bot status");
                return;
            }
        }
        loop {
            if self.consecutive_failures >= self.policy.max_originate_failures {
                error!(
                    failures = self.consecutive_failures,
                    "too many consecutive origination failures; abandoning queue drain"
                );
                self.consecutive_failures = 0;
                return;
            }
            let pending = match self.store.next_pending().await {
                Ok(Some(pending)) => pending,
                Ok(None) => {
                    match self.policy.on_empty {
                        OnEmpty::Idle => debug!("pending queue is empty; staying idle"),
                        OnEmpty::Poll(delay) => {
                            debug!(?delay, "pending queue is empty; polling again later");
                            schedule_trigger(self.self_tx.clone(), delay);
                        }
                    }
                    return;
                }
                Err(e) => {
                    error!(error=%e, "failed to read next pending number");
                    return;
                }
            };
            let to = format_destination(&pending.phone_number);
            self.phase = Phase::Originating;
            match self.telephony.place_call(&to).await {
                Ok(call_sid) => {
                    info!(%call_sid, name=%pending.name, to=%to, "call originated");
                    self.active = Some(ActiveCall {
                        call_sid,
                        name: pending.name,
                        phone_number: pending.phone_number,
                        timer: CallTimer::new(),
                        created_at: OffsetDateTime::now_utc(),
                    });
                    self.phase = Phase::InProgress;
                    self.last_activity = Instant::now();
                    self.consecutive_failures = 0;
                    return;
                }
                Err(TelephonyError::NumberNotAllowed) => {
                    warn!(to=%to, "destination not permitted; dropping number and moving on");
                    self.phase = Phase::Idle;
                    self.consecutive_failures += 1;
                    if let Err(e) = self.store.delete_pending(&pending.phone_number).await {
                        error!(error=%e, "failed to delete rejected number");
                        return;
                    }
                }
                Err(TelephonyError::TransientConnection(e)) => {
                    warn!(
                        error=%e,
                        backoff = ?self.policy.originate_backoff,
                        "provider unreachable; retrying after backoff"
                    );
                    self.phase = Phase::Idle;
                    self.consecutive_failures += 1;
                    schedule_trigger(self.self_tx.clone(), self.policy.originate_backoff);
                    return;
                }
                Err(e) => {
                    error!(error=%e, "failed to originate call; leaving number queued");
                    self.phase = Phase::Idle;
                    return;
                }
            }
        }
    }

    async fn on_status(
        &mut self,
        call_sid: &str,
        status: CallStatus,
        answered_by: Option<&str>,
        duration_secs: Option<u64>,
    ) {
        if !self.matches_active(call_sid) {
            debug!(%call_sid, ?status, "status callback for stale call; ignoring");
            return;
        }
        if !matches!(self.phase, Phase::Originating | Phase::InProgress) {
            debug!(%call_sid, phase = ?self.phase, "status callback outside an active call");
            return;
        }
        match status {
            CallStatus::InProgress => {
                let non_human = answered_by.filter(|by| *by != "human");
                if let Some(by) = non_human {
                    if duration_secs.unwrap_or(0) >= self.policy.machine_min_duration_secs {
                        info!(answered_by=%by, "call answered by non-human; hanging up");
                        self.terminate(call_sid, Outcome::Unreachable).await;
                    }
                }
            }
            CallStatus::Completed => self.terminate(call_sid, Outcome::Contacted).await,
            CallStatus::Busy | CallStatus::NoAnswer | CallStatus::Failed | CallStatus::Canceled => {
                info!(?status, "call did not reach anyone");
                self.terminate(call_sid, Outcome::Unreachable).await;
            }
            other => debug!(status = ?other, "ignoring non-terminal status"),
        }
    }

    async fn end_call(&mut self) {
        let Some(active) = &self.active else {
            debug!("end-call requested with no active call");
            return;
        };
        let call_sid = active.call_sid.clone();
        // A manually ended call counts as contacted only if the conversation
        // actually started.
        let outcome = if active.timer.is_running() {
            Outcome::Contacted
        } else {
            Outcome::Unreachable
        };
        info!(%call_sid, ?outcome, "manual end-call requested");
        self.terminate(&call_sid, outcome).await;
    }

    /// Resolve the active call: make sure the provider side is over, persist
    /// exactly one outcome record, consume the queued number, then go idle
    /// and immediately look for the next call.
    async fn terminate(&mut self, call_sid: &str, outcome: Outcome) {
        if !self.matches_active(call_sid) {
            debug!(%call_sid, "terminate for stale call; ignoring");
            return;
        }
        self.phase = Phase::Terminating;
        let Some(mut active) = self.active.take() else {
            return;
        };

        match self.telephony.call_status(call_sid).await {
            Ok(status) if !status.is_terminal() => {
                if let Err(e) = self.telephony.end_call(call_sid).await {
                    warn!(error=%e, "failed to end call at provider");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error=%e, "failed to query provider call status"),
        }

        // Persistence faults are logged and the call still counts as
        // resolved; the coordinator never retries these writes.
        match outcome {
            Outcome::Contacted => {
                let talk_time = active.timer.stop().unwrap_or_else(|| {
                    error!("contacted call had no running timer; recording sentinel talk time");
                    NO_DURATION.to_string()
                });
                if let Err(e) = self
                    .store
                    .upsert_contacted(&active.name, &active.phone_number, &talk_time)
                    .await
                {
                    error!(error=%e, "failed to persist contacted record");
                }
            }
            Outcome::Unreachable => {
                if let Err(e) = self
                    .store
                    .insert_unreachable(&active.phone_number, &active.name)
                    .await
                {
                    error!(error=%e, "failed to persist unreachable record");
                }
            }
        }
        if let Err(e) = self.store.delete_pending(&active.phone_number).await {
            error!(error=%e, "failed to delete resolved number from queue");
        }

        let lifetime = OffsetDateTime::now_utc() - active.created_at;
        info!(%call_sid, ?outcome, ?lifetime, "call resolved");
        self.phase = Phase::Idle;
        self.trigger().await;
    }

    async fn check_watchdog(&mut self) {
        if self.phase != Phase::InProgress {
            return;
        }
        if self.last_activity.elapsed() < self.policy.watchdog_threshold {
            return;
        }
        let Some(call_sid) = self.active.as_ref().map(|a| a.call_sid.clone()) else {
            return;
        };
        warn!(%call_sid, threshold = ?self.policy.watchdog_threshold, "silence watchdog expired");
        self.terminate(&call_sid, Outcome::Unreachable).await;
    }
}

/// Destination numbers in the queue may lack the leading `+`.
pub fn format_destination(phone_number: &str) -> String {
    if phone_number.starts_with('+') {
        phone_number.to_string()
    } else {
        format!("+{phone_number}")
    }
}

fn schedule_trigger(tx: mpsc::Sender<CoordinatorMsg>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if tx.send(CoordinatorMsg::Trigger).await.is_err() {
            debug!("coordinator gone; dropping scheduled trigger");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::{ContactedRecord, PendingNumber};

    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeStore {
        enabled: bool,
        queue: Mutex<VecDeque<PendingNumber>>,
        deleted: Mutex<Vec<String>>,
        contacted: Mutex<Vec<(String, String, String)>>,
        unreachable: Mutex<Vec<(String, String)>>,
    }

    impl FakeStore {
        fn with_queue(numbers: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                enabled: true,
                queue: Mutex::new(
                    numbers
                        .iter()
                        .map(|(name, phone_number)| PendingNumber {
                            name: name.to_string(),
                            phone_number: phone_number.to_string(),
                        })
                        .collect(),
                ),
                deleted: Mutex::new(vec![]),
                contacted: Mutex::new(vec![]),
                unreachable: Mutex::new(vec![]),
            })
        }

        fn disabled() -> Arc<Self> {
            Arc::new(Self {
                enabled: false,
                queue: Mutex::new(VecDeque::from(vec![PendingNumber {
                    name: "Ana".to_string(),
                    phone_number: "5212345678901".to_string(),
                }])),
                deleted: Mutex::new(vec![]),
                contacted: Mutex::new(vec![]),
                unreachable: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl QueueStore for FakeStore {
        async fn bot_enabled(&self) -> Result<bool, AppError> {
            Ok(self.enabled)
        }

        async fn next_pending(&self) -> Result<Option<PendingNumber>, AppError> {
            Ok(self.queue.lock().unwrap().front().cloned())
        }

        async fn delete_pending(&self, phone_number: &str) -> Result<(), AppError> {
            self.queue
                .lock()
                .unwrap()
                .retain(|p| p.phone_number != phone_number);
            self.deleted.lock().unwrap().push(phone_number.to_string());
            Ok(())
        }

        async fn upsert_contacted(
            &self,
            name: &str,
            phone_number: &str,
            talk_time: &str,
        ) -> Result<(), AppError> {
            self.contacted.lock().unwrap().push((
                name.to_string(),
                phone_number.to_string(),
                talk_time.to_string(),
            ));
            Ok(())
        }

        async fn insert_unreachable(&self, phone_number: &str, name: &str) -> Result<(), AppError> {
            self.unreachable
                .lock()
                .unwrap()
                .push((phone_number.to_string(), name.to_string()));
            Ok(())
        }

        async fn register_contact(&self, _record: &ContactedRecord) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct FakeTelephony {
        /// Scripted origination results, consumed front-first; once empty,
        /// calls succeed with generated sids.
        results: Mutex<VecDeque<Result<String, TelephonyError>>>,
        placed: Mutex<Vec<String>>,
        ended: Mutex<Vec<String>>,
        status: CallStatus,
    }

    impl FakeTelephony {
        fn succeeding() -> Arc<Self> {
            Self::scripted(vec![])
        }

        fn scripted(results: Vec<Result<String, TelephonyError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                placed: Mutex::new(vec![]),
                ended: Mutex::new(vec![]),
                status: CallStatus::InProgress,
            })
        }
    }

    #[async_trait]
    impl TelephonyApi for FakeTelephony {
        async fn place_call(&self, to: &str) -> Result<String, TelephonyError> {
            let scripted = self.results.lock().unwrap().pop_front();
            let result = match scripted {
                Some(result) => result,
                None => Ok(format!("CA{}", self.placed.lock().unwrap().len() + 1)),
            };
            if result.is_ok() {
                self.placed.lock().unwrap().push(to.to_string());
            }
            result
        }

        async fn call_status(&self, _call_sid: &str) -> Result<CallStatus, TelephonyError> {
            Ok(self.status)
        }

        async fn end_call(&self, call_sid: &str) -> Result<(), TelephonyError> {
            self.ended.lock().unwrap().push(call_sid.to_string());
            Ok(())
        }
    }

    fn coordinator(
        telephony: Arc<FakeTelephony>,
        store: Arc<FakeStore>,
        policy: CallPolicy,
    ) -> (Coordinator, mpsc::Receiver<CoordinatorMsg>) {
        let (tx, rx) = mpsc::channel(8);
        (Coordinator::new(telephony, store, policy, tx), rx)
    }

    fn completed(call_sid: &str) -> CoordinatorMsg {
        CoordinatorMsg::StatusCallback {
            call_sid: call_sid.to_string(),
            status: CallStatus::Completed,
            answered_by: None,
            duration_secs: Some(30),
        }
    }

    #[tokio::test]
    async fn trigger_is_single_flight() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901"), ("Bo", "5219876543210")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store, CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::Trigger).await;

        assert_eq!(telephony.placed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_bot_refuses_to_originate() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::disabled();
        let (mut c, _rx) = coordinator(telephony.clone(), store, CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;

        assert!(telephony.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_call_resolves_exactly_once_and_drains_queue() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        assert_eq!(telephony.placed.lock().unwrap()[0], "+5212345678901");

        c.handle(CoordinatorMsg::ConversationStarted {
            call_sid: "CA1".to_string(),
        })
        .await;
        c.handle(completed("CA1")).await;

        {
            let contacted = store.contacted.lock().unwrap();
            assert_eq!(contacted.len(), 1);
            assert_eq!(contacted[0].0, "Ana");
            assert_eq!(contacted[0].1, "5212345678901");
        }
        assert_eq!(store.unreachable.lock().unwrap().len(), 0);
        assert_eq!(store.deleted.lock().unwrap().as_slice(), ["5212345678901"]);
        // Terminate re-invoked trigger; the queue was empty so no second call.
        assert_eq!(telephony.placed.lock().unwrap().len(), 1);
        assert_eq!(c.phase, Phase::Idle);

        // A duplicate terminal callback must not produce a second record.
        c.handle(completed("CA1")).await;
        assert_eq!(store.contacted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolution_triggers_the_next_queued_call() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901"), ("Bo", "5219876543210")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(completed("CA1")).await;

        let placed = telephony.placed.lock().unwrap();
        assert_eq!(placed.as_slice(), ["+5212345678901", "+5219876543210"]);
        assert_eq!(c.phase, Phase::InProgress);
    }

    #[tokio::test]
    async fn stale_callback_is_ignored() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(completed("CA2")).await;

        assert_eq!(c.phase, Phase::InProgress);
        assert!(store.contacted.lock().unwrap().is_empty());
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unanswered_calls_are_recorded_unreachable() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::StatusCallback {
            call_sid: "CA1".to_string(),
            status: CallStatus::NoAnswer,
            answered_by: None,
            duration_secs: None,
        })
        .await;

        assert_eq!(
            store.unreachable.lock().unwrap().as_slice(),
            [("5212345678901".to_string(), "Ana".to_string())]
        );
        assert!(store.contacted.lock().unwrap().is_empty());
        assert_eq!(store.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_human_answer_short_circuits() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::StatusCallback {
            call_sid: "CA1".to_string(),
            status: CallStatus::InProgress,
            answered_by: Some("machine_start".to_string()),
            duration_secs: Some(2),
        })
        .await;

        assert_eq!(store.unreachable.lock().unwrap().len(), 1);
        assert_eq!(telephony.ended.lock().unwrap().as_slice(), ["CA1"]);
        assert_eq!(c.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn human_answer_does_not_terminate() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::StatusCallback {
            call_sid: "CA1".to_string(),
            status: CallStatus::InProgress,
            answered_by: Some("human".to_string()),
            duration_secs: Some(2),
        })
        .await;

        assert_eq!(c.phase, Phase::InProgress);
        assert!(store.unreachable.lock().unwrap().is_empty());
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_number_is_dropped_and_next_is_tried() {
        let telephony = FakeTelephony::scripted(vec![
            Err(TelephonyError::NumberNotAllowed),
            Ok("CA1".to_string()),
        ]);
        let store = FakeStore::with_queue(&[("Bad", "5210000000000"), ("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;

        assert_eq!(store.deleted.lock().unwrap().as_slice(), ["5210000000000"]);
        assert_eq!(telephony.placed.lock().unwrap().as_slice(), ["+5212345678901"]);
        assert_eq!(c.phase, Phase::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_backs_off_without_consuming_the_number() {
        let telephony = FakeTelephony::scripted(vec![Err(TelephonyError::TransientConnection(
            "connection refused".to_string(),
        ))]);
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, mut rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;

        assert_eq!(c.phase, Phase::Idle);
        assert!(store.deleted.lock().unwrap().is_empty());
        assert_eq!(store.queue.lock().unwrap().len(), 1);

        // The retry arrives on the inbox after the backoff, not before.
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(rx.try_recv(), Ok(CoordinatorMsg::Trigger)));
    }

    #[tokio::test]
    async fn circuit_breaker_stops_a_runaway_drain() {
        let policy = CallPolicy {
            max_originate_failures: 2,
            ..CallPolicy::default()
        };
        let telephony = FakeTelephony::scripted(vec![
            Err(TelephonyError::NumberNotAllowed),
            Err(TelephonyError::NumberNotAllowed),
            Err(TelephonyError::NumberNotAllowed),
        ]);
        let store = FakeStore::with_queue(&[
            ("A", "5210000000001"),
            ("B", "5210000000002"),
            ("C", "5210000000003"),
        ]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), policy);

        c.handle(CoordinatorMsg::Trigger).await;

        // Two rejected attempts consumed their numbers, then the breaker
        // opened with the third number still queued.
        assert_eq!(store.deleted.lock().unwrap().len(), 2);
        assert_eq!(store.queue.lock().unwrap().len(), 1);
        assert_eq!(c.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn stream_context_is_answered_only_for_the_active_call() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony, store, CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;

        let (tx, rx) = oneshot::channel();
        c.handle(CoordinatorMsg::StreamContext {
            call_sid: "CA1".to_string(),
            respond: tx,
        })
        .await;
        let context = rx.await.unwrap().expect("active call context");
        assert_eq!(context.name, "Ana");
        assert_eq!(context.phone_number, "5212345678901");

        let (tx, rx) = oneshot::channel();
        c.handle(CoordinatorMsg::StreamContext {
            call_sid: "CA9".to_string(),
            respond: tx,
        })
        .await;
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test]
    async fn bridge_failure_resolves_the_call_unreachable() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::BridgeFailed {
            call_sid: "CA1".to_string(),
        })
        .await;

        assert_eq!(store.unreachable.lock().unwrap().len(), 1);
        assert_eq!(c.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn manual_end_call_uses_the_timer_to_classify() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (mut c, _rx) = coordinator(telephony.clone(), store.clone(), CallPolicy::default());

        c.handle(CoordinatorMsg::Trigger).await;
        c.handle(CoordinatorMsg::ConversationStarted {
            call_sid: "CA1".to_string(),
        })
        .await;
        c.handle(CoordinatorMsg::EndCall).await;

        assert_eq!(store.contacted.lock().unwrap().len(), 1);
        assert!(store.unreachable.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_terminates_a_silent_call_exactly_once() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (tx, rx) = mpsc::channel(8);
        let c = Coordinator::new(
            telephony.clone(),
            store.clone(),
            CallPolicy::default(),
            tx.clone(),
        );
        tokio::spawn(c.run(rx));

        tx.send(CoordinatorMsg::Trigger).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(telephony.placed.lock().unwrap().len(), 1);
        assert!(store.unreachable.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(store.unreachable.lock().unwrap().len(), 1);
        assert_eq!(store.deleted.lock().unwrap().len(), 1);

        // No further terminations while idle, however long we wait.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.unreachable.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_activity_keeps_the_watchdog_quiet() {
        let telephony = FakeTelephony::succeeding();
        let store = FakeStore::with_queue(&[("Ana", "5212345678901")]);
        let (tx, rx) = mpsc::channel(8);
        let c = Coordinator::new(
            telephony.clone(),
            store.clone(),
            CallPolicy::default(),
            tx.clone(),
        );
        tokio::spawn(c.run(rx));

        tx.send(CoordinatorMsg::Trigger).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(CoordinatorMsg::AudioActivity {
                call_sid: "CA1".to_string(),
            })
            .await
            .unwrap();
        }
        assert!(store.unreachable.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(store.unreachable.lock().unwrap().len(), 1);
    }

    #[test]
    fn destination_formatting_adds_the_plus_sign() {
        assert_eq!(format_destination("5212345678901"), "+5212345678901");
        assert_eq!(format_destination("+5212345678901"), "+5212345678901");
    }
}
