use time::OffsetDateTime;
use tracing::{error, warn};

/// Sentinel persisted when a call resolved as contacted but the timer never
/// ran (e.g. the provider reported completion before the agent handshake).
pub const NO_DURATION: &str = "00:00:00";

/// Wall-clock timer for a single call.  Started when the voice agent reports
/// conversation initiation, stopped when the coordinator resolves the call.
#[derive(Debug, Default)]
pub struct CallTimer {
    started_at: Option<OffsetDateTime>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self { started_at: None }
    }

    pub fn start(&mut self) {
        if self.started_at.is_some() {
            warn!("call timer already started");
            return;
        }
        self.started_at = Some(OffsetDateTime::now_utc());
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Returns the elapsed talk time as `HH:MM:SS`, or `None` when the timer
    /// was never started.
    pub fn stop(&mut self) -> Option<String> {
        match self.started_at.take() {
            Some(started_at) => {
                let elapsed = OffsetDateTime::now_utc() - started_at;
                Some(format_duration(elapsed))
            }
            None => {
                error!("call timer stopped without having been started");
                None
            }
        }
    }
}

/// `HH:MM:SS` with hours wrapping at 24, like a wall clock.  Negative
/// durations clamp to zero.
pub fn format_duration(elapsed: time::Duration) -> String {
    let total_secs = elapsed.whole_seconds().max(0);
    let seconds = total_secs % 60;
    let minutes = (total_secs / 60) % 60;
    let hours = (total_secs / 3_600) % 24;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_duration(Duration::milliseconds(3_725_000)), "01:02:05");
    }

    #[test]
    fn wraps_past_twenty_four_hours() {
        assert_eq!(format_duration(Duration::hours(25)), "01:00:00");
    }

    #[test]
    fn clamps_negative_durations() {
        assert_eq!(format_duration(Duration::seconds(-30)), "00:00:00");
    }

    #[test]
    fn stop_without_start_yields_none() {
        let mut timer = CallTimer::new();
        assert_eq!(timer.stop(), None);
    }

    #[test]
    fn start_then_stop_yields_a_duration() {
        let mut timer = CallTimer::new();
        timer.start();
        assert!(timer.is_running());
        let duration = timer.stop().expect("timer was started");
        assert_eq!(duration.len(), "00:00:00".len());
        assert!(!timer.is_running());
    }

    #[test]
    fn second_start_is_ignored() {
        let mut timer = CallTimer::new();
        timer.start();
        timer.start();
        assert!(timer.stop().is_some());
        assert_eq!(timer.stop(), None);
    }
}
