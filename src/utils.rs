//! Small helpers shared by the engine and the consumer.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Polling delay after `attempt` consecutive empty dequeues.
///
/// Grows geometrically from `initial` by `factor` and never exceeds `max`.
/// `attempt` is 1-based; zero is treated as the first attempt.
pub fn calculate_backoff(attempt: u32, initial: Duration, factor: f64, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(scaled)
    }
}

/// `timestamp + delay`, saturating instead of overflowing.
pub fn add_delay(timestamp: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| timestamp.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);

        assert_eq!(calculate_backoff(0, initial, 2.0, max), initial);
        assert_eq!(calculate_backoff(1, initial, 2.0, max), initial);
        assert_eq!(
            calculate_backoff(2, initial, 2.0, max),
            Duration::from_millis(200)
        );
        assert_eq!(
            calculate_backoff(3, initial, 2.0, max),
            Duration::from_millis(400)
        );
        assert_eq!(calculate_backoff(10, initial, 2.0, max), max);
        assert_eq!(calculate_backoff(u32::MAX, initial, 2.0, max), max);
    }

    #[test]
    fn test_add_delay_saturates() {
        let now = Utc::now();
        assert_eq!(
            add_delay(now, Duration::from_secs(60)),
            now + ChronoDuration::seconds(60)
        );
        assert_eq!(
            add_delay(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
