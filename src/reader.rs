use crate::last_value::LastValue;
use std::time::Duration;
use tracing::debug;

/// Returned when no reading has arrived within the wait.
pub const NO_DATA: &str = "No data yet (is the device publishing on the right topic?)";

/// Latest reading, waiting at most `timeout` if none has arrived yet.
///
/// A present value is returned at once, however old. Only the calling task
/// is suspended; the network loop keeps delivering while we wait.
pub async fn read(reading: &LastValue, timeout: Duration) -> Option<String> {
    if let Some(value) = reading.snapshot() {
        return Some(value);
    }

    let signal = reading.reset_signal();
    // a write may land between the first snapshot and arming the signal
    if let Some(value) = reading.snapshot() {
        return Some(value);
    }

    let arrived = signal.wait(timeout).await;
    debug!(arrived, ?timeout, "Reading wait finished");
    reading.snapshot()
}

/// Turns a caller-supplied wait in seconds into a usable duration.
///
/// NaN and negative values mean "don't wait"; anything above `max`
/// is clamped to `max`.
pub fn sanitize_timeout(seconds: f64, max: Duration) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds)
        .map(|timeout| timeout.min(max))
        .unwrap_or(max)
}

/// [`read`] with the sentinel substituted for "nothing yet".
pub async fn get_latest_reading(reading: &LastValue, timeout: Duration) -> String {
    read(reading, timeout)
        .await
        .unwrap_or_else(|| NO_DATA.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::last_value;
    use std::time::Instant;

    #[tokio::test]
    async fn no_data_after_the_full_timeout() {
        let (_recorder, reading) = last_value::channel();
        let started = Instant::now();
        let reply = get_latest_reading(&reading, Duration::from_millis(100)).await;
        assert_eq!(reply, NO_DATA);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn concurrent_arrival_wakes_the_wait_early() {
        let (recorder, reading) = last_value::channel();
        let waiter = {
            let reading = reading.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let reply = get_latest_reading(&reading, Duration::from_secs(5)).await;
                (reply, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.set("23.4".to_string());

        let (reply, elapsed) = waiter.await.unwrap();
        assert_eq!(reply, "23.4");
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stale_value_is_returned_without_waiting() {
        let (recorder, reading) = last_value::channel();
        recorder.set("12.5".to_string());

        for _ in 0..3 {
            let started = Instant::now();
            let reply = get_latest_reading(&reading, Duration::from_secs(5)).await;
            assert_eq!(reply, "12.5");
            assert!(started.elapsed() < Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn last_write_wins() {
        let (recorder, reading) = last_value::channel();
        recorder.set("12.5".to_string());
        recorder.set("13.1".to_string());
        assert_eq!(
            read(&reading, Duration::ZERO).await.as_deref(),
            Some("13.1")
        );
    }

    #[tokio::test]
    async fn overlapping_reads_all_see_the_arrival() {
        let (recorder, reading) = last_value::channel();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let reading = reading.clone();
                tokio::spawn(async move { read(&reading, Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.set("8.8".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().as_deref(), Some("8.8"));
        }
    }

    #[test]
    fn timeouts_are_sanitized() {
        let max = Duration::from_secs(30);
        assert_eq!(sanitize_timeout(2.0, max), Duration::from_secs(2));
        let short = sanitize_timeout(0.1, max);
        assert!(short > Duration::from_millis(99) && short < Duration::from_millis(101));
        assert_eq!(sanitize_timeout(-1.0, max), Duration::ZERO);
        assert_eq!(sanitize_timeout(f64::NAN, max), Duration::ZERO);
        assert_eq!(sanitize_timeout(f64::INFINITY, max), max);
        assert_eq!(sanitize_timeout(1e300, max), max);
        assert_eq!(sanitize_timeout(120.0, max), max);
    }
}
