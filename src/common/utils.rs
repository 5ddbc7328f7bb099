//! Utility functions for pixel-indexer

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exponential backoff: doubles from `base` up to `max`, with up to 10% jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay to wait now; the following call returns twice as much (capped)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = delay.as_millis() as u64 / 10;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rand::random::<u64>() % jitter_ms)
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Resolves once the shutdown flag is set. A dropped sender never resolves.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Retry with exponential backoff.
///
/// Only retryable errors are retried, at most `max_attempts` calls in total.
/// Returns `Error::Shutdown` when shutdown is signalled while waiting between
/// attempts.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: u32,
    mut backoff: Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                crate::common::METRICS.retries.inc();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signalled(shutdown) => return Err(crate::Error::Shutdown),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        let huge = format!("{}d", u64::MAX / 2);
        assert!(matches!(
            parse_duration(&huge),
            Err(crate::Error::InvalidConfig(_))
        ));
        assert!(parse_duration(&format!("{}s", u64::MAX)).is_ok());
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(20));
        // below 10ms there is no jitter
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(10) && second < Duration::from_millis(11));
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(20) && third < Duration::from_millis(22));
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(20) && capped < Duration::from_millis(22));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(crate::Error::RateLimited("429".into())) }
            },
            3,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1)),
            &mut rx,
        )
        .await;

        assert!(matches!(result, Err(crate::Error::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_permanent_errors() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(crate::Error::Malformed("bad".into())) }
            },
            5,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1)),
            &mut rx,
        )
        .await;

        assert!(matches!(result, Err(crate::Error::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failure() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(crate::Error::Timeout("slow".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            5,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1)),
            &mut rx,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result: crate::Result<()> = retry_with_backoff(
            || async { Err(crate::Error::Timeout("slow".into())) },
            5,
            Backoff::new(Duration::from_secs(10), Duration::from_secs(60)),
            &mut rx,
        )
        .await;

        assert!(matches!(result, Err(crate::Error::Shutdown)));
    }
}
