#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Configuration for a [`Connection`](crate::Connection).
///
/// Resolved once at construction: start from [`Config::default`] and
/// overwrite the fields you care about.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Sub-protocols offered during the handshake, in preference order
    pub protocols: Vec<String>,
    /// Verbose per-event diagnostics for this instance (visible with the
    /// `tracing` feature; overall verbosity belongs to the host's subscriber)
    pub debug: bool,
    /// Begin the first connection attempt immediately at construction.
    /// When disabled, nothing happens until [`open`](crate::Connection::open).
    pub automatic_open: bool,
    /// Maximum time a connection attempt may take before it is treated as
    /// stalled and torn down
    pub connect_timeout: Duration,
    /// Representation requested for binary frames, forwarded to the transport
    pub binary_type: BinaryType,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            debug: false,
            automatic_open: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            binary_type: BinaryType::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Representation hint for binary frames.
///
/// Native streams always deliver raw bytes; the hint matters for
/// browser-style transports that distinguish blob handles from contiguous
/// buffers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinaryType {
    /// Deliver binary frames as opaque buffered blobs
    #[default]
    Blob,
    /// Deliver binary frames as contiguous array buffers
    ArrayBuffer,
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub initial_backoff: Duration,
    /// Hard cap on the computed backoff delay
    pub max_backoff: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Emit [`Event::Exhausted`](crate::Event::Exhausted) once `max_attempts`
    /// is exceeded. Retries stop silently by default.
    pub notify_exhausted: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            notify_exhausted: false,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // No jitter: the delay for retry n is exactly initial * multiplier^n
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // Attempt limiting is handled by the driver
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence_is_deterministic() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        // 1000ms, 1500ms, 2250ms with the default multiplier of 1.5; the
        // crate may smear by a nanosecond, hence the ranges
        for expected_millis in [1000_u64, 1500, 2250] {
            let delay = backoff.next_backoff().expect("backoff should not end");
            let expected = Duration::from_millis(expected_millis);
            assert!(
                delay >= expected && delay < expected + Duration::from_millis(1),
                "expected ~{expected:?}, got {delay:?}"
            );
        }
    }

    #[test]
    fn backoff_attempt_five_matches_curve() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..5 {
            let _delay = backoff.next_backoff();
        }

        // 1000 * 1.5^5 = 7593.75ms
        let delay = backoff.next_backoff().expect("backoff should not end");
        assert!(
            delay >= Duration::from_micros(7_593_750) && delay < Duration::from_micros(7_594_750),
            "expected ~7593.75ms, got {delay:?}"
        );
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig {
            max_attempts: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 3.0,
            notify_exhausted: false,
        };
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..10 {
            let _delay = backoff.next_backoff();
        }

        let delay = backoff.next_backoff().expect("backoff should not end");
        assert!(
            delay >= Duration::from_secs(2) && delay < Duration::from_millis(2001),
            "expected the 2s cap, got {delay:?}"
        );
    }

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();

        assert!(config.automatic_open, "automatic open should default on");
        assert!(!config.debug, "debug should default off");
        assert_eq!(config.connect_timeout, Duration::from_secs(2), "bad default");
        assert_eq!(config.binary_type, BinaryType::Blob, "bad default");
        assert_eq!(config.reconnect.max_attempts, None, "bad default");
        assert_eq!(
            config.reconnect.initial_backoff,
            Duration::from_secs(1),
            "bad default"
        );
        assert_eq!(
            config.reconnect.max_backoff,
            Duration::from_secs(300),
            "bad default"
        );
        assert_eq!(
            config.reconnect.backoff_multiplier.to_bits(),
            1.5_f64.to_bits(),
            "bad default"
        );
        assert!(!config.reconnect.notify_exhausted, "bad default");
    }
}
