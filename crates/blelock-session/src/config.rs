//! Session timing configuration.

use blelock_core::{ProtocolKind, constants::*};
use std::time::Duration;

/// Timeout and pacing table for one session.
///
/// Defaults come from field experience with both lock families and are
/// deliberately generous rather than tight; hosts with better knowledge of
/// their radio environment can override any of them.
///
/// # Example
///
/// ```
/// use blelock_core::ProtocolKind;
/// use blelock_session::SessionConfig;
/// use std::time::Duration;
///
/// let mut config = SessionConfig::for_protocol(ProtocolKind::TtSeries);
/// config.poll_interval = Duration::from_secs(30);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// GATT connect + service discovery window.
    pub connect_timeout: Duration,
    /// CCCD descriptor-write completion window.
    pub descriptor_write_timeout: Duration,
    /// Write-completion callback window per write.
    pub write_completion_timeout: Duration,
    /// Correlated response wait per command.
    pub response_timeout: Duration,
    /// Window for the asynchronous heartbeat reply write.
    pub heartbeat_reply_timeout: Duration,
    /// Minimum gap between consecutive commands.
    pub command_pacing: Duration,
    /// Settle delay between connect-sequence steps.
    pub settle_delay: Duration,
    /// Status polling interval.
    pub poll_interval: Duration,
    /// Query attempts per poll cycle.
    pub poll_query_attempts: u32,
    /// Initial status query attempts during connect.
    pub connect_query_attempts: u32,
    /// Gap between initial status query attempts.
    pub connect_query_retry_delay: Duration,
    /// Window in which an UNKNOWN probe after a command echoes the
    /// commanded state.
    pub debounce_window: Duration,
    /// Delay before the re-query that resolves a G-Series 0x11 result.
    pub verify_retry_delay: Duration,
    /// How long a cached state may stand in for a failed probe.
    pub cached_state_validity: Duration,
    /// Consecutive parse failures after which the poller stops itself.
    pub max_consecutive_failures: u32,
}

impl SessionConfig {
    /// Defaults for the given protocol family.
    ///
    /// The families differ in polling cadence (5 s vs 10 s) and command
    /// pacing (TT-Series firmware drops back-to-back commands without a
    /// ~500 ms gap).
    #[must_use]
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        let (poll_interval, command_pacing) = match protocol {
            ProtocolKind::GSeries => (G_POLL_INTERVAL, Duration::ZERO),
            ProtocolKind::TtSeries => (TT_POLL_INTERVAL, TT_COMMAND_PACING),
        };
        SessionConfig {
            connect_timeout: CONNECT_TIMEOUT,
            descriptor_write_timeout: DESCRIPTOR_WRITE_TIMEOUT,
            write_completion_timeout: WRITE_COMPLETION_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            heartbeat_reply_timeout: HEARTBEAT_REPLY_TIMEOUT,
            command_pacing,
            settle_delay: Duration::from_millis(300),
            poll_interval,
            poll_query_attempts: POLL_QUERY_ATTEMPTS,
            connect_query_attempts: CONNECT_QUERY_ATTEMPTS,
            connect_query_retry_delay: CONNECT_QUERY_RETRY_DELAY,
            debounce_window: STATE_DEBOUNCE_WINDOW,
            verify_retry_delay: VERIFY_RETRY_DELAY,
            cached_state_validity: CACHED_STATE_VALIDITY,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_protocol(ProtocolKind::GSeries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_protocol_defaults() {
        let g = SessionConfig::for_protocol(ProtocolKind::GSeries);
        assert_eq!(g.poll_interval, Duration::from_secs(5));
        assert_eq!(g.command_pacing, Duration::ZERO);

        let tt = SessionConfig::for_protocol(ProtocolKind::TtSeries);
        assert_eq!(tt.poll_interval, Duration::from_secs(10));
        assert_eq!(tt.command_pacing, Duration::from_millis(500));
    }
}
