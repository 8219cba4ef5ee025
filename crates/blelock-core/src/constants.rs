use std::time::Duration;

/// Effective BLE payload per write/notification (assumed 23-byte MTU).
pub const BLE_CHUNK_SIZE: usize = 20;
/// Delay between chunks of a single oversized write.
pub const CHUNK_PACING: Duration = Duration::from_millis(100);

/// Connect + service discovery window.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// CCCD descriptor-write completion window.
pub const DESCRIPTOR_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
/// Write-completion callback window.
pub const WRITE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);
/// Correlated response wait.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);
/// Window for the asynchronous TT-Series heartbeat reply write.
pub const HEARTBEAT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);
/// Minimum gap between consecutive TT-Series commands.
pub const TT_COMMAND_PACING: Duration = Duration::from_millis(500);

/// Status polling intervals.
pub const G_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const TT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Query attempts per poll cycle.
pub const POLL_QUERY_ATTEMPTS: u32 = 2;
/// Initial status query attempts during connect.
pub const CONNECT_QUERY_ATTEMPTS: u32 = 3;
/// Gap between initial status query attempts.
pub const CONNECT_QUERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Window in which an UNKNOWN probe after a successful command echoes the
/// commanded state instead (devices report transient garbage mid-transition).
pub const STATE_DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);
/// Delay before the re-query that resolves a G-Series 0x11 result.
pub const VERIFY_RETRY_DELAY: Duration = Duration::from_millis(1500);
/// How long a cached lock state may stand in for a failed probe.
pub const CACHED_STATE_VALIDITY: Duration = Duration::from_secs(30);
/// Consecutive parse failures after which the poller stops itself.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// AES key and block geometry.
pub const AES_KEY_LENGTH: usize = 16;
pub const AES_BLOCK_SIZE: usize = 16;

/// Credential shape bounds.
pub const MIN_PASSWORD_LENGTH: usize = 4;
pub const MAX_PASSWORD_LENGTH: usize = 16;
pub const MIN_PIN_LENGTH: usize = 1;
pub const MAX_PIN_LENGTH: usize = 6;
/// TT-Series passwords travel as exactly six ASCII bytes.
pub const PIN_WIRE_LENGTH: usize = 6;
/// TT-Series lock ids are exactly eight decimal digits.
pub const LOCK_ID_LENGTH: usize = 8;
