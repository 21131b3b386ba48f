// Worker constants (no magic values)
use std::time::Duration;

/// Default job-level retry base delay; attempt N waits N times this
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default number of concurrent workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Grace period between SIGTERM and SIGKILL for external git processes
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a terminated process to exit
pub const PROCESS_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backend time past its deadline or a cancellation before it is dropped.
/// Exceeds `GRACEFUL_SHUTDOWN_TIMEOUT` so a terminated git process is reaped.
pub const BACKEND_STOP_GRACE: Duration =
    Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() + 1);

/// Written into a mirror once its clone completed; absent means partial
pub const MIRROR_MARKER_FILE: &str = ".bitvault-mirror-complete";
