use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Root for all persisted state; defaults to `~/.sable` when unset.
    pub SABLE_HOME: Option<&str> = None;

    pub SABLE_REQUEST_MAX_RETRIES: u64 = 4;

    /// Silent SSE streams are treated as disconnected after this long.
    pub SABLE_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Container image used by the docker sandbox backend.
    pub SABLE_SANDBOX_IMAGE: &str = "alpine:3.20";

    /// Fixture path for offline provider tests (see providers/mod.rs).
    pub SABLE_SSE_FIXTURE: Option<&str> = None;
}
