use std::env;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

/// Tideline engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base http(s) URL of the conversation server (defaults to local dev)
    pub server: String,
    /// Bearer token presented over both the socket hello and HTTP calls
    pub token: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server =
            env::var("TIDELINE_SERVER").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.contains("//localhost") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let token = env::var("TIDELINE_TOKEN").unwrap_or_default();
        Self { server, token }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            token: String::new(),
        }
    }
}

/// Timing knobs for the synchronizer. Defaults are the production values;
/// tests shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Fixed cadence of the fallback pull loop
    pub poll_interval: Duration,
    /// Bound on a single poll request before the tick is skipped
    pub poll_request_timeout: Duration,
    /// How many recent messages one pull asks for
    pub poll_limit: usize,
    /// How long a typing signal stays visible without a refresh
    pub typing_window: Duration,
    /// Minimum gap between two outbound typing refreshes
    pub typing_debounce: Duration,
    /// Bound on the socket handshake before the attempt counts as failed
    pub handshake_timeout: Duration,
    /// First reconnect delay; doubles per consecutive failure
    pub backoff_base: Duration,
    /// Ceiling on the doubled reconnect delay
    pub backoff_cap: Duration,
    /// Automatic reconnect attempts before the supervisor goes offline
    pub max_reconnect_attempts: u32,
}

impl SyncTuning {
    /// Delay before the next automatic reconnect, given how many delayed
    /// retries have already been issued since the last successful open.
    pub fn reconnect_delay(&self, retries_issued: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries_issued);
        std::cmp::min(self.backoff_base.saturating_mul(factor), self.backoff_cap)
    }
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_request_timeout: Duration::from_secs(4),
            poll_limit: 50,
            typing_window: Duration::from_secs(2),
            typing_debounce: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}
