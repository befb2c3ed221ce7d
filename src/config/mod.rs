use std::{env, error::Error, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub admin_basic_user: String,
    pub admin_basic_pass: String,
    pub max_request_size_bytes: usize,
    pub request_timeout_ms: u64,
    pub trust_proxy: bool,
    pub replay_timeout_ms: u64,
    pub replay_max_response_size_bytes: usize,
    pub replay_max_retries: u32,
    pub replay_initial_backoff_ms: u64,
}

/// Bounds applied while a delivery is being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub max_body_bytes: usize,
    pub deadline: Duration,
    pub trust_proxy: bool,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_REQUEST_SIZE_KB * 1024,
            deadline: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            trust_proxy: false,
        }
    }
}

/// Timeout, response cap and retry schedule for outbound replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    pub attempt_timeout: Duration,
    pub max_response_bytes: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(DEFAULT_REPLAY_TIMEOUT_MS),
            max_response_bytes: DEFAULT_REPLAY_MAX_RESPONSE_SIZE_KB * 1024,
            max_retries: DEFAULT_REPLAY_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_REPLAY_INITIAL_BACKOFF_MS),
        }
    }
}

impl ReplayPolicy {
    /// Delay before the given retry (1-based): initial, 2x initial, 4x initial, ...
    pub fn backoff_before_retry(&self, retry: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(multiplier)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

const DEFAULT_MAX_REQUEST_SIZE_KB: usize = 256;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REPLAY_MAX_RESPONSE_SIZE_KB: usize = 1024;
const DEFAULT_REPLAY_MAX_RETRIES: u32 = 2;
const DEFAULT_REPLAY_INITIAL_BACKOFF_MS: u64 = 1_000;

fn optional_var<T>(name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: Error + 'static,
{
    match env::var(name) {
        Ok(raw) => Ok(raw.trim().parse::<T>()?),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(Box::new(err)),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR")?;
        let admin_basic_user = env::var("ADMIN_BASIC_USER")?;
        let admin_basic_pass = env::var("ADMIN_BASIC_PASS")?;
        let max_request_size_bytes =
            optional_var("MAX_REQUEST_SIZE_KB", DEFAULT_MAX_REQUEST_SIZE_KB)? * 1024;
        let request_timeout_ms = optional_var("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        let trust_proxy = optional_var("TRUST_PROXY", false)?;
        let replay_timeout_ms = optional_var("REPLAY_TIMEOUT_MS", DEFAULT_REPLAY_TIMEOUT_MS)?;
        let replay_max_response_size_bytes = optional_var(
            "REPLAY_MAX_RESPONSE_SIZE_KB",
            DEFAULT_REPLAY_MAX_RESPONSE_SIZE_KB,
        )? * 1024;
        let replay_max_retries = optional_var("REPLAY_MAX_RETRIES", DEFAULT_REPLAY_MAX_RETRIES)?;
        let replay_initial_backoff_ms = optional_var(
            "REPLAY_INITIAL_BACKOFF_MS",
            DEFAULT_REPLAY_INITIAL_BACKOFF_MS,
        )?;

        Ok(Self {
            database_url,
            bind_addr,
            admin_basic_user,
            admin_basic_pass,
            max_request_size_bytes,
            request_timeout_ms,
            trust_proxy,
            replay_timeout_ms,
            replay_max_response_size_bytes,
            replay_max_retries,
            replay_initial_backoff_ms,
        })
    }

    pub fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            max_body_bytes: self.max_request_size_bytes,
            deadline: Duration::from_millis(self.request_timeout_ms),
            trust_proxy: self.trust_proxy,
        }
    }

    pub fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy {
            attempt_timeout: Duration::from_millis(self.replay_timeout_ms),
            max_response_bytes: self.replay_max_response_size_bytes,
            max_retries: self.replay_max_retries,
            initial_backoff: Duration::from_millis(self.replay_initial_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const OPTIONAL_VARS: [&str; 7] = [
        "MAX_REQUEST_SIZE_KB",
        "REQUEST_TIMEOUT_MS",
        "TRUST_PROXY",
        "REPLAY_TIMEOUT_MS",
        "REPLAY_MAX_RESPONSE_SIZE_KB",
        "REPLAY_MAX_RETRIES",
        "REPLAY_INITIAL_BACKOFF_MS",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn set_required() {
        env::set_var("DATABASE_URL", "postgres://localhost/db");
        env::set_var("BIND_ADDR", "127.0.0.1:3000");
        env::set_var("ADMIN_BASIC_USER", "admin");
        env::set_var("ADMIN_BASIC_PASS", "secret");
        for name in OPTIONAL_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn applies_defaults_when_optional_values_are_absent() {
        let _guard = env_lock().lock().expect("env lock should be acquired");
        set_required();

        let config = AppConfig::from_env().expect("config should parse");

        assert_eq!(config.max_request_size_bytes, 256 * 1024);
        assert_eq!(config.capture_limits().deadline, Duration::from_secs(30));
        assert!(!config.trust_proxy);

        let policy = config.replay_policy();
        assert_eq!(policy, ReplayPolicy::default());
        assert_eq!(policy.attempt_timeout, Duration::from_secs(10));
        assert_eq!(policy.max_response_bytes, 1024 * 1024);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn parses_overrides_and_rejects_garbage() {
        let _guard = env_lock().lock().expect("env lock should be acquired");
        set_required();
        env::set_var("MAX_REQUEST_SIZE_KB", "64");
        env::set_var("TRUST_PROXY", "true");
        env::set_var("REPLAY_MAX_RETRIES", "5");

        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.max_request_size_bytes, 64 * 1024);
        assert!(config.capture_limits().trust_proxy);
        assert_eq!(config.replay_policy().max_attempts(), 6);

        env::set_var("REPLAY_TIMEOUT_MS", "soon");
        assert!(AppConfig::from_env().is_err());
        env::remove_var("REPLAY_TIMEOUT_MS");
    }

    #[test]
    fn backoff_doubles_from_the_initial_delay() {
        let policy = ReplayPolicy::default();

        assert_eq!(policy.backoff_before_retry(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_before_retry(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_before_retry(3), Duration::from_secs(4));
    }
}
