use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Relay tunables, read from the process environment with defaults
/// matching the whiteboard client's expectations (port 9000).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// A session silent for longer than this is evicted.
    pub idle_timeout: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
    /// Capacity of each connection's bounded outbound queue.
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            outbound_queue: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env_parsed("PORT", defaults.port),
            idle_timeout: Duration::from_secs(env_parsed(
                "IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parsed(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            // A zero-capacity channel is not constructible.
            outbound_queue: env_parsed("OUTBOUND_QUEUE", defaults.outbound_queue).max(1),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parsed<T: FromStr + Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!(
                    "{}: unparseable value {:?}, falling back to {}",
                    key,
                    raw,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}
