use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, bail};
use tracing::{info, warn};

pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub public_url: String,
    pub oauth_clients_path: Option<PathBuf>,
    pub secure_cookies: bool,
    pub presence_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub search_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: "sqlite://hushline.db".to_owned(),
            public_url: "http://localhost:8080".to_owned(),
            oauth_clients_path: None,
            secure_cookies: false,
            presence_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            search_debounce: Duration::from_millis(300),
        }
    }
}

impl Config {
    /// Reads the environment, after folding in a `.env` file when one exists.
    pub fn load() -> anyhow::Result<Self> {
        if dotenv::dotenv().is_err() {
            info!("no .env file, using the process environment");
        }

        let defaults = Self::default();
        let config = Self {
            bind_addr: try_load("BIND_ADDR", defaults.bind_addr)?,
            database_url: try_load("DATABASE_URL", defaults.database_url)?,
            public_url: try_load::<String>("PUBLIC_URL", defaults.public_url)?
                .trim_end_matches('/')
                .to_owned(),
            oauth_clients_path: var("OAUTH_CLIENTS").map(PathBuf::from),
            secure_cookies: try_load("SECURE_COOKIES", defaults.secure_cookies)?,
            presence_timeout: Duration::from_secs(try_load("PRESENCE_TIMEOUT_SECS", defaults.presence_timeout.as_secs())?),
            sweep_interval: Duration::from_secs(try_load("SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?),
            heartbeat_interval: Duration::from_secs(try_load("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval.as_secs())?),
            search_debounce: Duration::from_millis(try_load(
                "SEARCH_DEBOUNCE_MS",
                defaults.search_debounce.as_millis() as u64,
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Timer periods drive `tokio::time::interval`, which refuses zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, value) in [
            ("PRESENCE_TIMEOUT_SECS", self.presence_timeout),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                bail!("{key} must be at least 1");
            }
        }

        if self.heartbeat_interval >= self.presence_timeout {
            warn!("HEARTBEAT_INTERVAL_SECS is not below PRESENCE_TIMEOUT_SECS, presence will flicker");
        }
        Ok(())
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key} value {value:?}: {e}")),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let sweep = Config {
            sweep_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(sweep.validate().unwrap_err().to_string().contains("SWEEP_INTERVAL_SECS"));

        let heartbeat = Config {
            heartbeat_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(heartbeat.validate().is_err());
    }
}
