//! Worker configuration.
//!
//! Every setting has a default; the environment only overrides. Durations
//! are given in whole milliseconds (`*_MS`) or seconds (`*_SECS`).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::webhook::DEFAULT_MAX_ATTEMPTS;

/// Prefix of every environment variable read by [`RelayConfig::from_env`].
pub const ENV_PREFIX: &str = "RELAY_";

/// Event publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Identity written to claimed rows.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Attempts before an event is dead-lettered.
    pub max_attempts: u32,
    /// Release claims older than this at the start of each tick. Off when `None`.
    pub stale_claim_timeout: Option<Duration>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("publisher-{}", std::process::id()),
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_attempts: 10,
            stale_claim_timeout: None,
        }
    }
}

/// Webhook dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed delivery stays invisible to other dispatchers.
    pub lease: Duration,
    pub request_timeout: Duration,
    /// Characters of the receiver's response body kept on the delivery.
    pub response_body_limit: usize,
    /// Budget for organizations without a policy row.
    pub default_max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            lease: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            response_body_limit: 1024,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    pub publisher: PublisherConfig,
    pub dispatcher: DispatcherConfig,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `RELAY_PUBLISHER_WORKER_ID`
    /// - `RELAY_PUBLISHER_POLL_INTERVAL_MS` (default 5000)
    /// - `RELAY_PUBLISHER_BATCH_SIZE` (default 100)
    /// - `RELAY_PUBLISHER_MAX_ATTEMPTS` (default 10)
    /// - `RELAY_PUBLISHER_STALE_CLAIM_TIMEOUT_SECS` (unset: never release claims)
    /// - `RELAY_DISPATCHER_POLL_INTERVAL_MS` (default 5000)
    /// - `RELAY_DISPATCHER_BATCH_SIZE` (default 100)
    /// - `RELAY_DISPATCHER_LEASE_SECS` (default 60)
    /// - `RELAY_DISPATCHER_TIMEOUT_SECS` (default 10)
    /// - `RELAY_DISPATCHER_RESPONSE_BODY_LIMIT` (default 1024)
    /// - `RELAY_DISPATCHER_MAX_ATTEMPTS` (default 10)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        let p = &mut config.publisher;
        if let Some(id) = vars.string("PUBLISHER_WORKER_ID") {
            p.worker_id = id;
        }
        vars.millis("PUBLISHER_POLL_INTERVAL_MS", &mut p.poll_interval)?;
        vars.positive("PUBLISHER_BATCH_SIZE", &mut p.batch_size)?;
        vars.positive("PUBLISHER_MAX_ATTEMPTS", &mut p.max_attempts)?;
        if let Some(secs) = vars.parse::<u64>("PUBLISHER_STALE_CLAIM_TIMEOUT_SECS")? {
            p.stale_claim_timeout = Some(Duration::from_secs(secs));
        }

        let d = &mut config.dispatcher;
        vars.millis("DISPATCHER_POLL_INTERVAL_MS", &mut d.poll_interval)?;
        vars.positive("DISPATCHER_BATCH_SIZE", &mut d.batch_size)?;
        vars.secs("DISPATCHER_LEASE_SECS", &mut d.lease)?;
        vars.secs("DISPATCHER_TIMEOUT_SECS", &mut d.request_timeout)?;
        vars.positive("DISPATCHER_RESPONSE_BODY_LIMIT", &mut d.response_body_limit)?;
        vars.positive("DISPATCHER_MAX_ATTEMPTS", &mut d.default_max_attempts)?;

        if d.lease <= d.request_timeout {
            return Err(RelayError::ConfigInvalid {
                var: format!("{ENV_PREFIX}DISPATCHER_LEASE_SECS"),
                reason: "lease must be longer than the request timeout".to_string(),
            });
        }

        Ok(config)
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| RelayError::ConfigInvalid {
                var: format!("{ENV_PREFIX}{name}"),
                reason: format!("'{raw}': {e}"),
            }),
        }
    }

    fn positive<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr + Default + PartialEq,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse::<T>(name)? {
            if value == T::default() {
                return Err(RelayError::ConfigInvalid {
                    var: format!("{ENV_PREFIX}{name}"),
                    reason: "must be greater than zero".to_string(),
                });
            }
            *target = value;
        }
        Ok(())
    }

    fn millis(&self, name: &str, target: &mut Duration) -> Result<()> {
        let mut ms = 0u64;
        self.positive(name, &mut ms)?;
        if ms > 0 {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn secs(&self, name: &str, target: &mut Duration) -> Result<()> {
        let mut secs = 0u64;
        self.positive(name, &mut secs)?;
        if secs > 0 {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }
}
