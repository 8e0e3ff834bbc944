//! Client connection settings.

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a persistent client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Smallest delay between reconnect attempts.
    #[serde(rename = "reconnect_min_ms", with = "millis")]
    pub reconnect_min: Duration,

    /// Largest delay between reconnect attempts.
    #[serde(rename = "reconnect_max_ms", with = "millis")]
    pub reconnect_max: Duration,

    /// Liveness ping interval. Must be below half of `timeout`.
    #[serde(rename = "ping_interval_ms", with = "millis")]
    pub ping_interval: Duration,

    /// A connection that stays silent this long is considered dropped; also
    /// bounds connecting and the handshake.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    /// Make the first drop terminal.
    pub no_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            no_reconnect: false,
        }
    }
}

impl ClientConfig {
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max;
        self
    }

    /// Must be < timeout / 2.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_no_reconnect(mut self) -> Self {
        self.no_reconnect = true;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_min, self.reconnect_max)
    }

    /// Check the settings are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(Error::Config("ping interval must be non-zero".to_string()));
        }
        if self.ping_interval >= self.timeout / 2 {
            return Err(Error::Config(format!(
                "ping interval {:?} must be less than half the timeout {:?}",
                self.ping_interval, self.timeout
            )));
        }
        if self.reconnect_min > self.reconnect_max {
            return Err(Error::Config(format!(
                "reconnect backoff min {:?} exceeds max {:?}",
                self.reconnect_min, self.reconnect_max
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
