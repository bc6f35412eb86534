use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{router::DeliveryMode, Error, InternalResult};

/// Top-level configuration for a composed event system.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub correlator: CorrelatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Delivery mode used by `publish` when none is given explicitly
    #[serde(default)]
    pub default_mode: DeliveryMode,

    /// Upper bound on a single handler invocation; `None` disables the bound
    #[serde(default = "default_handler_timeout", with = "opt_duration_ms")]
    pub handler_timeout: Option<Duration>,

    /// Emit a `system.delivery.confirmation` event per handler outcome
    #[serde(default)]
    pub delivery_confirmation: bool,

    #[serde(default = "default_failure_channel_capacity")]
    pub failure_channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_mode: DeliveryMode::default(),
            handler_timeout: default_handler_timeout(),
            delivery_confirmation: false,
            failure_channel_capacity: default_failure_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Group size at which the default completion rule fires
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: usize,

    #[serde(default = "default_sweep_config")]
    pub sweep: Option<SweepConfig>,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            completion_threshold: default_completion_threshold(),
            sweep: default_sweep_config(),
        }
    }
}

/// Settings for the background task reclaiming abandoned correlation groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval", with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Groups untouched for longer than this are dropped
    #[serde(default = "default_group_idle_timeout", with = "duration_ms")]
    pub group_idle_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sweep_interval: default_sweep_interval(),
            group_idle_timeout: default_group_idle_timeout(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

impl SystemConfig {
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}

fn default_true() -> bool {
    true
}
fn default_handler_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}
fn default_failure_channel_capacity() -> usize {
    128
}
fn default_completion_threshold() -> usize {
    2
}
fn default_sweep_config() -> Option<SweepConfig> {
    Some(SweepConfig::default())
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_group_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
