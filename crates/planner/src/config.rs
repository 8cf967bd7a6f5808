use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use rukh_channel::{BrokerConfig, ReconnectConfig};
use rukh_core::phase::Phase;
use rukh_core::topics::{Topics, DEFAULT_TOPIC_PREFIX};

const DEFAULT_BROKER_URL: &str = "memory://local";
const DEFAULT_CONSUMER_GROUP: &str = "analysis-planner";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Matches the 24 hour max age of the original work-queue streams.
const DEFAULT_JOB_RETENTION_SECS: u64 = 86_400;
const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 64;
const DEFAULT_ACK_WAIT_SECS: u64 = 30;
const DEFAULT_MAX_DELIVER: u32 = 5;
const DEFAULT_NACK_DELAY_MS: u64 = 1_000;
const DEFAULT_MESSAGE_MAX_AGE_SECS: u64 = 86_400;
/// Consolidated results outlive work-queue messages: 7 days.
const DEFAULT_RESULT_MAX_AGE_SECS: u64 = 604_800;
const DEFAULT_BROKER_CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: \"{value}\"")]
    Invalid { var: String, value: String },

    #[error("{var} must be at least 1")]
    Zero { var: String },
}

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid {
                var: "LOG_FORMAT".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Per-phase engine deadlines, falling back to [`Phase::default_timeout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTimeouts {
    overrides: HashMap<Phase, Duration>,
}

impl PhaseTimeouts {
    /// Every phase uses the same deadline. Handy in tests.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            overrides: Phase::CATALOG.iter().map(|p| (*p, timeout)).collect(),
        }
    }

    pub fn with(mut self, phase: Phase, timeout: Duration) -> Self {
        self.overrides.insert(phase, timeout);
        self
    }

    pub fn timeout_for(&self, phase: Phase) -> Duration {
        self.overrides
            .get(&phase)
            .copied()
            .unwrap_or_else(|| phase.default_timeout())
    }
}

/// Planner configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub broker_url: String,
    pub topic_prefix: String,
    /// Durable consumer group shared by every planner instance.
    pub consumer_group: String,
    /// Dispatch attempts per phase before a timeout becomes a failure.
    pub max_attempts: u32,
    pub phase_timeouts: PhaseTimeouts,
    /// How long terminal jobs stay in the registry.
    pub job_retention: Duration,
    pub eviction_interval: Duration,
    pub max_concurrent_handlers: usize,
    pub ack_wait: Duration,
    /// 0 redelivers forever.
    pub max_deliver: u32,
    pub nack_delay: Duration,
    /// Broker max age for intake, cancel, task, reply and progress topics.
    pub message_max_age: Duration,
    /// Broker max age for consolidated result envelopes.
    pub result_max_age: Duration,
    pub broker_connect_attempts: u32,
    /// Run in-process engines that answer every task (demo mode).
    pub simulated_engines: bool,
    pub log_format: LogFormat,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            phase_timeouts: PhaseTimeouts::default(),
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECS),
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            ack_wait: Duration::from_secs(DEFAULT_ACK_WAIT_SECS),
            max_deliver: DEFAULT_MAX_DELIVER,
            nack_delay: Duration::from_millis(DEFAULT_NACK_DELAY_MS),
            message_max_age: Duration::from_secs(DEFAULT_MESSAGE_MAX_AGE_SECS),
            result_max_age: Duration::from_secs(DEFAULT_RESULT_MAX_AGE_SECS),
            broker_connect_attempts: DEFAULT_BROKER_CONNECT_ATTEMPTS,
            simulated_engines: false,
            log_format: LogFormat::Pretty,
        }
    }
}

impl PlannerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default             |
    /// |-------------------------------|---------------------|
    /// | `BROKER_URL`                  | `memory://local`    |
    /// | `TOPIC_PREFIX`                | `rukh`              |
    /// | `CONSUMER_GROUP`              | `analysis-planner`  |
    /// | `MAX_ATTEMPTS`                | `3`                 |
    /// | `PHASE_TIMEOUT_<PHASE>_SECS`  | per phase           |
    /// | `JOB_RETENTION_SECS`          | `86400`             |
    /// | `EVICTION_INTERVAL_SECS`      | `3600`              |
    /// | `MAX_CONCURRENT_HANDLERS`     | `64`                |
    /// | `ACK_WAIT_SECS`               | `30`                |
    /// | `MAX_DELIVER`                 | `5`                 |
    /// | `NACK_DELAY_MS`               | `1000`              |
    /// | `MESSAGE_MAX_AGE_SECS`        | `86400`             |
    /// | `RESULT_MAX_AGE_SECS`         | `604800`            |
    /// | `BROKER_CONNECT_ATTEMPTS`     | `5`                 |
    /// | `SIMULATED_ENGINES`           | `false`             |
    /// | `LOG_FORMAT`                  | `pretty`            |
    ///
    /// `<PHASE>` is the upper-cased phase name, e.g. `PHASE_TIMEOUT_FUZZ_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut phase_timeouts = PhaseTimeouts::default();
        for phase in Phase::CATALOG {
            let var = format!("PHASE_TIMEOUT_{}_SECS", phase.as_str().to_ascii_uppercase());
            if let Some(secs) = parse_opt::<u64, _>(&lookup, &var)? {
                phase_timeouts = phase_timeouts.with(phase, Duration::from_secs(secs));
            }
        }

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => defaults.log_format,
        };

        let config = Self {
            broker_url: lookup("BROKER_URL").unwrap_or(defaults.broker_url),
            topic_prefix: lookup("TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            consumer_group: lookup("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", defaults.max_attempts)?,
            phase_timeouts,
            job_retention: secs_or(&lookup, "JOB_RETENTION_SECS", defaults.job_retention)?,
            eviction_interval: secs_or(
                &lookup,
                "EVICTION_INTERVAL_SECS",
                defaults.eviction_interval,
            )?,
            max_concurrent_handlers: parse_or(
                &lookup,
                "MAX_CONCURRENT_HANDLERS",
                defaults.max_concurrent_handlers,
            )?,
            ack_wait: secs_or(&lookup, "ACK_WAIT_SECS", defaults.ack_wait)?,
            max_deliver: parse_or(&lookup, "MAX_DELIVER", defaults.max_deliver)?,
            nack_delay: parse_opt::<u64, _>(&lookup, "NACK_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.nack_delay),
            message_max_age: secs_or(&lookup, "MESSAGE_MAX_AGE_SECS", defaults.message_max_age)?,
            result_max_age: secs_or(&lookup, "RESULT_MAX_AGE_SECS", defaults.result_max_age)?,
            broker_connect_attempts: parse_or(
                &lookup,
                "BROKER_CONNECT_ATTEMPTS",
                defaults.broker_connect_attempts,
            )?,
            simulated_engines: parse_or(&lookup, "SIMULATED_ENGINES", defaults.simulated_engines)?,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("MAX_ATTEMPTS", self.max_attempts as u64),
            ("MAX_CONCURRENT_HANDLERS", self.max_concurrent_handlers as u64),
            ("BROKER_CONNECT_ATTEMPTS", self.broker_connect_attempts as u64),
            ("EVICTION_INTERVAL_SECS", self.eviction_interval.as_secs()),
            ("MESSAGE_MAX_AGE_SECS", self.message_max_age.as_secs()),
            ("RESULT_MAX_AGE_SECS", self.result_max_age.as_secs()),
        ];
        for (var, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero {
                    var: var.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics::new(self.topic_prefix.clone())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            ack_wait: self.ack_wait,
            max_deliver: (self.max_deliver > 0).then_some(self.max_deliver),
            nack_delay: self.nack_delay,
            max_age: self.message_max_age,
            max_age_overrides: vec![(
                self.topics().final_result_pattern(),
                self.result_max_age,
            )],
        }
    }

    /// Backoff used when connecting to the broker at startup.
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(self.broker_connect_attempts),
            ..Default::default()
        }
    }
}

fn parse_opt<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

fn secs_or<F>(lookup: &F, var: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt::<u64, _>(lookup, var)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}
