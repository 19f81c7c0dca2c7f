//! Replication master configuration
//!
//! The database hands the master its settings as a flat property bag
//! (`replication.mode`, `replication.slave.host`, ...). [`parse`] turns that
//! bag into a typed [`MasterConfig`]; nothing downstream looks at raw
//! strings again. The same keys can come from a TOML file, whose nested
//! tables flatten to dotted keys.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Flat string property bag
pub type Properties = BTreeMap<String, String>;

/// Replication mode
pub const REPLICATION_MODE: &str = "replication.mode";
/// Slave host name or IP literal
pub const SLAVE_HOST: &str = "replication.slave.host";
/// Slave replication port
pub const SLAVE_PORT: &str = "replication.slave.port";
/// Log buffer capacity in bytes
pub const BUFFER_BYTES: &str = "replication.buffer.bytes";
/// Ceiling for the `resize-once` policy
pub const BUFFER_MAX_BYTES: &str = "replication.buffer.max.bytes";
/// Back-pressure policy
pub const BACKPRESSURE: &str = "replication.backpressure";
/// Batch size trigger in bytes
pub const BATCH_BYTES: &str = "replication.batch.bytes";
/// Batch age trigger
pub const BATCH_DELAY_MS: &str = "replication.batch.delay.ms";
/// Synchronous flush timeout
pub const FLUSH_TIMEOUT_MS: &str = "replication.flush.timeout.ms";
/// Longest a producer may wait inside `append_log_record`
pub const APPEND_MAX_WAIT_MS: &str = "replication.append.max.wait.ms";
/// Drain deadline for `stop_master`
pub const SHUTDOWN_DEADLINE_MS: &str = "replication.shutdown.deadline.ms";
/// TCP connect timeout
pub const CONNECT_TIMEOUT_MS: &str = "replication.connect.timeout.ms";
/// Socket read/write timeout
pub const IO_TIMEOUT_MS: &str = "replication.io.timeout.ms";
/// First reconnect delay
pub const RECONNECT_INITIAL_MS: &str = "replication.reconnect.initial.ms";
/// Reconnect delay ceiling
pub const RECONNECT_MAX_MS: &str = "replication.reconnect.max.ms";
/// Consecutive send/connect failures tolerated before escalation
pub const FAILURE_BUDGET_ATTEMPTS: &str = "replication.failure.budget.attempts";
/// Time since the first consecutive failure tolerated before escalation
pub const FAILURE_BUDGET_MS: &str = "replication.failure.budget.ms";

const KNOWN_KEYS: &[&str] = &[
    REPLICATION_MODE,
    SLAVE_HOST,
    SLAVE_PORT,
    BUFFER_BYTES,
    BUFFER_MAX_BYTES,
    BACKPRESSURE,
    BATCH_BYTES,
    BATCH_DELAY_MS,
    FLUSH_TIMEOUT_MS,
    APPEND_MAX_WAIT_MS,
    SHUTDOWN_DEADLINE_MS,
    CONNECT_TIMEOUT_MS,
    IO_TIMEOUT_MS,
    RECONNECT_INITIAL_MS,
    RECONNECT_MAX_MS,
    FAILURE_BUDGET_ATTEMPTS,
    FAILURE_BUDGET_MS,
];

/// Default log buffer capacity (32 KiB)
pub const DEFAULT_BUFFER_BYTES: usize = 32 * 1024;
/// Default batch size trigger
pub const DEFAULT_BATCH_BYTES: usize = 8 * 1024;
/// Smallest accepted buffer capacity
pub const MIN_BUFFER_BYTES: usize = 64;

/// Replication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Ship independently of local commits
    Asynchronous,
    /// Ship like asynchronous; differs only in the surrounding crash-recovery guarantees
    OneSafe,
    /// `flushed_to` blocks until the slave acks
    TwoSafe,
}

impl ReplicationMode {
    /// Property value for this mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asynchronous => "asynchronous",
            Self::OneSafe => "one-safe",
            Self::TwoSafe => "two-safe",
        }
    }

    /// True when flush callers wait for the slave
    pub fn is_synchronous(self) -> bool {
        matches!(self, Self::TwoSafe)
    }
}

impl FromStr for ReplicationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "asynchronous" => Ok(Self::Asynchronous),
            "one-safe" => Ok(Self::OneSafe),
            "two-safe" => Ok(Self::TwoSafe),
            other => Err(Error::bad_config(format!(
                "{} must be asynchronous, one-safe or two-safe, got '{}'",
                REPLICATION_MODE, other
            ))),
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `append_log_record` does when the buffer stays full after a forced drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackPressurePolicy {
    /// Fail the append and move the controller to FAILED
    #[default]
    FailFast,
    /// Grow the buffer to its ceiling once and retry the append once
    ResizeOnce,
}

impl FromStr for BackPressurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fail-fast" => Ok(Self::FailFast),
            "resize-once" => Ok(Self::ResizeOnce),
            other => Err(Error::bad_config(format!(
                "{} must be fail-fast or resize-once, got '{}'",
                BACKPRESSURE, other
            ))),
        }
    }
}

impl fmt::Display for BackPressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => f.write_str("fail-fast"),
            Self::ResizeOnce => f.write_str("resize-once"),
        }
    }
}

/// Address of the slave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveEndpoint {
    /// DNS name or IP literal
    pub host: String,
    /// TCP port (1..=65535)
    pub port: u16,
}

impl SlaveEndpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SlaveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Replication master configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Consistency mode
    pub mode: ReplicationMode,

    /// Where to ship the log
    pub slave: SlaveEndpoint,

    /// Log buffer capacity in serialized bytes
    pub buffer_bytes: usize,

    /// Capacity ceiling used by `resize-once`
    pub buffer_max_bytes: usize,

    /// Back-pressure policy on a full buffer
    pub backpressure: BackPressurePolicy,

    /// Send a batch once this many bytes are buffered
    pub batch_bytes: usize,

    /// Send a batch once the oldest unsent record is this old
    pub batch_delay: Duration,

    /// How long a synchronous `flushed_to` waits for its ack
    pub flush_timeout: Duration,

    /// Longest a producer may wait in `append_log_record`
    pub append_max_wait: Duration,

    /// Drain deadline for `stop_master`
    pub shutdown_deadline: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Socket read/write timeout
    pub io_timeout: Duration,

    /// First reconnect delay
    pub reconnect_initial: Duration,

    /// Reconnect delay ceiling
    pub reconnect_max: Duration,

    /// Consecutive failures tolerated before escalation
    pub failure_budget_attempts: u32,

    /// Time since the first consecutive failure tolerated before escalation
    pub failure_budget: Duration,
}

impl MasterConfig {
    /// Create a configuration with defaults for everything but mode and slave
    pub fn new(mode: ReplicationMode, host: impl Into<String>, port: u16) -> Self {
        Self {
            mode,
            slave: SlaveEndpoint::new(host, port),
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            buffer_max_bytes: DEFAULT_BUFFER_BYTES * 4,
            backpressure: BackPressurePolicy::FailFast,
            batch_bytes: DEFAULT_BATCH_BYTES,
            batch_delay: Duration::from_millis(20),
            flush_timeout: Duration::from_millis(5_000),
            append_max_wait: Duration::from_millis(100),
            shutdown_deadline: Duration::from_millis(2_000),
            connect_timeout: Duration::from_millis(2_000),
            io_timeout: Duration::from_millis(1_000),
            reconnect_initial: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(2_000),
            failure_budget_attempts: 20,
            failure_budget: Duration::from_millis(10_000),
        }
    }

    /// Set buffer capacity; the resize ceiling follows at four times capacity
    /// and the batch size trigger is capped at the capacity
    pub fn with_buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self.buffer_max_bytes = bytes.saturating_mul(4);
        self.batch_bytes = self.batch_bytes.min(bytes);
        self
    }

    /// Set the back-pressure policy and resize ceiling
    pub fn with_backpressure(mut self, policy: BackPressurePolicy, max_bytes: usize) -> Self {
        self.backpressure = policy;
        self.buffer_max_bytes = max_bytes;
        self
    }

    /// Set batch triggers
    pub fn with_batching(mut self, bytes: usize, delay: Duration) -> Self {
        self.batch_bytes = bytes;
        self.batch_delay = delay;
        self
    }

    /// Set synchronous flush timeout
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set the producer wait bound
    pub fn with_append_max_wait(mut self, wait: Duration) -> Self {
        self.append_max_wait = wait;
        self
    }

    /// Set the stop drain deadline
    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    /// Set the failure budget
    pub fn with_failure_budget(mut self, attempts: u32, budget: Duration) -> Self {
        self.failure_budget_attempts = attempts;
        self.failure_budget = budget;
        self
    }

    /// Set connect and socket timeouts
    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_host(&self.slave.host)?;
        if self.slave.port == 0 {
            return Err(Error::bad_config(format!(
                "{} must be in 1..=65535",
                SLAVE_PORT
            )));
        }
        if self.buffer_bytes < MIN_BUFFER_BYTES {
            return Err(Error::bad_config(format!(
                "{} must be at least {}",
                BUFFER_BYTES, MIN_BUFFER_BYTES
            )));
        }
        if self.buffer_max_bytes < self.buffer_bytes {
            return Err(Error::bad_config(format!(
                "{} ({}) is below {} ({})",
                BUFFER_MAX_BYTES, self.buffer_max_bytes, BUFFER_BYTES, self.buffer_bytes
            )));
        }
        if self.batch_bytes == 0 || self.batch_bytes > self.buffer_bytes {
            return Err(Error::bad_config(format!(
                "{} must be in 1..={}",
                BATCH_BYTES, self.buffer_bytes
            )));
        }
        if self.flush_timeout.is_zero() {
            return Err(Error::bad_config(format!("{} must be positive", FLUSH_TIMEOUT_MS)));
        }
        if self.io_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::bad_config("connect and io timeouts must be positive"));
        }
        if self.reconnect_initial.is_zero() || self.reconnect_max < self.reconnect_initial {
            return Err(Error::bad_config(format!(
                "{} must be positive and not above {}",
                RECONNECT_INITIAL_MS, RECONNECT_MAX_MS
            )));
        }
        if self.failure_budget_attempts == 0 {
            return Err(Error::bad_config(format!(
                "{} must be at least 1",
                FAILURE_BUDGET_ATTEMPTS
            )));
        }
        Ok(())
    }

    /// Render back to a property bag
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        let mut put = |key: &str, value: String| {
            props.insert(key.to_string(), value);
        };
        put(REPLICATION_MODE, self.mode.to_string());
        put(SLAVE_HOST, self.slave.host.clone());
        put(SLAVE_PORT, self.slave.port.to_string());
        put(BUFFER_BYTES, self.buffer_bytes.to_string());
        put(BUFFER_MAX_BYTES, self.buffer_max_bytes.to_string());
        put(BACKPRESSURE, self.backpressure.to_string());
        put(BATCH_BYTES, self.batch_bytes.to_string());
        put(BATCH_DELAY_MS, millis(self.batch_delay));
        put(FLUSH_TIMEOUT_MS, millis(self.flush_timeout));
        put(APPEND_MAX_WAIT_MS, millis(self.append_max_wait));
        put(SHUTDOWN_DEADLINE_MS, millis(self.shutdown_deadline));
        put(CONNECT_TIMEOUT_MS, millis(self.connect_timeout));
        put(IO_TIMEOUT_MS, millis(self.io_timeout));
        put(RECONNECT_INITIAL_MS, millis(self.reconnect_initial));
        put(RECONNECT_MAX_MS, millis(self.reconnect_max));
        put(
            FAILURE_BUDGET_ATTEMPTS,
            self.failure_budget_attempts.to_string(),
        );
        put(FAILURE_BUDGET_MS, millis(self.failure_budget));
        props
    }

    /// Parse a TOML document
    ///
    /// ```toml
    /// [replication]
    /// mode = "two-safe"
    /// slave = { host = "standby.local", port = 4851 }
    /// buffer.bytes = 65536
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let value: toml::Table = source
            .parse()
            .map_err(|e: toml::de::Error| Error::bad_config(format!("invalid TOML: {}", e)))?;
        let mut props = Properties::new();
        flatten_toml("", &toml::Value::Table(value), &mut props)?;
        parse(&props)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::bad_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }
}

/// True iff the bag names a recognized replication mode. No side effects.
pub fn can_support(props: &Properties) -> bool {
    props
        .get(REPLICATION_MODE)
        .is_some_and(|mode| mode.parse::<ReplicationMode>().is_ok())
}

/// Parse and validate a property bag
///
/// Keys outside the `replication.` namespace are ignored; unknown keys
/// inside it are rejected so typos do not silently fall back to defaults.
pub fn parse(props: &Properties) -> Result<MasterConfig> {
    if let Some(unknown) = props
        .keys()
        .filter(|k| k.starts_with("replication."))
        .find(|k| !KNOWN_KEYS.contains(&k.as_str()))
    {
        return Err(Error::bad_config(format!("unknown key '{}'", unknown)));
    }

    let mode: ReplicationMode = required(props, REPLICATION_MODE)?.parse()?;
    let host = required(props, SLAVE_HOST)?.trim().to_string();
    let port = required(props, SLAVE_PORT)?;
    let port = port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            Error::bad_config(format!("{} must be in 1..=65535, got '{}'", SLAVE_PORT, port))
        })?;

    let mut config = MasterConfig::new(mode, host, port);
    config.buffer_bytes = number(props, BUFFER_BYTES, config.buffer_bytes as u64)? as usize;
    config.buffer_max_bytes = number(
        props,
        BUFFER_MAX_BYTES,
        config.buffer_bytes.saturating_mul(4) as u64,
    )? as usize;
    if let Some(policy) = props.get(BACKPRESSURE) {
        config.backpressure = policy.parse()?;
    }
    let default_batch = config.batch_bytes.min(config.buffer_bytes);
    config.batch_bytes = number(props, BATCH_BYTES, default_batch as u64)? as usize;
    config.batch_delay = duration(props, BATCH_DELAY_MS, config.batch_delay)?;
    config.flush_timeout = duration(props, FLUSH_TIMEOUT_MS, config.flush_timeout)?;
    config.append_max_wait = duration(props, APPEND_MAX_WAIT_MS, config.append_max_wait)?;
    config.shutdown_deadline = duration(props, SHUTDOWN_DEADLINE_MS, config.shutdown_deadline)?;
    config.connect_timeout = duration(props, CONNECT_TIMEOUT_MS, config.connect_timeout)?;
    config.io_timeout = duration(props, IO_TIMEOUT_MS, config.io_timeout)?;
    config.reconnect_initial = duration(props, RECONNECT_INITIAL_MS, config.reconnect_initial)?;
    config.reconnect_max = duration(props, RECONNECT_MAX_MS, config.reconnect_max)?;
    config.failure_budget_attempts = u32::try_from(number(
        props,
        FAILURE_BUDGET_ATTEMPTS,
        config.failure_budget_attempts as u64,
    )?)
    .map_err(|_| Error::bad_config(format!("{} is out of range", FAILURE_BUDGET_ATTEMPTS)))?;
    config.failure_budget = duration(props, FAILURE_BUDGET_MS, config.failure_budget)?;

    config.validate()?;
    Ok(config)
}

fn required<'a>(props: &'a Properties, key: &str) -> Result<&'a str> {
    props
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::bad_config(format!("missing required key '{}'", key)))
}

fn number(props: &Properties, key: &str, default: u64) -> Result<u64> {
    match props.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
            Error::bad_config(format!("{} must be a non-negative integer, got '{}'", key, raw))
        }),
    }
}

fn duration(props: &Properties, key: &str, default: Duration) -> Result<Duration> {
    number(props, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn millis(d: Duration) -> String {
    d.as_millis().to_string()
}

fn validate_host(host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    let name = host.strip_suffix('.').unwrap_or(host);
    if name.is_empty() || name.len() > 253 || !name.split('.').all(valid_label) {
        return Err(Error::bad_config(format!(
            "{} '{}' is neither an IP literal nor a DNS name",
            SLAVE_HOST, host
        )));
    }
    Ok(())
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut Properties) -> Result<()> {
    let scalar = match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_toml(&path, child, out)?;
            }
            return Ok(());
        }
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        other => {
            return Err(Error::bad_config(format!(
                "unsupported TOML value for '{}': {}",
                prefix,
                other.type_str()
            )));
        }
    };
    out.insert(prefix.to_string(), scalar);
    Ok(())
}
