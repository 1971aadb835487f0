//! Run-time configuration for the telemetry collector.
//!
//! Keys mirror the `telemetry_*` directives of the surrounding accounting
//! suite: one flat table, every key optional, defaults documented on the
//! accessors. Loaded once at start-up; never mutated afterwards.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default TCP port peers dial in to.
pub const DEFAULT_PORT: u16 = 50000;
/// Default peer-table capacity.
pub const DEFAULT_MAX_PEERS: usize = 4;
/// Default broker reconnect interval, in seconds.
pub const DEFAULT_BROKER_RETRY: u64 = 60;

const DEFAULT_AMQP_USER: &str = "guest";
const DEFAULT_AMQP_PASSWD: &str = "guest";
const DEFAULT_AMQP_EXCHANGE: &str = "telemd";
const DEFAULT_AMQP_EXCHANGE_TYPE: &str = "direct";
const DEFAULT_AMQP_HOST: &str = "localhost";
const DEFAULT_AMQP_VHOST: &str = "/";

const DEFAULT_KAFKA_BROKER_HOST: &str = "127.0.0.1";
const DEFAULT_KAFKA_BROKER_PORT: u16 = 9092;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0} are mutually exclusive")]
    ExclusiveBackends(&'static str),
    #[error("'telemetry_ipprec' must be within 0-7, got {0}")]
    IpPrecedence(u8),
    #[error("'telemetry_ip' value is not a valid IPv4/IPv6 address: '{0}'")]
    BindAddr(String),
}

/// Record serialization for an output channel. JSON is the only format
/// this build carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
}

/// Backend selected for an output channel; at most one per channel. The
/// carried string is a name template, rendered per peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMethod {
    /// File path template.
    File(String),
    /// AMQP routing-key template.
    Amqp(String),
    /// Kafka topic template.
    Kafka(String),
}

impl OutputMethod {
    pub fn template(&self) -> &str {
        match self {
            OutputMethod::File(t) | OutputMethod::Amqp(t) | OutputMethod::Kafka(t) => t,
        }
    }
}

/// AMQP endpoint parameters for one output channel.
#[derive(Debug, Clone)]
pub struct AmqpParams {
    pub user: String,
    pub passwd: String,
    pub exchange: String,
    pub exchange_type: String,
    pub host: String,
    pub vhost: String,
    pub persistent_msg: bool,
    pub frame_max: Option<u32>,
    pub heartbeat_interval: Option<u16>,
    pub retry: u64,
}

/// Kafka endpoint parameters for one output channel.
#[derive(Debug, Clone)]
pub struct KafkaParams {
    pub broker_host: String,
    pub broker_port: u16,
    pub partition: Option<i32>,
    pub retry: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub telemetry_ip: Option<String>,
    pub telemetry_port: Option<u16>,
    pub telemetry_max_peers: Option<usize>,
    pub telemetry_ipprec: Option<u8>,
    pub telemetry_pipe_size: Option<usize>,
    pub telemetry_allow_file: Option<PathBuf>,

    pub telemetry_msglog_file: Option<String>,
    pub telemetry_msglog_amqp_routing_key: Option<String>,
    pub telemetry_msglog_kafka_topic: Option<String>,
    pub telemetry_msglog_output: Option<OutputFormat>,

    pub telemetry_dump_file: Option<String>,
    pub telemetry_dump_amqp_routing_key: Option<String>,
    pub telemetry_dump_kafka_topic: Option<String>,
    pub telemetry_dump_output: Option<OutputFormat>,
    pub telemetry_dump_refresh_time: Option<u64>,
    pub telemetry_dump_latest_file: Option<String>,

    pub telemetry_msglog_amqp_user: Option<String>,
    pub telemetry_msglog_amqp_passwd: Option<String>,
    pub telemetry_msglog_amqp_exchange: Option<String>,
    pub telemetry_msglog_amqp_exchange_type: Option<String>,
    pub telemetry_msglog_amqp_host: Option<String>,
    pub telemetry_msglog_amqp_vhost: Option<String>,
    pub telemetry_msglog_amqp_persistent_msg: Option<bool>,
    pub telemetry_msglog_amqp_frame_max: Option<u32>,
    pub telemetry_msglog_amqp_heartbeat_interval: Option<u16>,
    pub telemetry_msglog_amqp_retry: Option<u64>,

    pub telemetry_dump_amqp_user: Option<String>,
    pub telemetry_dump_amqp_passwd: Option<String>,
    pub telemetry_dump_amqp_exchange: Option<String>,
    pub telemetry_dump_amqp_exchange_type: Option<String>,
    pub telemetry_dump_amqp_host: Option<String>,
    pub telemetry_dump_amqp_vhost: Option<String>,
    pub telemetry_dump_amqp_persistent_msg: Option<bool>,
    pub telemetry_dump_amqp_frame_max: Option<u32>,
    pub telemetry_dump_amqp_heartbeat_interval: Option<u16>,
    pub telemetry_dump_amqp_retry: Option<u64>,

    pub telemetry_msglog_kafka_broker_host: Option<String>,
    pub telemetry_msglog_kafka_broker_port: Option<u16>,
    pub telemetry_msglog_kafka_partition: Option<i32>,
    pub telemetry_msglog_kafka_retry: Option<u64>,

    pub telemetry_dump_kafka_broker_host: Option<String>,
    pub telemetry_dump_kafka_broker_port: Option<u16>,
    pub telemetry_dump_kafka_partition: Option<i32>,
    pub telemetry_dump_kafka_retry: Option<u64>,

    /// Render record timestamps as epoch seconds rather than ISO 8601.
    #[serde(default)]
    pub timestamps_since_epoch: bool,
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Reject inconsistent configurations up front, before any socket or
    /// broker work happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;
        if let Some(prec) = self.telemetry_ipprec {
            if prec > 7 {
                return Err(ConfigError::IpPrecedence(prec));
            }
        }
        self.msglog_method()?;
        self.dump_method()?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.telemetry_port.unwrap_or(DEFAULT_PORT)
    }

    pub fn max_peers(&self) -> usize {
        self.telemetry_max_peers.unwrap_or(DEFAULT_MAX_PEERS)
    }

    pub fn ipprec(&self) -> Option<u8> {
        self.telemetry_ipprec
    }

    pub fn pipe_size(&self) -> Option<usize> {
        self.telemetry_pipe_size
    }

    pub fn allow_file(&self) -> Option<&Path> {
        self.telemetry_allow_file.as_deref()
    }

    /// Configured bind address, if any. Surrounding whitespace is
    /// tolerated; anything unparsable is a fatal init error.
    pub fn bind_ip(&self) -> Result<Option<IpAddr>, ConfigError> {
        match &self.telemetry_ip {
            None => Ok(None),
            Some(s) => s
                .trim()
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| ConfigError::BindAddr(s.clone())),
        }
    }

    /// Backend of the message-log channel: file XOR amqp XOR kafka.
    pub fn msglog_method(&self) -> Result<Option<OutputMethod>, ConfigError> {
        let mut methods = 0;
        let mut selected = None;
        if let Some(path) = &self.telemetry_msglog_file {
            methods += 1;
            selected = Some(OutputMethod::File(path.clone()));
        }
        if let Some(key) = &self.telemetry_msglog_amqp_routing_key {
            methods += 1;
            selected = Some(OutputMethod::Amqp(key.clone()));
        }
        if let Some(topic) = &self.telemetry_msglog_kafka_topic {
            methods += 1;
            selected = Some(OutputMethod::Kafka(topic.clone()));
        }
        if methods > 1 {
            return Err(ConfigError::ExclusiveBackends(
                "telemetry_msglog_file, telemetry_msglog_amqp_routing_key and \
                 telemetry_msglog_kafka_topic",
            ));
        }
        Ok(selected)
    }

    /// Backend of the dump channel: file XOR amqp XOR kafka.
    pub fn dump_method(&self) -> Result<Option<OutputMethod>, ConfigError> {
        let mut methods = 0;
        let mut selected = None;
        if let Some(path) = &self.telemetry_dump_file {
            methods += 1;
            selected = Some(OutputMethod::File(path.clone()));
        }
        if let Some(key) = &self.telemetry_dump_amqp_routing_key {
            methods += 1;
            selected = Some(OutputMethod::Amqp(key.clone()));
        }
        if let Some(topic) = &self.telemetry_dump_kafka_topic {
            methods += 1;
            selected = Some(OutputMethod::Kafka(topic.clone()));
        }
        if methods > 1 {
            return Err(ConfigError::ExclusiveBackends(
                "telemetry_dump_file, telemetry_dump_amqp_routing_key and \
                 telemetry_dump_kafka_topic",
            ));
        }
        Ok(selected)
    }

    pub fn msglog_output(&self) -> OutputFormat {
        self.telemetry_msglog_output.unwrap_or_default()
    }

    pub fn dump_output(&self) -> OutputFormat {
        self.telemetry_dump_output.unwrap_or_default()
    }

    /// Dump period in seconds; zero disables the dump channel.
    pub fn dump_refresh_time(&self) -> u64 {
        self.telemetry_dump_refresh_time.unwrap_or(0)
    }

    pub fn dump_latest_file(&self) -> Option<String> {
        self.telemetry_dump_latest_file.clone()
    }

    pub fn msglog_amqp(&self) -> AmqpParams {
        AmqpParams {
            user: or_default(&self.telemetry_msglog_amqp_user, DEFAULT_AMQP_USER),
            passwd: or_default(&self.telemetry_msglog_amqp_passwd, DEFAULT_AMQP_PASSWD),
            exchange: or_default(&self.telemetry_msglog_amqp_exchange, DEFAULT_AMQP_EXCHANGE),
            exchange_type: or_default(
                &self.telemetry_msglog_amqp_exchange_type,
                DEFAULT_AMQP_EXCHANGE_TYPE,
            ),
            host: or_default(&self.telemetry_msglog_amqp_host, DEFAULT_AMQP_HOST),
            vhost: or_default(&self.telemetry_msglog_amqp_vhost, DEFAULT_AMQP_VHOST),
            persistent_msg: self.telemetry_msglog_amqp_persistent_msg.unwrap_or(false),
            frame_max: self.telemetry_msglog_amqp_frame_max,
            heartbeat_interval: self.telemetry_msglog_amqp_heartbeat_interval,
            retry: self.telemetry_msglog_amqp_retry.unwrap_or(DEFAULT_BROKER_RETRY),
        }
    }

    pub fn dump_amqp(&self) -> AmqpParams {
        AmqpParams {
            user: or_default(&self.telemetry_dump_amqp_user, DEFAULT_AMQP_USER),
            passwd: or_default(&self.telemetry_dump_amqp_passwd, DEFAULT_AMQP_PASSWD),
            exchange: or_default(&self.telemetry_dump_amqp_exchange, DEFAULT_AMQP_EXCHANGE),
            exchange_type: or_default(
                &self.telemetry_dump_amqp_exchange_type,
                DEFAULT_AMQP_EXCHANGE_TYPE,
            ),
            host: or_default(&self.telemetry_dump_amqp_host, DEFAULT_AMQP_HOST),
            vhost: or_default(&self.telemetry_dump_amqp_vhost, DEFAULT_AMQP_VHOST),
            persistent_msg: self.telemetry_dump_amqp_persistent_msg.unwrap_or(false),
            frame_max: self.telemetry_dump_amqp_frame_max,
            heartbeat_interval: self.telemetry_dump_amqp_heartbeat_interval,
            retry: self.telemetry_dump_amqp_retry.unwrap_or(DEFAULT_BROKER_RETRY),
        }
    }

    pub fn msglog_kafka(&self) -> KafkaParams {
        KafkaParams {
            broker_host: or_default(
                &self.telemetry_msglog_kafka_broker_host,
                DEFAULT_KAFKA_BROKER_HOST,
            ),
            broker_port: self
                .telemetry_msglog_kafka_broker_port
                .unwrap_or(DEFAULT_KAFKA_BROKER_PORT),
            partition: self.telemetry_msglog_kafka_partition,
            retry: self.telemetry_msglog_kafka_retry.unwrap_or(DEFAULT_BROKER_RETRY),
        }
    }

    pub fn dump_kafka(&self) -> KafkaParams {
        KafkaParams {
            broker_host: or_default(
                &self.telemetry_dump_kafka_broker_host,
                DEFAULT_KAFKA_BROKER_HOST,
            ),
            broker_port: self
                .telemetry_dump_kafka_broker_port
                .unwrap_or(DEFAULT_KAFKA_BROKER_PORT),
            partition: self.telemetry_dump_kafka_partition,
            retry: self.telemetry_dump_kafka_retry.unwrap_or(DEFAULT_BROKER_RETRY),
        }
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_owned())
}
