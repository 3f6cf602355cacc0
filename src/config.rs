use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use coap_core::behavior::Behavior;
use serde::{Deserialize, Serialize};

///
/// Listener
///
/// The address and port the endpoint's UDP socket is bound to. Multiple
/// listeners can be bound at the same time; the binding address supports
/// both ipv4 and ipv6.
///
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Listener {
    pub listen: SocketAddr,
}

///
/// Behavior configuration
///
/// Immutable protocol constants from RFC 7252 §4.8. Maps 1:1 onto the
/// endpoint's `Behavior` context; changing these changes how aggressively
/// the endpoint retransmits and how large a message it will send or accept
/// without blockwise segmentation.
///
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct BehaviorConfig {
    ///
    /// Largest outbound message the endpoint will send unsegmented, in bytes.
    ///
    #[serde(default = "BehaviorConfig::max_outbound_bytes")]
    pub max_outbound_bytes: usize,
    ///
    /// Largest inbound datagram the endpoint will accept.
    ///
    #[serde(default = "BehaviorConfig::max_inbound_bytes")]
    pub max_inbound_bytes: usize,
    ///
    /// Maximum number of retransmissions of a Confirmable message.
    ///
    #[serde(default = "BehaviorConfig::max_retransmit")]
    pub max_retransmit: u32,
    ///
    /// Initial timeout for the first retransmission, in milliseconds.
    ///
    #[serde(default = "BehaviorConfig::ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    ///
    /// Randomization factor applied to each retransmission timeout.
    ///
    #[serde(default = "BehaviorConfig::ack_random_factor")]
    pub ack_random_factor: f64,
    ///
    /// Maximum number of simultaneous outstanding outbound Confirmable
    /// messages to a single peer.
    ///
    #[serde(default = "BehaviorConfig::nstart")]
    pub nstart: u32,
    ///
    /// Default leisure before a multicast response, in milliseconds.
    ///
    #[serde(default = "BehaviorConfig::default_leisure_ms")]
    pub default_leisure_ms: u64,
    ///
    /// Upper bound on response rate to a non-confirmable multicast request,
    /// in bytes/second. Not independently enforced; the retransmission layer
    /// treats `nstart` as the outbound-CON permit instead.
    ///
    #[serde(default = "BehaviorConfig::probing_rate")]
    pub probing_rate: u32,
    ///
    /// Maximum time a datagram is expected to take to traverse the network,
    /// in milliseconds.
    ///
    #[serde(default = "BehaviorConfig::max_latency_ms")]
    pub max_latency_ms: u64,
    ///
    /// Average time a multicast response is delayed, in milliseconds.
    ///
    #[serde(default = "BehaviorConfig::multicast_response_avg_delay_ms")]
    pub multicast_response_avg_delay_ms: u64,
}

impl BehaviorConfig {
    fn max_outbound_bytes() -> usize {
        1152
    }

    fn max_inbound_bytes() -> usize {
        65535
    }

    fn max_retransmit() -> u32 {
        4
    }

    fn ack_timeout_ms() -> u64 {
        2000
    }

    fn ack_random_factor() -> f64 {
        1.5
    }

    fn nstart() -> u32 {
        1
    }

    fn default_leisure_ms() -> u64 {
        5000
    }

    fn probing_rate() -> u32 {
        1
    }

    fn max_latency_ms() -> u64 {
        100_000
    }

    fn multicast_response_avg_delay_ms() -> u64 {
        25
    }

    /// `processing_delay_ms` is fixed equal to `ack_timeout_ms` (RFC 7252 §4.8.2).
    pub fn processing_delay_ms(&self) -> u64 {
        self.ack_timeout_ms
    }

    pub fn max_transmit_span_ms(&self) -> f64 {
        self.ack_timeout_ms as f64
            * ((1u32 << self.max_retransmit) - 1) as f64
            * self.ack_random_factor
    }

    pub fn max_transmit_wait_ms(&self) -> f64 {
        self.ack_timeout_ms as f64
            * ((1u32 << (self.max_retransmit + 1)) - 1) as f64
            * self.ack_random_factor
    }

    pub fn exchange_lifetime_ms(&self) -> f64 {
        self.max_transmit_span_ms() + 2.0 * self.max_latency_ms as f64 + self.processing_delay_ms() as f64
    }

    pub fn non_lifetime_ms(&self) -> f64 {
        self.max_transmit_span_ms() + self.max_latency_ms as f64
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_outbound_bytes: Self::max_outbound_bytes(),
            max_inbound_bytes: Self::max_inbound_bytes(),
            max_retransmit: Self::max_retransmit(),
            ack_timeout_ms: Self::ack_timeout_ms(),
            ack_random_factor: Self::ack_random_factor(),
            nstart: Self::nstart(),
            default_leisure_ms: Self::default_leisure_ms(),
            probing_rate: Self::probing_rate(),
            max_latency_ms: Self::max_latency_ms(),
            multicast_response_avg_delay_ms: Self::multicast_response_avg_delay_ms(),
        }
    }
}

impl From<&BehaviorConfig> for Behavior {
    fn from(config: &BehaviorConfig) -> Self {
        Self {
            max_outbound_bytes: config.max_outbound_bytes,
            max_inbound_bytes: config.max_inbound_bytes,
            max_retransmit: config.max_retransmit,
            ack_timeout_ms: config.ack_timeout_ms,
            ack_random_factor: config.ack_random_factor,
            nstart: config.nstart,
            default_leisure_ms: config.default_leisure_ms,
            probing_rate: config.probing_rate,
            max_latency_ms: config.max_latency_ms,
            multicast_response_avg_delay_ms: config.multicast_response_avg_delay_ms,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// endpoint listen interfaces
    ///
    #[serde(default)]
    pub listeners: Vec<Listener>,
    ///
    /// protocol behavior constants, see `BehaviorConfig`
    ///
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: coap-endpoint --config /etc/coap-endpoint/config.json5
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is specified,
    /// the configuration is read from the configuration file, otherwise the
    /// default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}
