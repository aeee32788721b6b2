//! Service configuration.
//!
//! Everything is parsed from environment variables (a `.env` file is honored
//! via dotenv) with production defaults, so the binary runs with no flags in
//! a standard IB Gateway deployment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServiceError;
use crate::models::TickType;

/// One persistently tracked `(contract, tick types, buffer window)` entry.
#[derive(Debug, Clone)]
pub struct TrackedContract {
    pub contract_id: i32,
    pub symbol_label: String,
    pub tick_types: Vec<TickType>,
    pub buffer_hours: u32,
}

impl TrackedContract {
    /// Parse a single `contract_id:label:type+type:buffer_hours` entry.
    fn parse(entry: &str) -> Result<Self, ServiceError> {
        let mut parts = entry.split(':');
        let contract_id = parts
            .next()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| ServiceError::InvalidContract(entry.to_string()))?;
        let symbol_label = parts.next().unwrap_or("").trim().to_string();
        let tick_types = match parts.next() {
            Some(spec) if !spec.trim().is_empty() => spec
                .split('+')
                .map(|t| TickType::from_label(t.trim()))
                .collect::<Result<Vec<_>, _>>()?,
            _ => vec![TickType::Last, TickType::BidAsk],
        };
        let buffer_hours = parts
            .next()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(1);

        Ok(Self {
            contract_id,
            symbol_label,
            tick_types,
            buffer_hours,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream gateway host.
    pub host: String,
    /// Candidate gateway ports, tried in order on every reconnect cycle.
    pub ports: Vec<u16>,
    /// Upstream client id; must be unique per process against one gateway.
    pub client_id: i32,

    /// HTTP listen port for the SSE/WS/query surface.
    pub http_port: u16,

    /// Root of the on-disk storage tree.
    pub storage_path: PathBuf,
    pub enable_json: bool,
    pub enable_binary: bool,

    /// Contracts kept streaming for the lifetime of the process.
    pub tracked_contracts: Vec<TrackedContract>,

    /// Hard cap on concurrently open upstream streams.
    pub max_streams: usize,
    /// Bounded outbound queue per subscriber, in messages.
    pub subscriber_queue_capacity: usize,
    /// In-memory tail ring per stream, in records.
    pub tail_ring_capacity: usize,
    /// Storage pipeline channel depth, in records.
    pub storage_queue_capacity: usize,

    pub connection_timeout: Duration,
    /// Reconnect attempts per port before moving to the next candidate.
    pub reconnect_attempts: u32,
    /// Pause between reconnect sweeps over the port list.
    pub reconnect_interval: Duration,

    /// Health monitor cadence.
    pub monitor_period: Duration,
    /// No tick for this long marks a stream stale (ladder level 1).
    pub data_staleness_threshold: Duration,
    /// Stale for this long restarts the affected stream workers (level 2).
    pub stream_restart_threshold: Duration,
    /// Stale for this long forces a full session reset (level 3).
    pub connection_reset_threshold: Duration,
    /// Still unhealthy after this long raises the critical alert (level 4).
    pub critical_alert_threshold: Duration,

    /// WebSocket caps.
    pub max_subscriptions_per_connection: usize,
    pub max_connections_per_ip: usize,

    /// Bounded drain window on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            // Gateway live/paper, TWS live/paper.
            ports: vec![4001, 4002, 7496, 7497],
            client_id: 10,
            http_port: 8780,
            storage_path: PathBuf::from("./tick-data"),
            enable_json: true,
            enable_binary: true,
            tracked_contracts: Vec::new(),
            max_streams: 64,
            subscriber_queue_capacity: 1000,
            tail_ring_capacity: 4096,
            storage_queue_capacity: 8192,
            connection_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(5),
            monitor_period: Duration::from_secs(60),
            data_staleness_threshold: Duration::from_secs(60),
            stream_restart_threshold: Duration::from_secs(180),
            connection_reset_threshold: Duration::from_secs(300),
            critical_alert_threshold: Duration::from_secs(600),
            max_subscriptions_per_connection: 16,
            max_connections_per_ip: 8,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("TWS_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("TWS_PORTS") {
            let ports: Vec<u16> = v
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !ports.is_empty() {
                cfg.ports = ports;
            }
        }
        if let Ok(v) = std::env::var("TWS_CLIENT_ID") {
            cfg.client_id = v.parse().unwrap_or(cfg.client_id);
        }
        if let Ok(v) = std::env::var("HTTP_PORT") {
            cfg.http_port = v.parse().unwrap_or(cfg.http_port);
        }
        if let Ok(v) = std::env::var("STORAGE_PATH") {
            cfg.storage_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ENABLE_JSON_STORAGE") {
            cfg.enable_json = parse_bool(&v, cfg.enable_json);
        }
        if let Ok(v) = std::env::var("ENABLE_BINARY_STORAGE") {
            cfg.enable_binary = parse_bool(&v, cfg.enable_binary);
        }
        if let Ok(v) = std::env::var("TRACKED_CONTRACTS") {
            cfg.tracked_contracts = v
                .split(',')
                .filter(|e| !e.trim().is_empty())
                .map(TrackedContract::parse)
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Ok(v) = std::env::var("MAX_STREAMS") {
            cfg.max_streams = v.parse().unwrap_or(cfg.max_streams);
        }
        if let Ok(v) = std::env::var("SUBSCRIBER_QUEUE_CAPACITY") {
            cfg.subscriber_queue_capacity = v.parse().unwrap_or(cfg.subscriber_queue_capacity);
        }
        if let Ok(v) = std::env::var("TAIL_RING_CAPACITY") {
            cfg.tail_ring_capacity = v.parse().unwrap_or(cfg.tail_ring_capacity);
        }
        if let Ok(v) = std::env::var("CONNECTION_TIMEOUT_SECS") {
            cfg.connection_timeout = parse_secs(&v, cfg.connection_timeout);
        }
        if let Ok(v) = std::env::var("RECONNECT_ATTEMPTS") {
            cfg.reconnect_attempts = v.parse().unwrap_or(cfg.reconnect_attempts);
        }
        if let Ok(v) = std::env::var("RECONNECT_INTERVAL_SECS") {
            cfg.reconnect_interval = parse_secs(&v, cfg.reconnect_interval);
        }
        if let Ok(v) = std::env::var("MONITOR_PERIOD_SECS") {
            cfg.monitor_period = parse_secs(&v, cfg.monitor_period);
        }
        if let Ok(v) = std::env::var("DATA_STALENESS_THRESHOLD_SECS") {
            cfg.data_staleness_threshold = parse_secs(&v, cfg.data_staleness_threshold);
        }
        if let Ok(v) = std::env::var("STREAM_RESTART_THRESHOLD_SECS") {
            cfg.stream_restart_threshold = parse_secs(&v, cfg.stream_restart_threshold);
        }
        if let Ok(v) = std::env::var("CONNECTION_RESET_THRESHOLD_SECS") {
            cfg.connection_reset_threshold = parse_secs(&v, cfg.connection_reset_threshold);
        }
        if let Ok(v) = std::env::var("CRITICAL_ALERT_THRESHOLD_SECS") {
            cfg.critical_alert_threshold = parse_secs(&v, cfg.critical_alert_threshold);
        }
        if let Ok(v) = std::env::var("MAX_SUBSCRIPTIONS_PER_CONNECTION") {
            cfg.max_subscriptions_per_connection =
                v.parse().unwrap_or(cfg.max_subscriptions_per_connection);
        }
        if let Ok(v) = std::env::var("MAX_CONNECTIONS_PER_IP") {
            cfg.max_connections_per_ip = v.parse().unwrap_or(cfg.max_connections_per_ip);
        }
        if let Ok(v) = std::env::var("SHUTDOWN_GRACE_SECS") {
            cfg.shutdown_grace = parse_secs(&v, cfg.shutdown_grace);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ports.is_empty() {
            anyhow::bail!("at least one gateway port is required");
        }
        if !self.enable_json && !self.enable_binary {
            anyhow::bail!("at least one storage format must be enabled for the historical buffer");
        }
        if self.subscriber_queue_capacity == 0 {
            anyhow::bail!("subscriber queue capacity must be positive");
        }
        Ok(())
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v {
        "1" | "true" | "TRUE" | "on" | "ON" | "yes" => true,
        "0" | "false" | "FALSE" | "off" | "OFF" | "no" => false,
        _ => default,
    }
}

fn parse_secs(v: &str, default: Duration) -> Duration {
    v.parse::<u64>().map(Duration::from_secs).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_contract_entry_parses() {
        let t = TrackedContract::parse("711280073:ES:last+bid_ask:24").unwrap();
        assert_eq!(t.contract_id, 711280073);
        assert_eq!(t.symbol_label, "ES");
        assert_eq!(t.tick_types, vec![TickType::Last, TickType::BidAsk]);
        assert_eq!(t.buffer_hours, 24);
    }

    #[test]
    fn tracked_contract_defaults() {
        let t = TrackedContract::parse("265598").unwrap();
        assert_eq!(t.tick_types, vec![TickType::Last, TickType::BidAsk]);
        assert_eq!(t.buffer_hours, 1);
    }

    #[test]
    fn tracked_contract_alias_folds() {
        let t = TrackedContract::parse("265598:AAPL:time_sales:2").unwrap();
        assert_eq!(t.tick_types, vec![TickType::Last]);
    }

    #[test]
    fn bad_contract_rejected() {
        assert!(TrackedContract::parse("not-a-number:X:last:1").is_err());
    }

    #[test]
    fn storage_format_validation() {
        let mut cfg = Config::default();
        cfg.enable_json = false;
        cfg.enable_binary = false;
        assert!(cfg.validate().is_err());
    }
}
