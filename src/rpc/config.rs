use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::common::{Id, Peer, DEFAULT_BUCKET_SIZE};

/// Default request timeout before abandoning an inflight request to a non-responding peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Default interval between two health monitor rounds.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Default connect/read timeout of bulk transfers.
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(10);
/// k = the default number of peers contacted per lookup round.
pub const DEFAULT_FANOUT: usize = 7;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Dht Configurations
///
/// Can be read from the JSON configuration files used by existing deployments:
///
/// ```json
/// {
///     "node_id": "<64 hex chars>",
///     "ip": "127.0.0.1",
///     "port": 5000,
///     "file_dir": "./chunks",
///     "nodes": [{"node_id": "<64 hex chars>", "ip": "127.0.0.1", "port": 5001}]
/// }
/// ```
pub struct Config {
    /// This node's [Id].
    ///
    /// Defaults to None, where a random Id is generated.
    #[serde(rename = "node_id")]
    pub id: Option<Id>,
    /// The address advertised to other peers in every message.
    ///
    /// Defaults to `127.0.0.1`
    pub ip: IpAddr,
    /// Explicit port to listen on, shared by the control (UDP) and bulk (TCP) channels.
    ///
    /// Defaults to None, where an ephemeral port is picked.
    pub port: Option<u16>,
    /// Seed peers to join the network through.
    ///
    /// Defaults to empty, where this node starts as a standalone (genesis) node.
    #[serde(rename = "nodes")]
    pub bootstrap: Vec<Peer>,
    /// Directory to persist chunks in, one file per key.
    ///
    /// Defaults to None, where chunks are only kept in memory.
    pub file_dir: Option<PathBuf>,
    /// Control channel request timeout.
    ///
    /// Also the deadline of every lookup round, since all requests of a round
    /// are sent at once.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    #[serde(skip, default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Interval between two rounds of pinging every peer in the routing table.
    ///
    /// Defaults to [DEFAULT_PING_INTERVAL]
    #[serde(skip, default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Connect and read timeout for bulk transfers.
    ///
    /// Defaults to [DEFAULT_BULK_TIMEOUT]
    #[serde(skip, default = "default_bulk_timeout")]
    pub bulk_timeout: Duration,
    /// Peers contacted per lookup round, and returned by lookups.
    ///
    /// Defaults to [DEFAULT_FANOUT]
    pub fanout: usize,
    /// Capacity of the routing table.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub bucket_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: None,
            bootstrap: vec![],
            file_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            fanout: DEFAULT_FANOUT,
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

impl Config {
    /// Read a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;

        Ok(serde_json::from_str(&contents)?)
    }
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_ping_interval() -> Duration {
    DEFAULT_PING_INTERVAL
}

fn default_bulk_timeout() -> Duration {
    DEFAULT_BULK_TIMEOUT
}

#[derive(thiserror::Error, Debug)]
/// Errors reading a configuration file.
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn read_config_file() {
        let id = Id::random();
        let seed = Id::random();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node_id": "{id}",
                "ip": "10.0.0.4",
                "port": 5000,
                "file_dir": "/tmp/chunks",
                "nodes": [{{"node_id": "{seed}", "ip": "10.0.0.5", "port": 5001}}]
            }}"#
        )
        .unwrap();

        let config = Config::from_json_file(file.path()).unwrap();

        assert_eq!(config.id, Some(id));
        assert_eq!(config.ip, IpAddr::from([10, 0, 0, 4]));
        assert_eq!(config.port, Some(5000));
        assert_eq!(config.file_dir, Some(PathBuf::from("/tmp/chunks")));
        assert_eq!(config.bootstrap.len(), 1);
        assert_eq!(config.bootstrap[0].id(), &seed);
        assert_eq!(config.bootstrap[0].port(), 5001);

        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.fanout, DEFAULT_FANOUT);
        assert_eq!(config.bucket_size, DEFAULT_BUCKET_SIZE);
    }

    #[test]
    fn empty_config_is_default() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.id, None);
        assert_eq!(config.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.bootstrap.is_empty());
        assert_eq!(config.ping_interval, DEFAULT_PING_INTERVAL);
    }

    #[test]
    fn invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"node_id": "not hex"}}"#).unwrap();

        assert!(matches!(
            Config::from_json_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
