//! Server configuration, loaded from a YAML file.
//!
//! Every key has a default so partial configs work; section and key names
//! follow the control-surface documentation. Validation catches the values
//! that would otherwise surface as panics deep inside the runtime (thread
//! counts, worker limits).

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{LserverError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub control_server: ControlServerConfig,
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_any_ip")]
    pub ip: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    #[serde(default)]
    pub separate_acceptor_thread: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlServerConfig {
    #[serde(default = "default_local_ip")]
    pub ip: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkingConfig {
    #[serde(default)]
    pub socket_close_linger: bool,
    #[serde(default)]
    pub socket_close_linger_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_max_num_workers")]
    pub max_num_workers: usize,
    #[serde(default = "default_one")]
    pub num_threads_per_worker: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_session_pool_size")]
    pub max_session_pool_size: usize,
    /// Receive sizing hint; the engine caps single transfers at 256 KiB
    /// internally.
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: usize,
    #[serde(default)]
    pub eager_session_pool: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Stats header cadence in rows; 0 disables the header.
    #[serde(default = "default_header_interval")]
    pub header_interval: usize,
}

fn default_any_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_num_workers() -> usize {
    num_cpus::get()
}

fn default_max_num_workers() -> usize {
    64
}

fn default_session_pool_size() -> usize {
    1024
}

fn default_max_transfer_size() -> usize {
    256 * 1024
}

fn default_header_interval() -> usize {
    20
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_any_ip(),
            port: default_listen_port(),
            reuse_address: true,
            separate_acceptor_thread: false,
        }
    }
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            ip: default_local_ip(),
            port: default_control_port(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_num_workers: default_max_num_workers(),
            num_threads_per_worker: 1,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_session_pool_size: default_session_pool_size(),
            max_transfer_size: default_max_transfer_size(),
            eager_session_pool: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            header_interval: default_header_interval(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LserverError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| LserverError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.listen.ip, self.listen.port)
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.control_server.ip, self.control_server.port)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.concurrency;
        if c.num_workers == 0 {
            return Err(LserverError::Config(
                "concurrency.num_workers must be at least 1".to_string(),
            ));
        }
        if c.max_num_workers < c.num_workers {
            return Err(LserverError::Config(
                "concurrency.max_num_workers must be >= num_workers".to_string(),
            ));
        }
        if !(1..=64).contains(&c.num_threads_per_worker) {
            return Err(LserverError::Config(
                "concurrency.num_threads_per_worker must be in 1..=64".to_string(),
            ));
        }
        if self.sessions.max_session_pool_size == 0 && self.sessions.eager_session_pool {
            return Err(LserverError::Config(
                "sessions.eager_session_pool requires a bounded max_session_pool_size".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", ip, port)
        .parse()
        .map_err(|e| LserverError::Config(format!("bad address {}:{}: {}", ip, port, e)))
}
