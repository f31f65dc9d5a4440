//! Server configuration from the environment.
//!
//! - `VARSERVER_ADDRESS`: IPv4 dotted quad to listen on (default 127.0.0.1)
//! - `VARSERVER_PORT`: listener port 1..65535 (default 22099)
//! - `VARSERVER_INFO_PATH`: discovery file location (default /tmp/varserver.info)

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use crate::{DEFAULT_PORT, MAX_CLIENTS, MAX_VARIABLES};

pub const ADDRESS_ENV: &str = "VARSERVER_ADDRESS";
pub const PORT_ENV: &str = "VARSERVER_PORT";
pub const INFO_PATH_ENV: &str = "VARSERVER_INFO_PATH";

const DEFAULT_INFO_PATH: &str = "/tmp/varserver.info";

#[derive(Debug, Clone)]
pub struct Config {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Discovery file the server publishes its PID and address to
    pub info_path: PathBuf,
    pub max_variables: usize,
    pub max_clients: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            info_path: PathBuf::from(DEFAULT_INFO_PATH),
            max_variables: MAX_VARIABLES,
            max_clients: MAX_CLIENTS,
        }
    }
}

impl Config {
    /// Read the environment, falling back to defaults. Set-but-invalid
    /// values are rejected so a typo cannot silently bind elsewhere.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Ok(address) = std::env::var(ADDRESS_ENV) {
            config.address = address
                .parse()
                .map_err(|_| ConfigError::BadAddress(address))?;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            config.port = match port.parse::<u16>() {
                Ok(p) if p != 0 => p,
                _ => return Err(ConfigError::BadPort(port)),
            };
        }
        if let Ok(path) = std::env::var(INFO_PATH_ENV) {
            config.info_path = PathBuf::from(path);
        }
        Ok(config)
    }

    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BadAddress(String),
    BadPort(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress(v) => write!(f, "{ADDRESS_ENV}: not an IPv4 address: '{v}'"),
            Self::BadPort(v) => write!(f, "{PORT_ENV}: not a port number: '{v}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.port, 22099);
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:22099");
    }
}
