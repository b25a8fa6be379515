//! Server configuration from environment variables.

use std::net::SocketAddr;

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Capacity of the broadcast channel fanning component events out
    /// to connections.
    pub ws_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            ws_capacity: 1000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> ServerResult<Self> {
        let defaults = Self::default();
        let bind = std::env::var("COOP_BIND").unwrap_or(defaults.bind);
        let port_str = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("COOP_PORT").ok())
            .unwrap_or_else(|| defaults.port.to_string());
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ServerError::invalid_request(format!("invalid port value: {port_str}")))?;
        let ws_capacity = std::env::var("COOP_WS_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.ws_capacity);
        Ok(Self {
            bind,
            port,
            ws_capacity,
        })
    }

    pub fn bind_addr(&self) -> ServerResult<SocketAddr> {
        let addr = format!("{}:{}", self.bind, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ServerError::invalid_request(format!("invalid bind address {addr}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_wildcard_3000() {
        let config = ServerConfig::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:3000");
        assert_eq!(config.ws_capacity, 1000);
    }

    #[test]
    fn bad_bind_is_an_error() {
        let config = ServerConfig {
            bind: "not an address".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
