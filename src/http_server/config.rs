//! HTTP Server Configuration
//!
//! Listener address and CORS settings.

use serde::{Deserialize, Serialize};

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Host to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// CORS allowed origins; empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl HttpServerConfig {
    /// Create a new config with specified port
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Parse a `host:port` listen address such as `--addr`'s value.
    ///
    /// A bare `:port` keeps the default host.
    pub fn with_addr(mut self, addr: &str) -> Result<Self, String> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("address '{}' must be host:port", addr))?;
        self.port = port
            .parse()
            .map_err(|_| format!("invalid port in address '{}'", addr))?;
        if !host.is_empty() {
            self.host = host.to_string();
        }
        Ok(self)
    }

    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(config.cors_origins.is_empty());
    }

    #[test]
    fn test_socket_addr() {
        let config = HttpServerConfig::with_port(9090);
        assert_eq!(config.socket_addr(), "0.0.0.0:9090");
    }

    #[test]
    fn test_with_addr() {
        let config = HttpServerConfig::default().with_addr(":3000").unwrap();
        assert_eq!(config.socket_addr(), "0.0.0.0:3000");

        let config = HttpServerConfig::default().with_addr("127.0.0.1:4000").unwrap();
        assert_eq!(config.socket_addr(), "127.0.0.1:4000");

        assert!(HttpServerConfig::default().with_addr("localhost").is_err());
        assert!(HttpServerConfig::default().with_addr("host:port").is_err());
    }
}
