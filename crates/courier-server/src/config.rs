//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use courier_shared::constants::{DEFAULT_PORT, MAX_FRAME_SIZE};

pub const USAGE: &str = "Usage: courier-server [port]";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to accept clients on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:9999`
    pub listen_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `messenger.db`
    pub database_path: PathBuf,

    /// Longest accepted frame in bytes, terminator excluded.
    /// Env: `MAX_FRAME_SIZE`
    /// Default: 256 KiB
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            database_path: PathBuf::from("messenger.db"),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.listen_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        if let Ok(val) = std::env::var("MAX_FRAME_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FRAME_SIZE, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Apply command-line arguments (program name already stripped).
    ///
    /// The only accepted argument is a port number, which replaces the
    /// port of `listen_addr`.
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), String>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        match args.as_slice() {
            [] => Ok(()),
            [port] => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {port}\n{USAGE}"))?;
                self.listen_addr.set_port(port);
                Ok(())
            }
            _ => Err(USAGE.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 9999).into());
        assert_eq!(config.database_path, PathBuf::from("messenger.db"));
        assert_eq!(config.max_frame_size, 256 * 1024);
    }

    #[test]
    fn test_port_argument() {
        let mut config = ServerConfig::default();
        config.apply_args(args(&["12345"])).unwrap();
        assert_eq!(config.listen_addr.port(), 12345);
        assert_eq!(config.listen_addr.ip().to_string(), "0.0.0.0");

        config.apply_args(args(&[])).unwrap();
        assert_eq!(config.listen_addr.port(), 12345);
    }

    #[test]
    fn test_bad_arguments() {
        let mut config = ServerConfig::default();
        assert_eq!(config.apply_args(args(&["1", "2"])).unwrap_err(), USAGE);
        assert!(config.apply_args(args(&["not-a-port"])).is_err());
        assert!(config.apply_args(args(&["70000"])).is_err());
        assert_eq!(config.listen_addr.port(), 9999);
    }
}
