//! Configuration management for the boot manager
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use nsboot_common::{LeaseLayout, NamingConfig};
use provisioner::ProvisionerConfig;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// ZFS pool holding masters and client clones
    pub zfs_pool: String,

    /// Prefix for client target IQNs
    pub iqn_prefix: String,

    /// Address of this server in the clients' iSCSI root path
    pub server_ip: String,

    /// Main dhcpd configuration file
    pub dhcp_config_path: PathBuf,

    /// Directory of per-client reservation files, if used instead of the
    /// main file
    pub dhcp_include_dir: Option<PathBuf>,

    /// systemd unit restarted after lease changes
    pub dhcp_service: String,

    /// `redis://` URL or path of a JSON registry file
    pub registry_url: String,

    /// sudo binary for privileged commands; `None` runs them directly
    pub sudo_path: Option<PathBuf>,

    /// Upper bound on any single external command
    pub command_timeout: Duration,

    /// `user%password` for remote reboot and shutdown
    pub remote_user: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            zfs_pool: env::var("ZFS_POOL").unwrap_or_else(|_| "nsboot0".to_string()),

            iqn_prefix: env::var("ISCSI_IQN_PREFIX")
                .unwrap_or_else(|_| "iqn.2025-04.com.nsboot".to_string()),

            server_ip: env::var("SERVER_IP").unwrap_or_else(|_| "192.168.1.200".to_string()),

            dhcp_config_path: env::var("DHCP_CONFIG_PATH")
                .unwrap_or_else(|_| "/etc/dhcp/dhcpd.conf".to_string())
                .into(),

            dhcp_include_dir: env::var("DHCP_INCLUDE_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),

            dhcp_service: env::var("DHCP_SERVICE")
                .unwrap_or_else(|_| "isc-dhcp-server.service".to_string()),

            registry_url: env::var("REGISTRY_URL").unwrap_or_else(|_| "./config.json".to_string()),

            sudo_path: match env::var("SUDO_PATH") {
                Ok(path) if path.trim().is_empty() => None,
                Ok(path) => Some(path.into()),
                Err(_) => Some(PathBuf::from("/usr/bin/sudo")),
            },

            command_timeout: Duration::from_secs(
                env::var("COMMAND_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("Invalid COMMAND_TIMEOUT_SECS")?,
            ),

            remote_user: env::var("REMOTE_USER").unwrap_or_else(|_| "diskless%1".to_string()),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.zfs_pool.trim().is_empty() || self.zfs_pool.contains('@') {
            anyhow::bail!("ZFS_POOL must be a dataset name");
        }

        if !self.iqn_prefix.starts_with("iqn.") {
            anyhow::bail!("ISCSI_IQN_PREFIX must start with 'iqn.'");
        }

        self.server_ip
            .parse::<Ipv4Addr>()
            .with_context(|| format!("SERVER_IP '{}' is not an IPv4 address", self.server_ip))?;

        if self.command_timeout.is_zero() {
            anyhow::bail!("COMMAND_TIMEOUT_SECS must be greater than 0");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Where lease reservations are written
    pub fn lease_layout(&self) -> LeaseLayout {
        match &self.dhcp_include_dir {
            Some(dir) => LeaseLayout::IncludeDir(dir.clone()),
            None => LeaseLayout::SharedFile(self.dhcp_config_path.clone()),
        }
    }

    pub fn naming_config(&self) -> NamingConfig {
        NamingConfig {
            pool: self.zfs_pool.clone(),
            iqn_prefix: self.iqn_prefix.clone(),
            lease_layout: self.lease_layout(),
        }
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            naming: self.naming_config(),
            server_ip: self.server_ip.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 9000,
            zfs_pool: "tank".to_string(),
            iqn_prefix: "iqn.2025-04.com.nsboot".to_string(),
            server_ip: "10.0.0.1".to_string(),
            dhcp_config_path: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            dhcp_include_dir: None,
            dhcp_service: "isc-dhcp-server.service".to_string(),
            registry_url: "./config.json".to_string(),
            sudo_path: None,
            command_timeout: Duration::from_secs(5),
            remote_user: "diskless%1".to_string(),
        }
    }

    #[test]
    fn test_config_defaults() {
        // Clear any existing environment variables
        for var in [
            "API_HOST",
            "API_PORT",
            "ZFS_POOL",
            "ISCSI_IQN_PREFIX",
            "SERVER_IP",
            "DHCP_CONFIG_PATH",
            "DHCP_INCLUDE_DIR",
            "DHCP_SERVICE",
            "REGISTRY_URL",
            "SUDO_PATH",
            "COMMAND_TIMEOUT_SECS",
            "REMOTE_USER",
        ] {
            env::remove_var(var);
        }

        let config = Config::from_env().expect("Failed to load config");

        assert_eq!(config.api_address(), "0.0.0.0:5000");
        assert_eq!(config.zfs_pool, "nsboot0");
        assert_eq!(config.server_ip, "192.168.1.200");
        assert_eq!(config.registry_url, "./config.json");
        assert_eq!(config.sudo_path, Some(PathBuf::from("/usr/bin/sudo")));
        assert_eq!(config.command_timeout, Duration::from_secs(60));
        assert_eq!(
            config.lease_layout(),
            LeaseLayout::SharedFile(PathBuf::from("/etc/dhcp/dhcpd.conf"))
        );
    }

    #[test]
    fn test_include_dir_layout() {
        let mut config = config();
        config.dhcp_include_dir = Some(PathBuf::from("/etc/dhcp/clients"));

        let naming = config.naming_config();
        assert_eq!(naming.pool, "tank");
        assert_eq!(
            naming.lease_layout,
            LeaseLayout::IncludeDir(PathBuf::from("/etc/dhcp/clients"))
        );
        assert_eq!(config.provisioner_config().server_ip, "10.0.0.1");
    }

    #[test]
    fn test_validate_invalid_port() {
        let mut config = config();
        config.api_port = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("API_PORT must be greater than 0"));
    }

    #[test]
    fn test_validate_server_ip() {
        let mut config = config();
        config.server_ip = "boot-server".to_string();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.iqn_prefix = "nsboot".to_string();
        assert!(config.validate().is_err());
    }
}
