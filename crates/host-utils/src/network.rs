//! Reachability checks and remote power control for clients.

use crate::executor::BoxedExecutor;
use async_trait::async_trait;
use nsboot_common::{ClientStatus, Result};
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait NetworkControl: Send + Sync {
    /// One-shot reachability check. Never fails; problems map to
    /// [`ClientStatus::Error`].
    async fn ping_status(&self, ip: &str) -> ClientStatus;

    /// Send a Wake-on-LAN magic packet.
    async fn wake(&self, mac: &str) -> Result<()>;

    async fn reboot(&self, ip: &str) -> Result<()>;

    async fn shutdown(&self, ip: &str) -> Result<()>;
}

/// [`NetworkControl`] using `ping`, `wakeonlan` and Samba's `net rpc`.
pub struct HostNetwork {
    executor: BoxedExecutor,
    remote_user: String,
}

impl HostNetwork {
    /// `remote_user` is passed to `net rpc -U`, e.g. `user%password`.
    pub fn new(executor: BoxedExecutor, remote_user: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            remote_user: remote_user.into(),
        })
    }
}

#[async_trait]
impl NetworkControl for HostNetwork {
    async fn ping_status(&self, ip: &str) -> ClientStatus {
        if ip.trim().is_empty() {
            return ClientStatus::Unknown;
        }
        match self
            .executor
            .execute_unchecked("ping", &["-c", "1", "-W", "1", ip], false)
            .await
        {
            Ok(output) if output.success() => ClientStatus::Online,
            Ok(_) => ClientStatus::Offline,
            Err(err) => {
                warn!(ip, error = %err, "status check failed");
                ClientStatus::Error
            }
        }
    }

    async fn wake(&self, mac: &str) -> Result<()> {
        info!(mac, "sending wake-on-lan");
        self.executor.execute("wakeonlan", &[mac], false).await?;
        Ok(())
    }

    async fn reboot(&self, ip: &str) -> Result<()> {
        info!(ip, "requesting remote reboot");
        self.executor
            .execute(
                "net",
                &["rpc", "shutdown", "-r", "-I", ip, "-U", &self.remote_user, "-f", "-t", "0"],
                false,
            )
            .await?;
        Ok(())
    }

    async fn shutdown(&self, ip: &str) -> Result<()> {
        info!(ip, "requesting remote shutdown");
        self.executor
            .execute(
                "net",
                &["rpc", "shutdown", "-S", ip, "-U", &self.remote_user],
                false,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, ExecutionError};
    use crate::fakes::{FakeExecutor, Invocation};

    #[tokio::test]
    async fn test_ping_status_maps_outcomes() {
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|inv: &Invocation| CommandOutput {
            status: Some(if inv.args.last().map(String::as_str) == Some("10.0.0.1") {
                0
            } else {
                1
            }),
            ..Default::default()
        }));
        let net = HostNetwork::new(executor.clone().as_executor(), "diskless%1");

        assert_eq!(net.ping_status("10.0.0.1").await, ClientStatus::Online);
        assert_eq!(net.ping_status("10.0.0.2").await, ClientStatus::Offline);
        assert_eq!(net.ping_status("").await, ClientStatus::Unknown);
        assert_eq!(executor.commands().len(), 2);
        assert_eq!(executor.commands()[0], "ping -c 1 -W 1 10.0.0.1");
    }

    #[tokio::test]
    async fn test_ping_status_executor_failure_is_error_status() {
        let executor = FakeExecutor::new();
        executor.set_error_handler(Box::new(|inv: &Invocation| {
            Some(ExecutionError::Timeout {
                command: inv.to_string(),
                timeout: std::time::Duration::from_secs(1),
            })
        }));
        let net = HostNetwork::new(executor.as_executor(), "diskless%1");

        assert_eq!(net.ping_status("10.0.0.1").await, ClientStatus::Error);
    }

    #[tokio::test]
    async fn test_power_commands() {
        let executor = FakeExecutor::new();
        let net = HostNetwork::new(executor.clone().as_executor(), "diskless%1");

        net.wake("AA:BB:CC:DD:EE:01").await.unwrap();
        net.reboot("10.0.0.1").await.unwrap();
        net.shutdown("10.0.0.1").await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "wakeonlan AA:BB:CC:DD:EE:01".to_string(),
                "net rpc shutdown -r -I 10.0.0.1 -U diskless%1 -f -t 0".to_string(),
                "net rpc shutdown -S 10.0.0.1 -U diskless%1".to_string(),
            ]
        );
    }
}
