//! Host collaborators for diskless-boot provisioning
//!
//! Narrow, typed adapters over the external systems a client depends on:
//! ZFS for volumes, targetcli for iSCSI exports, ISC dhcpd for host
//! reservations, and the usual network tools for reachability and power
//! control. All of them run commands through a shared [`executor::Executor`].

pub mod dhcp;
pub mod executor;
pub mod network;
pub mod targetcli;
pub mod zfs;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use dhcp::{DhcpdConfig, LeaseEntry, LeaseService};
pub use executor::{BoxedExecutor, CommandOutput, ExecutionError, Executor, HostExecutor};
pub use network::{HostNetwork, NetworkControl};
pub use targetcli::{Lun, Portal, TargetCli, TargetService};
pub use zfs::{DatasetInfo, VolumeManager, Zfs};
