//! Resource Namer
//!
//! Maps a validated client id to the names of every external object the
//! client owns. All functions here are pure: the same id always yields the
//! same names. Volume, backstore and lease names embed the id verbatim
//! (lower-cased) and never collide; target names drop underscores, so
//! `lab_1` and `lab1` share one and the workflow rejects the second.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where DHCP host reservations are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseLayout {
    /// Every reservation lives in one shared dhcpd configuration file.
    SharedFile(PathBuf),
    /// Each client gets `<dir>/<id>.conf`, included by the main config.
    IncludeDir(PathBuf),
}

/// Naming templates, fixed at startup.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// ZFS pool holding masters and clones
    pub pool: String,

    /// IQN prefix for targets, e.g. `iqn.2025-04.com.nsboot`
    pub iqn_prefix: String,

    /// Lease file layout
    pub lease_layout: LeaseLayout,
}

/// Derived names for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    /// `<pool>/<id>-disk`
    pub clone_path: String,

    /// `<iqn-prefix>:<id without underscores>`
    pub target_name: String,

    /// `block_<id>`
    pub backing_store_name: String,

    /// File holding this client's reservation
    pub lease_config_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResourceNamer {
    config: NamingConfig,
}

impl ResourceNamer {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Compute every derived name for `id`.
    pub fn names(&self, id: &str) -> ResourceNames {
        let id = id.to_ascii_lowercase();
        ResourceNames {
            clone_path: self.clone_path(&id),
            target_name: format!("{}:{}", self.config.iqn_prefix, id.replace('_', "")),
            backing_store_name: format!("block_{}", id),
            lease_config_path: self.lease_config_path(&id),
        }
    }

    fn clone_path(&self, id: &str) -> String {
        format!("{}/{}-disk", self.config.pool, id)
    }

    fn lease_config_path(&self, id: &str) -> PathBuf {
        match &self.config.lease_layout {
            LeaseLayout::SharedFile(path) => path.clone(),
            LeaseLayout::IncludeDir(dir) => dir.join(format!("{}.conf", id)),
        }
    }

    /// Scratch name used while a clone is being replaced.
    pub fn temp_clone_path(&self, id: &str) -> String {
        format!("{}-temp", self.clone_path(&id.to_ascii_lowercase()))
    }

    /// Name the previous clone is parked under while being replaced.
    pub fn retired_clone_path(&self, id: &str) -> String {
        format!("{}-retired", self.clone_path(&id.to_ascii_lowercase()))
    }

    /// Resolve a master reference to a dataset path. References containing
    /// `/` are already full paths; anything else lives in the pool.
    pub fn master_dataset(&self, master: &str) -> String {
        if master.contains('/') {
            master.to_string()
        } else {
            format!("{}/{}", self.config.pool, master)
        }
    }

    /// The master's canonical base checkpoint.
    pub fn base_checkpoint(&self, master: &str) -> String {
        format!("{}@base", self.master_dataset(master))
    }

    /// The checkpoint taken from a master for one client.
    pub fn client_checkpoint(&self, master: &str, id: &str) -> String {
        format!(
            "{}@{}_base",
            self.master_dataset(master),
            id.to_ascii_lowercase()
        )
    }
}

/// Block device node for a volume.
pub fn device_path(dataset: &str) -> String {
    format!("/dev/zvol/{}", dataset)
}

/// Human-facing host name for a client id.
///
/// `lab_7` becomes `PC007`; ids without a numeric suffix after the first
/// underscore are upper-cased.
pub fn display_name(id: &str) -> String {
    if let Some((_, suffix)) = id.split_once('_') {
        if let Ok(num) = suffix.parse::<u32>() {
            return format!("PC{:03}", num);
        }
    }
    id.to_ascii_uppercase()
}
