//! Volume Manager: ZFS datasets, snapshots and clones.

use crate::executor::{BoxedExecutor, ExecutionError};
use async_trait::async_trait;
use nsboot_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ZFS: &str = "zfs";

/// One row of `zfs list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub name: String,
    /// Creation time in seconds since the epoch
    pub created: i64,
    /// Space used in bytes
    pub used: u64,
}

/// Typed operations over copy-on-write volumes.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Whether a dataset, volume or snapshot with exactly this name exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Take a checkpoint, `name` being `dataset@snap`.
    async fn snapshot(&self, name: &str) -> Result<()>;

    /// Create a writable clone of `origin` at `target`.
    async fn create_clone(&self, origin: &str, target: &str) -> Result<()>;

    /// The checkpoint a clone descends from; `None` for independent volumes.
    async fn origin(&self, name: &str) -> Result<Option<String>>;

    /// Detach a clone from its origin.
    async fn promote(&self, name: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Force-unmount (if mounted) and destroy.
    async fn destroy(&self, name: &str) -> Result<()>;

    /// Filesystems and volumes directly below `parent`.
    async fn list_children(&self, parent: &str) -> Result<Vec<DatasetInfo>>;

    /// Snapshots of `dataset`, oldest first.
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<DatasetInfo>>;
}

/// Translate a failed `zfs` invocation on `name`, surfacing a missing dataset
/// as `NotFound`.
fn map_zfs_error(err: ExecutionError, name: &str) -> Error {
    if err.output().contains("does not exist") {
        Error::not_found(format!("Volume '{}' does not exist", name))
    } else {
        err.into()
    }
}

/// [`VolumeManager`] backed by the `zfs` command.
pub struct Zfs {
    executor: BoxedExecutor,
}

impl Zfs {
    pub fn new(executor: BoxedExecutor) -> Arc<Self> {
        Arc::new(Self { executor })
    }
}

#[async_trait]
impl VolumeManager for Zfs {
    async fn exists(&self, name: &str) -> Result<bool> {
        let output = self
            .executor
            .execute_unchecked(ZFS, &["list", "-H", "-t", "all", "-o", "name", name], true)
            .await?;
        let found = output.success() && output.stdout.lines().any(|line| line.trim() == name);
        debug!(name, found, "zfs existence check");
        Ok(found)
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        info!(name, "creating snapshot");
        self.executor
            .execute(ZFS, &["snapshot", name], true)
            .await
            .map_err(|e| map_zfs_error(e, name))?;
        Ok(())
    }

    async fn create_clone(&self, origin: &str, target: &str) -> Result<()> {
        info!(origin, target, "creating clone");
        self.executor
            .execute(ZFS, &["clone", origin, target], true)
            .await
            .map_err(|e| map_zfs_error(e, origin))?;
        Ok(())
    }

    async fn origin(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .executor
            .execute(ZFS, &["get", "-H", "-o", "value", "origin", name], true)
            .await
            .map_err(|e| map_zfs_error(e, name))?;
        Ok(parse_origin(&output.stdout))
    }

    async fn promote(&self, name: &str) -> Result<()> {
        info!(name, "promoting clone");
        self.executor
            .execute(ZFS, &["promote", name], true)
            .await
            .map_err(|e| map_zfs_error(e, name))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        info!(from, to, "renaming volume");
        self.executor
            .execute(ZFS, &["rename", from, to], true)
            .await
            .map_err(|e| map_zfs_error(e, from))?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        // Only filesystems mount; volumes and unmounted datasets refuse.
        if !name.contains('@') {
            let unmount = self
                .executor
                .execute_unchecked(ZFS, &["unmount", "-f", name], true)
                .await?;
            if !unmount.success() {
                debug!(name, status = ?unmount.status, stderr = %unmount.stderr.trim(), "unmount before destroy refused");
            }
        }
        info!(name, "destroying volume");
        self.executor
            .execute(ZFS, &["destroy", "-f", name], true)
            .await
            .map_err(|e| map_zfs_error(e, name))?;
        Ok(())
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<DatasetInfo>> {
        let output = self
            .executor
            .execute(
                ZFS,
                &[
                    "list", "-H", "-p", "-t", "filesystem,volume", "-o", "name,creation,used",
                    "-d", "1", parent,
                ],
                true,
            )
            .await
            .map_err(|e| map_zfs_error(e, parent))?;
        Ok(parse_dataset_list(&output.stdout)
            .into_iter()
            .filter(|row| row.name != parent)
            .collect())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<DatasetInfo>> {
        let output = self
            .executor
            .execute(
                ZFS,
                &[
                    "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation,used", "-s",
                    "creation", "-d", "1", dataset,
                ],
                true,
            )
            .await
            .map_err(|e| map_zfs_error(e, dataset))?;
        Ok(parse_dataset_list(&output.stdout))
    }
}

/// Parse `zfs list -H -p -o name,creation,used` output. Malformed rows are
/// skipped.
pub fn parse_dataset_list(stdout: &str) -> Vec<DatasetInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let row = parse_dataset_row(line);
            if row.is_none() {
                warn!(line, "skipping unparsable zfs list row");
            }
            row
        })
        .collect()
}

fn parse_dataset_row(line: &str) -> Option<DatasetInfo> {
    let mut fields = line.split('\t');
    Some(DatasetInfo {
        name: fields.next()?.trim().to_string(),
        created: fields.next()?.trim().parse().ok()?,
        used: fields.next()?.trim().parse().ok()?,
    })
}

/// Parse the value column of `zfs get -H -o value origin`.
pub fn parse_origin(stdout: &str) -> Option<String> {
    match stdout.trim() {
        "" | "-" => None,
        origin => Some(origin.to_string()),
    }
}
