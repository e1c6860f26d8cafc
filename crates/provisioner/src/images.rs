//! Master images and their checkpoints.

use crate::workflow::Provisioner;
use chrono::{DateTime, Utc};
use host_utils::DatasetInfo;
use nsboot_common::validation::validate_snapshot;
use nsboot_common::{Error, MasterImage, Result, SnapshotInfo};
use tracing::{info, warn};

/// Datasets in the pool whose name ends with this are offered as masters.
pub const MASTER_SUFFIX: &str = "-master";

fn snapshot_info(row: DatasetInfo) -> SnapshotInfo {
    SnapshotInfo {
        created: DateTime::<Utc>::from_timestamp(row.created, 0).unwrap_or_default(),
        used_bytes: row.used,
        name: row.name,
    }
}

impl Provisioner {
    /// Master images in the pool with their checkpoints, sorted by name.
    pub async fn list_masters(&self) -> Result<Vec<MasterImage>> {
        let env = self.env.as_ref();
        let pool = env.namer.config().pool.as_str();
        let prefix = format!("{}/", pool);

        let mut masters = Vec::new();
        for dataset in env.volumes.list_children(pool).await? {
            let Some(name) = dataset.name.strip_prefix(&prefix) else {
                continue;
            };
            if !name.to_ascii_lowercase().ends_with(MASTER_SUFFIX) {
                continue;
            }
            let snapshots = env
                .volumes
                .list_snapshots(&dataset.name)
                .await?
                .into_iter()
                .map(snapshot_info)
                .collect();
            masters.push(MasterImage {
                name: name.to_string(),
                dataset: dataset.name.clone(),
                snapshots,
            });
        }
        masters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(masters)
    }

    /// Validate a `dataset@name` reference and require the dataset to be in
    /// the pool.
    fn pool_snapshot(&self, raw: &str) -> Result<(String, String)> {
        let snapshot = validate_snapshot(raw)?;
        let pool = self.env.namer.config().pool.as_str();
        let dataset = match snapshot.split_once('@') {
            Some((dataset, _)) if dataset.starts_with(&format!("{}/", pool)) => {
                dataset.to_string()
            }
            _ => {
                return Err(Error::validation(format!(
                    "Invalid snapshot '{}' (expected {}/<master>@<name>)",
                    snapshot, pool
                )))
            }
        };
        Ok((snapshot, dataset))
    }

    /// Take a checkpoint of a master image.
    pub async fn create_snapshot(&self, name: &str) -> Result<String> {
        let (snapshot, dataset) = self.pool_snapshot(name)?;
        let env = self.env.as_ref();

        if !env.volumes.exists(&dataset).await? {
            return Err(Error::not_found(format!(
                "Master '{}' does not exist",
                dataset
            )));
        }
        if env.volumes.exists(&snapshot).await? {
            return Err(Error::conflict(format!(
                "Snapshot '{}' already exists",
                snapshot
            )));
        }

        env.volumes.snapshot(&snapshot).await?;
        info!(snapshot = %snapshot, "snapshot created");
        Ok(format!("Snapshot {} created", snapshot))
    }

    /// Destroy a checkpoint no client is cloned from.
    pub async fn delete_snapshot(&self, name: &str) -> Result<String> {
        let (snapshot, _) = self.pool_snapshot(name)?;
        let env = self.env.as_ref();

        if !env.volumes.exists(&snapshot).await? {
            return Err(Error::not_found(format!(
                "Snapshot '{}' does not exist",
                snapshot
            )));
        }
        if let Some(user) = env
            .store
            .list()
            .await?
            .into_iter()
            .find(|client| client.source.origin() == Some(snapshot.as_str()))
        {
            return Err(Error::conflict(format!(
                "Snapshot '{}' is the source of client '{}'",
                snapshot, user.id
            )));
        }

        match env.volumes.destroy(&snapshot).await {
            Ok(()) => {
                info!(snapshot = %snapshot, "snapshot deleted");
                Ok(format!("Snapshot {} deleted", snapshot))
            }
            Err(Error::Collaborator { output, .. }) if output.contains("dependent clones") => {
                warn!(snapshot = %snapshot, "snapshot still has dependent clones");
                Err(Error::conflict(format!(
                    "Snapshot '{}' has dependent clones",
                    snapshot
                )))
            }
            Err(err) => Err(err),
        }
    }
}
