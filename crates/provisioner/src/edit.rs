//! Client edits.
//!
//! An edit is first classified by what it changes. Addressing changes only
//! touch the lease and the record; identity or lineage changes rebuild the
//! clone and target under the (possibly new) names. Edits are not rolled
//! back: a failure reports which parts were already applied.

use crate::target::{ensure_target, teardown_target};
use crate::workflow::{unique_keys, Env, Provisioner};
use chrono::Utc;
use nsboot_common::validation::{
    normalize_id, normalize_ip, normalize_mac, validate_master, validate_snapshot,
};
use nsboot_common::{display_name, Client, EditClientRequest, Error, Result, VolumeSource};
use tracing::{info, warn};

/// What an edit requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPlan {
    NoChange,
    /// Only mac and/or ip differ
    Readdress,
    /// Id, master or snapshot differ
    Reprovision,
}

/// Compare the current record with the requested one.
pub fn classify(current: &Client, updated: &Client) -> EditPlan {
    if current.id != updated.id
        || current.master != updated.master
        || current.snapshot != updated.snapshot
    {
        EditPlan::Reprovision
    } else if current.mac != updated.mac || current.ip != updated.ip {
        EditPlan::Readdress
    } else {
        EditPlan::NoChange
    }
}

/// Fields of an edit request after validation; `None` keeps the current
/// value.
struct EditFields {
    id: Option<String>,
    mac: Option<String>,
    ip: Option<String>,
    master: Option<String>,
    /// `Some(None)` clears the explicit snapshot
    snapshot: Option<Option<String>>,
}

impl EditFields {
    fn parse(request: &EditClientRequest) -> Result<Self> {
        Ok(Self {
            id: request.name.as_deref().map(normalize_id).transpose()?,
            mac: request.mac.as_deref().map(normalize_mac).transpose()?,
            ip: request.ip.as_deref().map(normalize_ip).transpose()?,
            master: request.master.as_deref().map(validate_master).transpose()?,
            snapshot: request
                .snapshot
                .as_deref()
                .map(|s| {
                    if s.trim().is_empty() {
                        Ok(None)
                    } else {
                        validate_snapshot(s).map(Some)
                    }
                })
                .transpose()?,
        })
    }

    fn apply(self, env: &Env, current: &Client) -> Client {
        let id = self.id.unwrap_or_else(|| current.id.clone());
        let mut updated = current.clone();
        updated.name = display_name(&id);
        updated.resources = env.namer.names(&id);
        updated.id = id;
        if let Some(mac) = self.mac {
            updated.mac = mac;
        }
        if let Some(ip) = self.ip {
            updated.ip = ip;
        }
        if let Some(master) = self.master {
            updated.master = master;
        }
        if let Some(snapshot) = self.snapshot {
            updated.snapshot = snapshot;
        }
        updated
    }
}

/// Steps applied so far, for error reports.
#[derive(Default)]
struct Progress {
    done: Vec<&'static str>,
}

impl Progress {
    fn mark(&mut self, step: &'static str) {
        self.done.push(step);
    }

    fn fail(&self, id: &str, err: Error) -> Error {
        let applied = if self.done.is_empty() {
            "nothing".to_string()
        } else {
            self.done.join(", ")
        };
        warn!(id, applied = %applied, error = %err, "edit failed part-way");
        err.context(format!("Edit of '{}' failed after applying [{}]", id, applied))
    }
}

impl Provisioner {
    /// Apply an edit to client `id`. Returns the updated record.
    pub async fn edit(&self, id: &str, request: EditClientRequest) -> Result<Client> {
        let old_id = normalize_id(id)?;
        let fields = EditFields::parse(&request)?;
        let new_id = fields.id.clone().unwrap_or_else(|| old_id.clone());

        let _guards = self.locks.lock_all(&[old_id.as_str(), new_id.as_str()]).await;
        let env = self.env.as_ref();
        let current = env.load(&old_id).await?;
        let mut updated = fields.apply(env, &current);

        let plan = classify(&current, &updated);
        info!(id = %old_id, new_id = %new_id, ?plan, "editing client");
        if plan == EditPlan::NoChange {
            return Ok(current);
        }

        // Only values this edit takes on need claiming; the ones it keeps are
        // already visible in the registry.
        let kept = unique_keys(&current);
        let _claim = self.reservations.claim(
            unique_keys(&updated)
                .into_iter()
                .filter(|key| !kept.contains(key)),
        )?;
        env.check_unique(&updated, Some(old_id.as_str())).await?;
        updated.last_modified = Utc::now();

        match plan {
            EditPlan::Readdress => self.readdress(&current, updated).await,
            _ => self.reprovision(&current, updated).await,
        }
    }

    async fn readdress(&self, current: &Client, updated: Client) -> Result<Client> {
        let env = self.env.as_ref();
        let mut progress = Progress::default();

        env.write_lease(&updated, Some(&current.name))
            .await
            .map_err(|e| progress.fail(&current.id, e))?;
        progress.mark("lease");

        env.store
            .upsert(&updated)
            .await
            .map_err(|e| progress.fail(&current.id, e))?;

        info!(id = %updated.id, mac = %updated.mac, ip = %updated.ip, "client readdressed");
        Ok(updated)
    }

    async fn reprovision(&self, current: &Client, mut updated: Client) -> Result<Client> {
        let env = self.env.as_ref();
        let renamed = current.id != updated.id;
        let mut progress = Progress::default();
        let fail = |progress: &Progress, e| progress.fail(&current.id, e);

        if renamed {
            env.check_names_free(&updated.resources).await?;
        }
        env.check_source(&updated.master, updated.snapshot.as_deref())
            .await?;

        // The target holds the zvol open, so it goes first.
        match teardown_target(env.targets.as_ref(), &current.resources).await {
            Ok(()) => progress.mark("old target removed"),
            Err(Error::NotFound(_)) => warn!(id = %current.id, "old target already absent"),
            Err(e) => return Err(fail(&progress, e)),
        }

        if current.has_clone() {
            if env
                .restore_lineage(current)
                .await
                .map_err(|e| fail(&progress, e))?
            {
                progress.mark("promotion reversed");
            }
            env.destroy_if_exists(&current.resources.clone_path)
                .await
                .map_err(|e| fail(&progress, e))?;
            progress.mark("old volume removed");
        }
        if let VolumeSource::ClientCheckpoint { name } = &current.source {
            env.destroy_if_exists(name)
                .await
                .map_err(|e| fail(&progress, e))?;
            progress.mark("old checkpoint removed");
        }

        let (source, _) = env
            .resolve_source(&updated.id, &updated.master, updated.snapshot.as_deref())
            .await
            .map_err(|e| fail(&progress, e))?;
        updated.device_path = Env::device_for(&updated.resources, &source);
        updated.source = source;

        if let Some(origin) = updated.source.origin() {
            env.volumes
                .create_clone(origin, &updated.resources.clone_path)
                .await
                .map_err(|e| fail(&progress, e))?;
            progress.mark("new volume created");
        }

        ensure_target(
            env.targets.as_ref(),
            &updated.resources,
            &updated.device_path,
        )
        .await
        .map_err(|e| fail(&progress, e))?;
        progress.mark("new target configured");

        let lease_moved = current.resources.lease_config_path != updated.resources.lease_config_path;
        if lease_moved {
            env.leases
                .remove(&current.resources.lease_config_path, &current.name)
                .await
                .map_err(|e| fail(&progress, e))?;
        }
        let replaces = (!lease_moved).then_some(current.name.as_str());
        env.write_lease(&updated, replaces)
            .await
            .map_err(|e| fail(&progress, e))?;
        progress.mark("lease");

        if renamed {
            env.store
                .remove(&current.id)
                .await
                .map_err(|e| fail(&progress, e))?;
        }
        env.store
            .upsert(&updated)
            .await
            .map_err(|e| fail(&progress, e))?;

        info!(id = %current.id, new_id = %updated.id, source = ?updated.source, "client reprovisioned");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nsboot_common::ResourceNames;
    use std::path::PathBuf;

    fn client() -> Client {
        let now = Utc::now();
        Client {
            id: "lab01".to_string(),
            name: "LAB01".to_string(),
            mac: "AA:BB:CC:DD:EE:01".to_string(),
            ip: "192.168.1.101".to_string(),
            master: "win11-master".to_string(),
            snapshot: None,
            source: VolumeSource::Master {
                dataset: "nsboot0/win11-master".to_string(),
            },
            resources: ResourceNames {
                clone_path: "nsboot0/lab01-disk".to_string(),
                target_name: "iqn.2025-04.com.nsboot:lab01".to_string(),
                backing_store_name: "block_lab01".to_string(),
                lease_config_path: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            },
            device_path: "/dev/zvol/nsboot0/win11-master".to_string(),
            created_at: now,
            last_modified: now,
        }
    }

    #[test]
    fn test_classify() {
        let current = client();
        assert_eq!(classify(&current, &current.clone()), EditPlan::NoChange);

        let mut readdressed = current.clone();
        readdressed.ip = "192.168.1.150".to_string();
        assert_eq!(classify(&current, &readdressed), EditPlan::Readdress);

        let mut renamed = readdressed.clone();
        renamed.id = "lab02".to_string();
        assert_eq!(classify(&current, &renamed), EditPlan::Reprovision);

        let mut rebased = current.clone();
        rebased.snapshot = Some("nsboot0/win11-master@v2".to_string());
        assert_eq!(classify(&current, &rebased), EditPlan::Reprovision);
    }

    #[test]
    fn test_empty_snapshot_clears() {
        let request = EditClientRequest {
            snapshot: Some(String::new()),
            ..Default::default()
        };
        let fields = EditFields::parse(&request).unwrap();
        assert_eq!(fields.snapshot, Some(None));
        assert!(fields.id.is_none());
    }

    #[test]
    fn test_invalid_fields_are_rejected() {
        let request = EditClientRequest {
            mac: Some("not-a-mac".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            EditFields::parse(&request),
            Err(Error::Validation(_))
        ));
    }
}
