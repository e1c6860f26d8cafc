//! iSCSI export of a client's volume.

use host_utils::{Portal, TargetService};
use nsboot_common::{Error, ResourceNames, Result};
use tracing::{debug, info, warn};

/// Converge the target for `names` onto exporting `device`.
///
/// Safe to repeat. The backstore is always recreated so that a changed
/// device path is picked up; everything else is created only when missing.
pub async fn ensure_target(
    targets: &dyn TargetService,
    names: &ResourceNames,
    device: &str,
) -> Result<()> {
    let target = names.target_name.as_str();
    let backstore = names.backing_store_name.as_str();

    if !targets.list_targets().await?.iter().any(|t| t == target) {
        targets.create_target(target).await?;
    } else {
        debug!(target, "target already exists");
    }

    if targets.list_backstores().await?.iter().any(|b| b == backstore) {
        info!(backstore, "replacing existing backstore");
        targets.delete_backstore(backstore).await?;
    }
    targets.create_backstore(backstore, device).await?;

    let luns = targets.list_luns(target).await?;
    if !luns.iter().any(|lun| lun.backstore == backstore) {
        targets.create_lun(target, backstore).await?;
    }

    let portal = Portal::catch_all();
    if !targets.list_portals(target).await?.contains(&portal) {
        targets.create_portal(target, &portal).await?;
    }

    targets.save().await?;
    info!(target, backstore, device, "target configured");
    Ok(())
}

/// Remove the target and its backstore.
///
/// Every part is attempted even when an earlier one fails; a target that no
/// longer exists is reported as an error.
pub async fn teardown_target(targets: &dyn TargetService, names: &ResourceNames) -> Result<()> {
    let target = names.target_name.as_str();
    let backstore = names.backing_store_name.as_str();
    let mut errors: Vec<Error> = Vec::new();

    if let Err(err) = targets.delete_target(target).await {
        warn!(target, error = %err, "failed to delete target");
        errors.push(err);
    }

    match targets.list_backstores().await {
        Ok(list) if list.iter().any(|b| b == backstore) => {
            if let Err(err) = targets.delete_backstore(backstore).await {
                warn!(backstore, error = %err, "failed to delete backstore");
                errors.push(err);
            }
        }
        Ok(_) => debug!(backstore, "no backstore to delete"),
        Err(err) => errors.push(err),
    }

    if let Err(err) = targets.save().await {
        errors.push(err);
    }

    match errors.len() {
        0 => {
            info!(target, "target removed");
            Ok(())
        }
        1 => Err(errors.remove(0)),
        _ => Err(Error::Collaborator {
            message: format!("Teardown of {} incomplete", target),
            output: errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_utils::fakes::FakeTargets;
    use std::path::PathBuf;

    fn names() -> ResourceNames {
        ResourceNames {
            clone_path: "nsboot0/lab01-disk".to_string(),
            target_name: "iqn.2025-04.com.nsboot:lab01".to_string(),
            backing_store_name: "block_lab01".to_string(),
            lease_config_path: PathBuf::from("/etc/dhcp/dhcpd.conf"),
        }
    }

    const DEVICE: &str = "/dev/zvol/nsboot0/lab01-disk";

    #[tokio::test]
    async fn test_ensure_target_is_idempotent() {
        let targets = FakeTargets::new();
        let names = names();

        ensure_target(targets.as_ref(), &names, DEVICE).await.unwrap();
        let once = targets.target(&names.target_name).unwrap();

        ensure_target(targets.as_ref(), &names, DEVICE).await.unwrap();
        let twice = targets.target(&names.target_name).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.luns.len(), 1);
        assert_eq!(twice.portals, vec![Portal::catch_all()]);
        assert_eq!(targets.backstore_names(), vec!["block_lab01".to_string()]);
        assert_eq!(targets.backstore("block_lab01").as_deref(), Some(DEVICE));
        assert_eq!(targets.target_names().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_target_rebinds_changed_device() {
        let targets = FakeTargets::new();
        let names = names();

        ensure_target(targets.as_ref(), &names, DEVICE).await.unwrap();
        ensure_target(targets.as_ref(), &names, "/dev/zvol/nsboot0/win11")
            .await
            .unwrap();

        assert_eq!(
            targets.backstore("block_lab01").as_deref(),
            Some("/dev/zvol/nsboot0/win11")
        );
        assert_eq!(targets.target(&names.target_name).unwrap().luns.len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_missing_target_still_removes_backstore() {
        let targets = FakeTargets::new();
        let names = names();
        ensure_target(targets.as_ref(), &names, DEVICE).await.unwrap();
        targets.drop_target(&names.target_name);

        let err = teardown_target(targets.as_ref(), &names).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(targets.backstore_names().is_empty());
    }
}
