//! Super Client promotion and demotion.
//!
//! A Super Client's clone is independent of the master it came from, so
//! changes made on it can later be captured as a new master. Promotion is a
//! single `zfs promote`. Demotion swaps in a fresh clone of the clone's
//! origin and discards the old one, which takes several renames and is run
//! as a saga so a failure puts the old clone back in place.

use crate::saga::{Saga, SagaStep};
use crate::target::ensure_target;
use crate::workflow::{Env, Provisioner};
use async_trait::async_trait;
use chrono::Utc;
use nsboot_common::validation::normalize_id;
use nsboot_common::{Client, Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

impl Provisioner {
    /// Make the client's clone independent of its origin.
    pub async fn promote(&self, id: &str) -> Result<String> {
        let id = normalize_id(id)?;
        let _guard = self.locks.lock(&id).await;
        let env = self.env.as_ref();
        let mut client = env.load(&id).await?;

        if !client.has_clone() {
            return Err(Error::validation(format!(
                "Client '{}' exports its master directly and cannot become a Super Client",
                id
            )));
        }

        let clone = &client.resources.clone_path;
        match env.volumes.origin(clone).await? {
            None => Ok(format!("Client '{}' is already a Super Client", id)),
            Some(origin) => {
                env.volumes.promote(clone).await?;
                info!(id = %id, origin = %origin, "client promoted");

                client.last_modified = Utc::now();
                env.store.upsert(&client).await?;
                Ok(format!("Client '{}' is now a Super Client", id))
            }
        }
    }

    /// Replace the client's clone with a fresh clone of its current origin,
    /// discarding everything written since. A clone without an origin (a
    /// promoted one) cannot be demoted.
    pub async fn demote(&self, id: &str) -> Result<String> {
        let id = normalize_id(id)?;
        let _guard = self.locks.lock(&id).await;
        let env = self.env.as_ref();
        let mut client = env.load(&id).await?;

        if !client.has_clone() {
            return Err(Error::validation(format!(
                "Client '{}' exports its master directly and has no clone to demote",
                id
            )));
        }
        let Some(origin) = env.volumes.origin(&client.resources.clone_path).await? else {
            return Err(Error::validation(format!(
                "Client '{}' has no recorded origin to demote from",
                id
            )));
        };

        let temp = env.namer.temp_clone_path(&id);
        let retired = env.namer.retired_clone_path(&id);
        for leftover in [&temp, &retired] {
            if env.destroy_if_exists(leftover).await? {
                warn!(id = %id, volume = %leftover, "removed leftover from an earlier demotion");
            }
        }

        let mut ctx = DemoteContext {
            env: self.env.clone(),
            client: client.clone(),
            origin,
            temp,
            retired,
            rebinding: false,
        };
        Saga::new("demote")
            .step(CloneTemp)
            .step(RetireCurrent)
            .step(InstallTemp)
            .step(Rebind)
            .execute(&mut ctx)
            .await?;

        if let Err(err) = env.volumes.destroy(&ctx.retired).await {
            warn!(id = %id, volume = %ctx.retired, error = %err, "failed to destroy retired clone");
        }

        client.last_modified = Utc::now();
        env.store.upsert(&client).await?;
        info!(id = %id, origin = %ctx.origin, "client demoted");
        Ok(format!(
            "Client '{}' now runs on a fresh clone of {}",
            id, ctx.origin
        ))
    }
}

struct DemoteContext {
    env: Arc<Env>,
    client: Client,
    origin: String,
    temp: String,
    retired: String,
    /// Set once the target may have been pointed at the new clone.
    rebinding: bool,
}

impl DemoteContext {
    fn clone_path(&self) -> &str {
        &self.client.resources.clone_path
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.env.volumes.exists(name).await
    }
}

struct CloneTemp;

#[async_trait]
impl SagaStep<DemoteContext> for CloneTemp {
    fn name(&self) -> &'static str {
        "clone origin"
    }

    async fn apply(&self, ctx: &mut DemoteContext) -> Result<()> {
        ctx.env.volumes.create_clone(&ctx.origin, &ctx.temp).await
    }

    async fn compensate(&self, ctx: &DemoteContext) -> Result<()> {
        ctx.env.destroy_if_exists(&ctx.temp).await.map(|_| ())
    }
}

struct RetireCurrent;

#[async_trait]
impl SagaStep<DemoteContext> for RetireCurrent {
    fn name(&self) -> &'static str {
        "retire current clone"
    }

    async fn apply(&self, ctx: &mut DemoteContext) -> Result<()> {
        ctx.env.volumes.rename(ctx.clone_path(), &ctx.retired).await
    }

    // The old clone gets its name back before the target is bound to it.
    async fn compensate(&self, ctx: &DemoteContext) -> Result<()> {
        if ctx.exists(&ctx.retired).await? && !ctx.exists(ctx.clone_path()).await? {
            ctx.env.volumes.rename(&ctx.retired, ctx.clone_path()).await?;
        }
        if ctx.rebinding {
            ensure_target(
                ctx.env.targets.as_ref(),
                &ctx.client.resources,
                &ctx.client.device_path,
            )
            .await?;
        }
        Ok(())
    }
}

struct InstallTemp;

#[async_trait]
impl SagaStep<DemoteContext> for InstallTemp {
    fn name(&self) -> &'static str {
        "install new clone"
    }

    async fn apply(&self, ctx: &mut DemoteContext) -> Result<()> {
        ctx.env.volumes.rename(&ctx.temp, ctx.clone_path()).await
    }

    async fn compensate(&self, ctx: &DemoteContext) -> Result<()> {
        if ctx.exists(ctx.clone_path()).await? && !ctx.exists(&ctx.temp).await? {
            ctx.env.volumes.rename(ctx.clone_path(), &ctx.temp).await?;
        }
        Ok(())
    }
}

struct Rebind;

#[async_trait]
impl SagaStep<DemoteContext> for Rebind {
    fn name(&self) -> &'static str {
        "rebind target"
    }

    async fn apply(&self, ctx: &mut DemoteContext) -> Result<()> {
        ctx.rebinding = true;
        ensure_target(
            ctx.env.targets.as_ref(),
            &ctx.client.resources,
            &ctx.client.device_path,
        )
        .await
    }

    // Release the new clone so it can be renamed away and destroyed.
    async fn compensate(&self, ctx: &DemoteContext) -> Result<()> {
        let targets = ctx.env.targets.as_ref();
        let backstore = ctx.client.resources.backing_store_name.as_str();
        if targets.list_backstores().await?.iter().any(|b| b == backstore) {
            targets.delete_backstore(backstore).await?;
        }
        Ok(())
    }
}
