//! Provisioning Workflow
//!
//! Realizes client lifecycle transitions against the volume manager, the
//! iSCSI target service and the DHCP lease service, with the registry record
//! written last. Every operation on a client runs under that client's lock.

use crate::locks::{KeyedLocks, Reservations};
use crate::registry::ClientStore;
use crate::saga::{Saga, SagaStep};
use crate::target::{ensure_target, teardown_target};
use async_trait::async_trait;
use chrono::Utc;
use host_utils::{LeaseEntry, LeaseService, NetworkControl, TargetService, VolumeManager};
use nsboot_common::validation::{
    normalize_id, normalize_ip, normalize_mac, validate_master, validate_snapshot,
};
use nsboot_common::{
    device_path, display_name, Client, ClientView, ControlRequest, CreateClientRequest, Error,
    NamingConfig, ResourceNamer, ResourceNames, Result, VolumeSource,
};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Handles to the external systems.
#[derive(Clone)]
pub struct Collaborators {
    pub volumes: Arc<dyn VolumeManager>,
    pub targets: Arc<dyn TargetService>,
    pub leases: Arc<dyn LeaseService>,
    pub network: Arc<dyn NetworkControl>,
}

/// Settings fixed at startup.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub naming: NamingConfig,

    /// Address of this server as seen by booting clients, embedded in the
    /// iSCSI root path.
    pub server_ip: String,
}

/// Progress of a create attempt, logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Validating,
    CloningVolume,
    ConfiguringTarget,
    ConfiguringLease,
    Committed,
    RollingBack,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Validating => "validating",
            ProvisionState::CloningVolume => "cloning_volume",
            ProvisionState::ConfiguringTarget => "configuring_target",
            ProvisionState::ConfiguringLease => "configuring_lease",
            ProvisionState::Committed => "committed",
            ProvisionState::RollingBack => "rolling_back",
            ProvisionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared by every workflow and by the background status checks.
pub(crate) struct Env {
    pub(crate) volumes: Arc<dyn VolumeManager>,
    pub(crate) targets: Arc<dyn TargetService>,
    pub(crate) leases: Arc<dyn LeaseService>,
    pub(crate) network: Arc<dyn NetworkControl>,
    pub(crate) store: Arc<dyn ClientStore>,
    pub(crate) namer: ResourceNamer,
    pub(crate) server_ip: String,
}

impl Env {
    /// Decide what the client's disk is cloned from, taking a per-client
    /// checkpoint when the master has a base. Returns the source and whether
    /// a checkpoint was created.
    pub(crate) async fn resolve_source(
        &self,
        id: &str,
        master: &str,
        snapshot: Option<&str>,
    ) -> Result<(VolumeSource, bool)> {
        if let Some(snapshot) = snapshot {
            if !self.volumes.exists(snapshot).await? {
                return Err(Error::not_found(format!(
                    "Snapshot '{}' does not exist",
                    snapshot
                )));
            }
            return Ok((
                VolumeSource::Snapshot {
                    name: snapshot.to_string(),
                },
                false,
            ));
        }

        let dataset = self.namer.master_dataset(master);
        let base = self.namer.base_checkpoint(master);
        if self.volumes.exists(&base).await? {
            let checkpoint = self.namer.client_checkpoint(master, id);
            let created = if self.volumes.exists(&checkpoint).await? {
                debug!(checkpoint = %checkpoint, "reusing existing client checkpoint");
                false
            } else {
                self.volumes.snapshot(&checkpoint).await?;
                true
            };
            return Ok((VolumeSource::ClientCheckpoint { name: checkpoint }, created));
        }

        if !self.volumes.exists(&dataset).await? {
            return Err(Error::not_found(format!(
                "Master image '{}' does not exist",
                master
            )));
        }
        warn!(master = %dataset, "no base checkpoint; exporting master directly");
        Ok((VolumeSource::Master { dataset }, false))
    }

    /// Fail with `NotFound` when `resolve_source` could not find a source,
    /// without creating anything.
    pub(crate) async fn check_source(&self, master: &str, snapshot: Option<&str>) -> Result<()> {
        if let Some(snapshot) = snapshot {
            if !self.volumes.exists(snapshot).await? {
                return Err(Error::not_found(format!(
                    "Snapshot '{}' does not exist",
                    snapshot
                )));
            }
            return Ok(());
        }
        if self.volumes.exists(&self.namer.base_checkpoint(master)).await?
            || self.volumes.exists(&self.namer.master_dataset(master)).await?
        {
            return Ok(());
        }
        Err(Error::not_found(format!(
            "Master image '{}' does not exist",
            master
        )))
    }

    /// Reverse a promotion of the client's clone.
    ///
    /// Promoting a clone moves its origin checkpoint (and every earlier
    /// checkpoint of that dataset) onto the clone, leaving the dataset as a
    /// dependent of the clone. Promoting the dataset back returns them, after
    /// which the clone depends on its recorded source again and can be
    /// destroyed. Returns whether a promotion was reversed.
    pub(crate) async fn restore_lineage(&self, client: &Client) -> Result<bool> {
        let Some(origin) = client.source.origin() else {
            return Ok(false);
        };
        let Some((dataset, _)) = origin.split_once('@') else {
            return Ok(false);
        };
        if self.volumes.exists(origin).await? {
            return Ok(false);
        }

        let depends_on = match self.volumes.origin(dataset).await {
            Ok(depends_on) => depends_on,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let moved_to = format!("{}@", client.resources.clone_path);
        match depends_on {
            Some(snapshot) if snapshot.starts_with(&moved_to) => {
                info!(id = %client.id, dataset, from = %snapshot, "reversing promotion");
                self.volumes.promote(dataset).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Block device the target should export for `source`.
    pub(crate) fn device_for(names: &ResourceNames, source: &VolumeSource) -> String {
        match source {
            VolumeSource::Master { dataset } => device_path(dataset),
            _ => device_path(&names.clone_path),
        }
    }

    pub(crate) fn lease_entry(&self, client: &Client) -> LeaseEntry {
        LeaseEntry::new(
            &client.name,
            &client.mac,
            &client.ip,
            &self.server_ip,
            &client.resources.target_name,
        )
    }

    /// Write the client's reservation, confirm it reads back, and reload.
    pub(crate) async fn write_lease(&self, client: &Client, replaces: Option<&str>) -> Result<()> {
        let entry = self.lease_entry(client);
        let path = &client.resources.lease_config_path;
        self.leases.upsert(path, &entry, replaces).await?;

        match self.leases.lookup(path, &entry.host).await? {
            Some(found) if found.mac == entry.mac && found.ip == entry.ip => {}
            _ => {
                return Err(Error::collaborator(format!(
                    "Lease reservation for {} did not persist with {} / {}",
                    entry.host, entry.mac, entry.ip
                )))
            }
        }
        self.leases.reload().await
    }

    /// Remove a reservation and reload, logging (not failing on) the reload.
    pub(crate) async fn withdraw_lease(&self, client: &Client) -> Result<()> {
        self.leases
            .remove(&client.resources.lease_config_path, &client.name)
            .await?;
        if let Err(err) = self.leases.reload().await {
            warn!(id = %client.id, error = %err, "DHCP reload failed after removing lease");
        }
        Ok(())
    }

    pub(crate) async fn destroy_if_exists(&self, name: &str) -> Result<bool> {
        if self.volumes.exists(name).await? {
            self.volumes.destroy(name).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reject a record whose id, mac, ip or host name is already used by
    /// another client.
    pub(crate) async fn check_unique(
        &self,
        candidate: &Client,
        exclude: Option<&str>,
    ) -> Result<()> {
        for other in self.store.list().await? {
            if Some(other.id.as_str()) == exclude {
                continue;
            }
            if other.id == candidate.id {
                return Err(Error::conflict(format!(
                    "Client '{}' already exists",
                    candidate.id
                )));
            }
            if other.mac == candidate.mac {
                return Err(Error::conflict(format!(
                    "MAC address {} is already assigned to client '{}'",
                    candidate.mac, other.id
                )));
            }
            if other.ip == candidate.ip {
                return Err(Error::conflict(format!(
                    "IP address {} is already assigned to client '{}'",
                    candidate.ip, other.id
                )));
            }
            if other.name == candidate.name {
                return Err(Error::conflict(format!(
                    "Host name {} is already used by client '{}'",
                    candidate.name, other.id
                )));
            }
        }
        Ok(())
    }

    /// Reject names already taken by objects the registry does not know of.
    pub(crate) async fn check_names_free(&self, names: &ResourceNames) -> Result<()> {
        if self.volumes.exists(&names.clone_path).await? {
            return Err(Error::conflict(format!(
                "Volume {} already exists",
                names.clone_path
            )));
        }
        if self
            .targets
            .list_targets()
            .await?
            .iter()
            .any(|t| *t == names.target_name)
        {
            return Err(Error::conflict(format!(
                "Target {} already exists",
                names.target_name
            )));
        }
        Ok(())
    }

    pub(crate) async fn is_super(&self, client: &Client) -> bool {
        if !client.has_clone() {
            return false;
        }
        match self.volumes.origin(&client.resources.clone_path).await {
            Ok(origin) => origin.is_none(),
            Err(err) => {
                warn!(id = %client.id, error = %err, "failed to read clone origin");
                false
            }
        }
    }

    pub(crate) async fn view(&self, client: Client) -> ClientView {
        let status = self.network.ping_status(&client.ip).await;
        let is_super_client = self.is_super(&client).await;
        ClientView {
            client,
            status,
            is_super_client,
        }
    }

    pub(crate) async fn load(&self, id: &str) -> Result<Client> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Client '{}' not found", id)))
    }
}

/// Values of `client` that no other client may share, as reservation keys.
pub(crate) fn unique_keys(client: &Client) -> Vec<String> {
    vec![
        format!("Client '{}'", client.id),
        format!("MAC address {}", client.mac),
        format!("IP address {}", client.ip),
        format!("Host name {}", client.name),
    ]
}

/// Orchestrates client lifecycle operations.
pub struct Provisioner {
    pub(crate) env: Arc<Env>,
    pub(crate) locks: KeyedLocks,
    pub(crate) reservations: Reservations,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        hosts: Collaborators,
        store: Arc<dyn ClientStore>,
    ) -> Self {
        Self {
            env: Arc::new(Env {
                volumes: hosts.volumes,
                targets: hosts.targets,
                leases: hosts.leases,
                network: hosts.network,
                store,
                namer: ResourceNamer::new(config.naming),
                server_ip: config.server_ip,
            }),
            locks: KeyedLocks::new(),
            reservations: Reservations::new(),
        }
    }

    pub fn namer(&self) -> &ResourceNamer {
        &self.env.namer
    }

    pub async fn health_check(&self) -> Result<()> {
        self.env.store.health_check().await
    }

    /// Every client with freshly checked status, sorted by id.
    pub async fn list(&self) -> Result<Vec<ClientView>> {
        let clients = self.env.store.list().await?;

        let mut checks = JoinSet::new();
        for (index, client) in clients.into_iter().enumerate() {
            let env = self.env.clone();
            checks.spawn(async move { (index, env.view(client).await) });
        }

        let mut views = Vec::with_capacity(checks.len());
        while let Some(result) = checks.join_next().await {
            let (index, view) =
                result.map_err(|e| Error::collaborator(format!("Status check failed: {}", e)))?;
            views.push((index, view));
        }
        views.sort_by_key(|(index, _)| *index);
        Ok(views.into_iter().map(|(_, view)| view).collect())
    }

    pub async fn get(&self, id: &str) -> Result<ClientView> {
        let id = normalize_id(id)?;
        let client = self.env.load(&id).await?;
        Ok(self.env.view(client).await)
    }

    /// Provision a new client: volume, target, lease, then registry record.
    /// Any failure after the first external change is rolled back.
    pub async fn create(&self, request: CreateClientRequest) -> Result<Client> {
        let id = normalize_id(&request.name)?;
        let mac = normalize_mac(&request.mac)?;
        let ip = normalize_ip(&request.ip)?;
        let master = validate_master(&request.master)?;
        let snapshot = request
            .snapshot
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(validate_snapshot)
            .transpose()?;

        let _guard = self.locks.lock(&id).await;
        info!(id = %id, state = %ProvisionState::Validating, "creating client");

        let resources = self.env.namer.names(&id);
        let dataset = self.env.namer.master_dataset(&master);
        let now = Utc::now();
        let draft = Client {
            name: display_name(&id),
            id,
            mac,
            ip,
            master,
            snapshot,
            device_path: device_path(&dataset),
            source: VolumeSource::Master { dataset },
            resources,
            created_at: now,
            last_modified: now,
        };

        // Held until the record is committed or rolled back.
        let _claim = self.reservations.claim(unique_keys(&draft))?;
        self.env.check_unique(&draft, None).await?;
        self.env.check_names_free(&draft.resources).await?;

        let mut ctx = CreateContext {
            env: self.env.clone(),
            client: draft,
            checkpoint_created: false,
        };
        let saga = Saga::new("create")
            .step(ResolveSource)
            .step(CloneVolume)
            .step(ConfigureTarget)
            .step(ConfigureLease)
            .step(Commit);

        match saga.execute(&mut ctx).await {
            Ok(()) => {
                info!(id = %ctx.client.id, state = %ProvisionState::Committed, "client created");
                Ok(ctx.client)
            }
            Err(err) => {
                error!(id = %ctx.client.id, state = %ProvisionState::Failed, error = %err, "client creation failed");
                Err(err)
            }
        }
    }

    /// Tear down everything the client owns. Every step is attempted; failures
    /// are collected and reported as a partial failure.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = normalize_id(id)?;
        let _guard = self.locks.lock(&id).await;
        let client = self.env.load(&id).await?;
        info!(id = %id, "deleting client");

        let mut errors = Vec::new();
        let mut record = |step: &str, result: Result<()>| {
            if let Err(err) = result {
                warn!(id = %id, step, error = %err, "delete step failed");
                errors.push(format!("{}: {}", step, err));
            }
        };

        let result = self
            .env
            .leases
            .remove(&client.resources.lease_config_path, &client.name)
            .await
            .map(|_| ());
        record("lease", result);
        record("dhcp reload", self.env.leases.reload().await);

        record(
            "target",
            teardown_target(self.env.targets.as_ref(), &client.resources).await,
        );

        if client.has_clone() {
            let result = self.env.restore_lineage(&client).await.map(|_| ());
            record("lineage", result);
            let result = self
                .env
                .destroy_if_exists(&client.resources.clone_path)
                .await
                .map(|_| ());
            record("volume", result);
        }
        if let VolumeSource::ClientCheckpoint { name } = &client.source {
            let result = self.env.destroy_if_exists(name).await.map(|_| ());
            record("checkpoint", result);
        }

        let result = self.env.store.remove(&id).await.map(|_| ());
        record("registry", result);

        if errors.is_empty() {
            info!(id = %id, "client deleted");
            Ok(())
        } else {
            Err(Error::PartialFailure {
                message: format!("Client '{}' deleted with errors", id),
                errors,
            })
        }
    }

    /// Recreate the client's clone and target from its recorded source,
    /// discarding all writes. Lease and identity are left alone.
    pub async fn reset(&self, id: &str) -> Result<Client> {
        let id = normalize_id(id)?;
        let _guard = self.locks.lock(&id).await;
        let mut client = self.env.load(&id).await?;
        info!(id = %id, "resetting client");

        let names = &client.resources;
        if self.env.restore_lineage(&client).await? {
            info!(id = %id, "discarding Super Client state");
        }
        if let Some(origin) = client.source.origin() {
            if !self.env.volumes.exists(origin).await? {
                return Err(Error::not_found(format!(
                    "Origin '{}' of client '{}' no longer exists",
                    origin, id
                )));
            }
        }

        if let Err(err) = teardown_target(self.env.targets.as_ref(), names).await {
            warn!(id = %id, error = %err, "target teardown before reset failed");
        }
        if let Some(origin) = client.source.origin() {
            self.env.destroy_if_exists(&names.clone_path).await?;
            self.env
                .volumes
                .create_clone(origin, &names.clone_path)
                .await
                .map_err(|e| {
                    error!(id = %id, error = %e, "reset left the client without a volume");
                    e.context(format!("Reset of '{}' failed after removing the old clone", id))
                })?;
        }
        ensure_target(self.env.targets.as_ref(), names, &client.device_path)
            .await
            .map_err(|e| e.context(format!("Reset of '{}' failed after rebuilding the clone", id)))?;

        client.last_modified = Utc::now();
        self.env.store.upsert(&client).await?;
        info!(id = %id, "client reset");
        Ok(client)
    }

    /// Dispatch a control action. Returns a human-readable result.
    pub async fn control(&self, id: &str, request: ControlRequest) -> Result<String> {
        let id = normalize_id(id)?;
        match request.action.as_str() {
            "wake" => {
                let client = self.env.load(&id).await?;
                self.env.network.wake(&client.mac).await?;
                Ok(format!("Wake-on-LAN sent to {}", client.mac))
            }
            "reboot" => {
                let client = self.env.load(&id).await?;
                self.env.network.reboot(&client.ip).await?;
                Ok(format!("Reboot requested for {}", client.ip))
            }
            "shutdown" => {
                let client = self.env.load(&id).await?;
                self.env.network.shutdown(&client.ip).await?;
                Ok(format!("Shutdown requested for {}", client.ip))
            }
            "toggleSuper" => match request.make_super {
                Some(true) => self.promote(&id).await,
                Some(false) => self.demote(&id).await,
                None => Err(Error::validation("makeSuper is required for toggleSuper")),
            },
            "edit" => Err(Error::Unsupported(
                "Action 'edit' is not supported here; use the edit endpoint".to_string(),
            )),
            other => Err(Error::validation(format!("Unknown action '{}'", other))),
        }
    }
}

struct CreateContext {
    env: Arc<Env>,
    client: Client,
    checkpoint_created: bool,
}

struct ResolveSource;

#[async_trait]
impl SagaStep<CreateContext> for ResolveSource {
    fn name(&self) -> &'static str {
        "resolve source"
    }

    async fn apply(&self, ctx: &mut CreateContext) -> Result<()> {
        let client = &ctx.client;
        let (source, created) = ctx
            .env
            .resolve_source(&client.id, &client.master, client.snapshot.as_deref())
            .await?;
        ctx.checkpoint_created = created;
        ctx.client.device_path = Env::device_for(&ctx.client.resources, &source);
        ctx.client.source = source;
        Ok(())
    }

    async fn compensate(&self, ctx: &CreateContext) -> Result<()> {
        if let (true, VolumeSource::ClientCheckpoint { name }) =
            (ctx.checkpoint_created, &ctx.client.source)
        {
            info!(id = %ctx.client.id, state = %ProvisionState::RollingBack, checkpoint = %name, "removing checkpoint");
            ctx.env.destroy_if_exists(name).await?;
        }
        Ok(())
    }
}

struct CloneVolume;

#[async_trait]
impl SagaStep<CreateContext> for CloneVolume {
    fn name(&self) -> &'static str {
        "clone volume"
    }

    async fn apply(&self, ctx: &mut CreateContext) -> Result<()> {
        let client = &ctx.client;
        info!(id = %client.id, state = %ProvisionState::CloningVolume, source = ?client.source);
        if let Some(origin) = client.source.origin() {
            ctx.env
                .volumes
                .create_clone(origin, &client.resources.clone_path)
                .await?;
        }
        Ok(())
    }

    async fn compensate(&self, ctx: &CreateContext) -> Result<()> {
        if ctx.client.has_clone() {
            info!(id = %ctx.client.id, state = %ProvisionState::RollingBack, "removing clone");
            ctx.env
                .destroy_if_exists(&ctx.client.resources.clone_path)
                .await?;
        }
        Ok(())
    }
}

struct ConfigureTarget;

#[async_trait]
impl SagaStep<CreateContext> for ConfigureTarget {
    fn name(&self) -> &'static str {
        "configure target"
    }

    async fn apply(&self, ctx: &mut CreateContext) -> Result<()> {
        let client = &ctx.client;
        info!(id = %client.id, state = %ProvisionState::ConfiguringTarget, target = %client.resources.target_name);
        ensure_target(
            ctx.env.targets.as_ref(),
            &client.resources,
            &client.device_path,
        )
        .await
    }

    async fn compensate(&self, ctx: &CreateContext) -> Result<()> {
        info!(id = %ctx.client.id, state = %ProvisionState::RollingBack, "removing target");
        match teardown_target(ctx.env.targets.as_ref(), &ctx.client.resources).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct ConfigureLease;

#[async_trait]
impl SagaStep<CreateContext> for ConfigureLease {
    fn name(&self) -> &'static str {
        "configure lease"
    }

    async fn apply(&self, ctx: &mut CreateContext) -> Result<()> {
        info!(id = %ctx.client.id, state = %ProvisionState::ConfiguringLease, host = %ctx.client.name);
        ctx.env.write_lease(&ctx.client, None).await
    }

    async fn compensate(&self, ctx: &CreateContext) -> Result<()> {
        info!(id = %ctx.client.id, state = %ProvisionState::RollingBack, "removing lease");
        ctx.env.withdraw_lease(&ctx.client).await
    }
}

struct Commit;

#[async_trait]
impl SagaStep<CreateContext> for Commit {
    fn name(&self) -> &'static str {
        "commit"
    }

    async fn apply(&self, ctx: &mut CreateContext) -> Result<()> {
        ctx.env.store.upsert(&ctx.client).await
    }
}
