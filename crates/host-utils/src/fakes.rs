//! In-memory collaborators for tests.
//!
//! Each fake keeps just enough state to behave like the real service for the
//! operations the provisioning workflow uses, records every call in order,
//! and can be told to fail specific operations.

use crate::dhcp::{LeaseEntry, LeaseService};
use crate::executor::{command_line, BoxedExecutor, CommandOutput, ExecutionError, Executor};
use crate::network::NetworkControl;
use crate::targetcli::{Lun, Portal, TargetService};
use crate::zfs::{DatasetInfo, VolumeManager};
use async_trait::async_trait;
use nsboot_common::{ClientStatus, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared by every fake so calls on different collaborators can be ordered.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Calls in the order they were made, each with its global sequence number.
#[derive(Default)]
struct Journal {
    entries: Vec<(u64, String)>,
}

impl Journal {
    fn push(&mut self, call: String) {
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        self.entries.push((seq, call));
    }
}

struct FailureRule {
    op: String,
    arg: Option<String>,
    /// Remaining failures; `None` fails forever.
    remaining: Option<usize>,
}

/// Operations scheduled to fail, optionally only for one argument.
#[derive(Default)]
struct Failures {
    rules: Vec<FailureRule>,
}

impl Failures {
    fn add(&mut self, op: &str, arg: Option<&str>, remaining: Option<usize>) {
        self.rules.push(FailureRule {
            op: op.to_string(),
            arg: arg.map(str::to_string),
            remaining,
        });
    }

    fn check(&mut self, op: &str, arg: &str) -> Result<()> {
        let rule = self.rules.iter_mut().find(|rule| {
            rule.op == op
                && rule.arg.as_deref().map_or(true, |a| a == arg)
                && rule.remaining != Some(0)
        });
        let hit = match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                true
            }
            None => false,
        };
        if hit {
            return Err(Error::Collaborator {
                message: format!("{} {} failed", op, arg),
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

macro_rules! failure_controls {
    () => {
        /// Make every call of `op` fail.
        pub fn fail_on(&self, op: &str) {
            self.state.lock().unwrap().failures.add(op, None, None);
        }

        /// Make only the next call of `op` fail.
        pub fn fail_once(&self, op: &str) {
            self.state.lock().unwrap().failures.add(op, None, Some(1));
        }

        /// Make calls of `op` whose first argument is `arg` fail.
        pub fn fail_on_arg(&self, op: &str, arg: &str) {
            self.state.lock().unwrap().failures.add(op, Some(arg), None);
        }

        pub fn clear_failures(&self) {
            self.state.lock().unwrap().failures.rules.clear();
        }

        /// Every call made so far, as `"<op> <args>"`.
        pub fn calls(&self) -> Vec<String> {
            self.sequenced_calls().into_iter().map(|(_, call)| call).collect()
        }

        /// Every call with its sequence number, comparable across fakes.
        pub fn sequenced_calls(&self) -> Vec<(u64, String)> {
            self.state.lock().unwrap().calls.entries.clone()
        }

        /// Calls other than read-only lookups.
        pub fn mutations(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| !Self::READ_ONLY.iter().any(|op| c.split(' ').next() == Some(*op)))
                .collect()
        }
    };
}

// ---------------------------------------------------------------------------
// Executor

/// A command handed to the [`FakeExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub privileged: bool,
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        write!(f, "{}", command_line(&self.program, &args))
    }
}

pub type OutputFn = dyn FnMut(&Invocation) -> CommandOutput + Send + Sync;
pub type ErrorFn = dyn FnMut(&Invocation) -> Option<ExecutionError> + Send + Sync;

/// An executor that records commands and answers from a handler.
pub struct FakeExecutor {
    invocations: Mutex<Vec<Invocation>>,
    handler: Mutex<Box<OutputFn>>,
    error_handler: Mutex<Box<ErrorFn>>,
}

impl FakeExecutor {
    /// By default every command succeeds with empty output.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            handler: Mutex::new(Box::new(|_| CommandOutput {
                status: Some(0),
                ..Default::default()
            })),
            error_handler: Mutex::new(Box::new(|_| None)),
        })
    }

    pub fn set_handler(&self, f: Box<OutputFn>) {
        *self.handler.lock().unwrap() = f;
    }

    /// Simulate spawn failures and timeouts.
    pub fn set_error_handler(&self, f: Box<ErrorFn>) {
        *self.error_handler.lock().unwrap() = f;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.invocations().iter().map(|i| i.to_string()).collect()
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_unchecked(
        &self,
        program: &str,
        args: &[&str],
        privileged: bool,
    ) -> std::result::Result<CommandOutput, ExecutionError> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            privileged,
        };
        self.invocations.lock().unwrap().push(invocation.clone());

        if let Some(err) = (self.error_handler.lock().unwrap())(&invocation) {
            return Err(err);
        }
        let output = (self.handler.lock().unwrap())(&invocation);
        crate::executor::log_output(0, &invocation.to_string(), &output);
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Volumes

#[derive(Default)]
struct VolumeState {
    /// name -> origin
    datasets: BTreeMap<String, Option<String>>,
    /// name -> creation order, which decides what a promotion takes along
    created: HashMap<String, u64>,
    clock: u64,
    calls: Journal,
    failures: Failures,
}

impl VolumeState {
    fn insert(&mut self, name: &str, origin: Option<String>) {
        self.clock += 1;
        self.created.insert(name.to_string(), self.clock);
        self.datasets.insert(name.to_string(), origin);
    }

    fn remove(&mut self, name: &str) {
        self.created.remove(name);
        self.datasets.remove(name);
    }

    /// Creation order stands in for the timestamp.
    fn info(&self, name: &str) -> DatasetInfo {
        DatasetInfo {
            name: name.to_string(),
            created: self.created.get(name).copied().unwrap_or_default() as i64,
            used: 0,
        }
    }

    /// Rename one entry, re-pointing clones that descend from it.
    fn move_entry(&mut self, old: &str, new: &str) {
        if let Some(origin) = self.datasets.remove(old) {
            self.datasets.insert(new.to_string(), origin);
        }
        if let Some(created) = self.created.remove(old) {
            self.created.insert(new.to_string(), created);
        }
        for origin in self.datasets.values_mut().flatten() {
            if origin == old {
                *origin = new.to_string();
            }
        }
    }
}

/// In-memory copy-on-write volumes.
#[derive(Default)]
pub struct FakeVolumes {
    state: Mutex<VolumeState>,
}

impl FakeVolumes {
    const READ_ONLY: &'static [&'static str] =
        &["exists", "origin", "list_children", "list_snapshots"];

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    failure_controls!();

    /// Seed a dataset or snapshot without recording a call.
    pub fn add(&self, name: &str) {
        self.state.lock().unwrap().insert(name, None);
    }

    /// Remove a dataset behind the workflow's back.
    pub fn drop_dataset(&self, name: &str) {
        self.state.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().datasets.contains_key(name)
    }

    pub fn origin_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .datasets
            .get(name)
            .cloned()
            .flatten()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().datasets.keys().cloned().collect()
    }

    fn begin(&self, op: &str, args: &[&str]) -> Result<std::sync::MutexGuard<'_, VolumeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, args.join(" ")));
        state.failures.check(op, args.first().copied().unwrap_or(""))?;
        Ok(state)
    }
}

fn missing(name: &str) -> Error {
    Error::not_found(format!("Volume '{}' does not exist", name))
}

fn already_exists(name: &str) -> Error {
    Error::Collaborator {
        message: format!("cannot create '{}'", name),
        output: "dataset already exists".to_string(),
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    async fn exists(&self, name: &str) -> Result<bool> {
        let state = self.begin("exists", &[name])?;
        Ok(state.datasets.contains_key(name))
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        let mut state = self.begin("snapshot", &[name])?;
        let (dataset, _) = name
            .split_once('@')
            .ok_or_else(|| Error::validation(format!("'{}' is not a snapshot name", name)))?;
        if !state.datasets.contains_key(dataset) {
            return Err(missing(dataset));
        }
        if state.datasets.contains_key(name) {
            return Err(already_exists(name));
        }
        state.insert(name, None);
        Ok(())
    }

    async fn create_clone(&self, origin: &str, target: &str) -> Result<()> {
        let mut state = self.begin("clone", &[origin, target])?;
        if !state.datasets.contains_key(origin) {
            return Err(missing(origin));
        }
        if state.datasets.contains_key(target) {
            return Err(already_exists(target));
        }
        state.insert(target, Some(origin.to_string()));
        Ok(())
    }

    async fn origin(&self, name: &str) -> Result<Option<String>> {
        let state = self.begin("origin", &[name])?;
        state.datasets.get(name).cloned().ok_or_else(|| missing(name))
    }

    /// Like `zfs promote`: the origin snapshot and every earlier snapshot of
    /// the origin's dataset move to the clone, and that dataset becomes a
    /// clone of the moved origin.
    async fn promote(&self, name: &str) -> Result<()> {
        let mut guard = self.begin("promote", &[name])?;
        let state = &mut *guard;
        let origin = match state.datasets.get(name) {
            None => return Err(missing(name)),
            Some(None) => {
                return Err(Error::Collaborator {
                    message: format!("cannot promote '{}'", name),
                    output: "not a cloned filesystem".to_string(),
                })
            }
            Some(Some(origin)) => origin.clone(),
        };
        let parent = match origin.split_once('@') {
            Some((parent, _)) => parent.to_string(),
            None => return Err(missing(&origin)),
        };

        let cutoff = state.created.get(&origin).copied().unwrap_or_default();
        let prefix = format!("{}@", parent);
        let moved: Vec<(String, String)> = state
            .datasets
            .keys()
            .filter(|k| {
                k.starts_with(&prefix) && state.created.get(*k).map_or(false, |c| *c <= cutoff)
            })
            .map(|old| (old.clone(), format!("{}{}", name, &old[parent.len()..])))
            .collect();
        if let Some((_, taken)) = moved.iter().find(|(_, new)| state.datasets.contains_key(new)) {
            return Err(already_exists(taken));
        }

        let parent_origin = state.datasets.get(&parent).cloned().flatten();
        for (old, new) in &moved {
            state.move_entry(old, new);
        }
        let promoted_origin = format!("{}{}", name, &origin[parent.len()..]);
        state.datasets.insert(name.to_string(), parent_origin);
        state.datasets.insert(parent, Some(promoted_origin));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.begin("rename", &[from, to])?;
        if !state.datasets.contains_key(from) {
            return Err(missing(from));
        }
        if state.datasets.contains_key(to) {
            return Err(already_exists(to));
        }
        let prefix = format!("{}@", from);
        let moved: Vec<String> = state
            .datasets
            .keys()
            .filter(|k| *k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            state.move_entry(&old, &new);
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.begin("destroy", &[name])?;
        if !state.datasets.contains_key(name) {
            return Err(missing(name));
        }
        let prefix = format!("{}@", name);
        let busy = state
            .datasets
            .iter()
            .any(|(k, origin)| k.starts_with(&prefix) || origin.as_deref() == Some(name));
        if busy {
            return Err(Error::Collaborator {
                message: format!("cannot destroy '{}'", name),
                output: "filesystem has children or dependent clones".to_string(),
            });
        }
        state.remove(name);
        Ok(())
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<DatasetInfo>> {
        let state = self.begin("list_children", &[parent])?;
        if !state.datasets.contains_key(parent) {
            return Err(missing(parent));
        }
        let prefix = format!("{}/", parent);
        Ok(state
            .datasets
            .keys()
            .filter(|k| {
                k.strip_prefix(&prefix)
                    .map_or(false, |rest| !rest.contains('/') && !rest.contains('@'))
            })
            .map(|k| state.info(k))
            .collect())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<DatasetInfo>> {
        let state = self.begin("list_snapshots", &[dataset])?;
        if !state.datasets.contains_key(dataset) {
            return Err(missing(dataset));
        }
        let prefix = format!("{}@", dataset);
        let mut snapshots: Vec<DatasetInfo> = state
            .datasets
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| state.info(k))
            .collect();
        snapshots.sort_by_key(|s| s.created);
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// Targets

/// Snapshot of one fake target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    pub attributes: Vec<String>,
    pub luns: Vec<Lun>,
    pub portals: Vec<Portal>,
}

#[derive(Default)]
struct TargetsState {
    targets: BTreeMap<String, TargetState>,
    /// name -> device
    backstores: BTreeMap<String, String>,
    saves: usize,
    calls: Journal,
    failures: Failures,
}

/// In-memory iSCSI configuration.
#[derive(Default)]
pub struct FakeTargets {
    state: Mutex<TargetsState>,
}

impl FakeTargets {
    const READ_ONLY: &'static [&'static str] =
        &["list_targets", "list_backstores", "list_luns", "list_portals"];

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    failure_controls!();

    pub fn target(&self, name: &str) -> Option<TargetState> {
        self.state.lock().unwrap().targets.get(name).cloned()
    }

    /// Device bound to a backstore.
    pub fn backstore(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().backstores.get(name).cloned()
    }

    pub fn target_names(&self) -> Vec<String> {
        self.state.lock().unwrap().targets.keys().cloned().collect()
    }

    pub fn backstore_names(&self) -> Vec<String> {
        self.state.lock().unwrap().backstores.keys().cloned().collect()
    }

    pub fn saves(&self) -> usize {
        self.state.lock().unwrap().saves
    }

    /// Remove a target behind the workflow's back.
    pub fn drop_target(&self, name: &str) {
        self.state.lock().unwrap().targets.remove(name);
    }

    fn begin(&self, op: &str, args: &[&str]) -> Result<std::sync::MutexGuard<'_, TargetsState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, args.join(" ")).trim_end().to_string());
        state.failures.check(op, args.first().copied().unwrap_or(""))?;
        Ok(state)
    }
}

fn no_target(name: &str) -> Error {
    Error::not_found(format!("Target '{}' does not exist", name))
}

#[async_trait]
impl TargetService for FakeTargets {
    async fn list_targets(&self) -> Result<Vec<String>> {
        let state = self.begin("list_targets", &[])?;
        Ok(state.targets.keys().cloned().collect())
    }

    async fn create_target(&self, target: &str) -> Result<()> {
        let mut state = self.begin("create_target", &[target])?;
        if state.targets.contains_key(target) {
            return Err(Error::collaborator(format!("Target {} already exists", target)));
        }
        state.targets.insert(
            target.to_string(),
            TargetState {
                attributes: crate::targetcli::TPG_ATTRIBUTES
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn delete_target(&self, target: &str) -> Result<()> {
        let mut state = self.begin("delete_target", &[target])?;
        state
            .targets
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| no_target(target))
    }

    async fn list_backstores(&self) -> Result<Vec<String>> {
        let state = self.begin("list_backstores", &[])?;
        Ok(state.backstores.keys().cloned().collect())
    }

    async fn create_backstore(&self, name: &str, device: &str) -> Result<()> {
        let mut state = self.begin("create_backstore", &[name, device])?;
        if state.backstores.contains_key(name) {
            return Err(Error::collaborator(format!(
                "Storage object block/{} exists",
                name
            )));
        }
        state
            .backstores
            .insert(name.to_string(), device.to_string());
        Ok(())
    }

    async fn delete_backstore(&self, name: &str) -> Result<()> {
        let mut state = self.begin("delete_backstore", &[name])?;
        if state.backstores.remove(name).is_none() {
            return Err(Error::collaborator(format!(
                "No storage object named {}",
                name
            )));
        }
        for target in state.targets.values_mut() {
            target.luns.retain(|lun| lun.backstore != name);
        }
        Ok(())
    }

    async fn list_luns(&self, target: &str) -> Result<Vec<Lun>> {
        let state = self.begin("list_luns", &[target])?;
        state
            .targets
            .get(target)
            .map(|t| t.luns.clone())
            .ok_or_else(|| no_target(target))
    }

    async fn create_lun(&self, target: &str, backstore: &str) -> Result<()> {
        let mut state = self.begin("create_lun", &[target, backstore])?;
        if !state.backstores.contains_key(backstore) {
            return Err(Error::collaborator(format!(
                "No storage object named {}",
                backstore
            )));
        }
        let t = state
            .targets
            .get_mut(target)
            .ok_or_else(|| no_target(target))?;
        let name = (0..)
            .map(|n| format!("lun{}", n))
            .find(|n| !t.luns.iter().any(|lun| &lun.name == n))
            .unwrap_or_default();
        t.luns.push(Lun {
            name,
            backstore: backstore.to_string(),
        });
        Ok(())
    }

    async fn list_portals(&self, target: &str) -> Result<Vec<Portal>> {
        let state = self.begin("list_portals", &[target])?;
        state
            .targets
            .get(target)
            .map(|t| t.portals.clone())
            .ok_or_else(|| no_target(target))
    }

    async fn create_portal(&self, target: &str, portal: &Portal) -> Result<()> {
        let rendered = portal.to_string();
        let mut state = self.begin("create_portal", &[target, &rendered])?;
        let t = state
            .targets
            .get_mut(target)
            .ok_or_else(|| no_target(target))?;
        t.portals.push(portal.clone());
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let mut state = self.begin("save", &[])?;
        state.saves += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Leases

#[derive(Default)]
struct LeaseState {
    files: BTreeMap<PathBuf, BTreeMap<String, LeaseEntry>>,
    reloads: usize,
    calls: Journal,
    failures: Failures,
}

/// In-memory reservation files.
#[derive(Default)]
pub struct FakeLeases {
    state: Mutex<LeaseState>,
}

impl FakeLeases {
    const READ_ONLY: &'static [&'static str] = &["lookup"];

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    failure_controls!();

    pub fn entry(&self, path: &Path, host: &str) -> Option<LeaseEntry> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .and_then(|f| f.get(host))
            .cloned()
    }

    /// Every entry across all files.
    pub fn entries(&self) -> Vec<LeaseEntry> {
        self.state
            .lock()
            .unwrap()
            .files
            .values()
            .flat_map(|f| f.values().cloned())
            .collect()
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().unwrap().reloads
    }

    fn begin(&self, op: &str, arg: &str) -> Result<std::sync::MutexGuard<'_, LeaseState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, arg).trim_end().to_string());
        state.failures.check(op, arg)?;
        Ok(state)
    }
}

#[async_trait]
impl LeaseService for FakeLeases {
    async fn upsert(&self, path: &Path, entry: &LeaseEntry, replaces: Option<&str>) -> Result<()> {
        let mut state = self.begin("upsert", &entry.host)?;
        let file = state.files.entry(path.to_path_buf()).or_default();
        if let Some(old) = replaces {
            file.remove(old);
        }
        file.insert(entry.host.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, path: &Path, host: &str) -> Result<bool> {
        let mut state = self.begin("remove", host)?;
        Ok(state
            .files
            .get_mut(path)
            .and_then(|f| f.remove(host))
            .is_some())
    }

    async fn lookup(&self, path: &Path, host: &str) -> Result<Option<LeaseEntry>> {
        let state = self.begin("lookup", host)?;
        Ok(state.files.get(path).and_then(|f| f.get(host)).cloned())
    }

    async fn reload(&self) -> Result<()> {
        let mut state = self.begin("reload", "")?;
        state.reloads += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Network

#[derive(Default)]
struct NetworkState {
    statuses: HashMap<String, ClientStatus>,
    calls: Journal,
    failures: Failures,
}

/// Scripted reachability and recorded power actions.
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
}

impl FakeNetwork {
    const READ_ONLY: &'static [&'static str] = &["ping_status"];

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    failure_controls!();

    /// Status reported for `ip`; unknown addresses are offline.
    pub fn set_status(&self, ip: &str, status: ClientStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(ip.to_string(), status);
    }

    fn begin(&self, op: &str, arg: &str) -> Result<std::sync::MutexGuard<'_, NetworkState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, arg));
        state.failures.check(op, arg)?;
        Ok(state)
    }
}

#[async_trait]
impl NetworkControl for FakeNetwork {
    async fn ping_status(&self, ip: &str) -> ClientStatus {
        match self.begin("ping_status", ip) {
            Ok(_) if ip.is_empty() => ClientStatus::Unknown,
            Ok(state) => state
                .statuses
                .get(ip)
                .copied()
                .unwrap_or(ClientStatus::Offline),
            Err(_) => ClientStatus::Error,
        }
    }

    async fn wake(&self, mac: &str) -> Result<()> {
        self.begin("wake", mac).map(|_| ())
    }

    async fn reboot(&self, ip: &str) -> Result<()> {
        self.begin("reboot", ip).map(|_| ())
    }

    async fn shutdown(&self, ip: &str) -> Result<()> {
        self.begin("shutdown", ip).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_volumes_track_lineage() {
        let volumes = FakeVolumes::new();
        volumes.add("pool/master");
        volumes.snapshot("pool/master@base").await.unwrap();
        volumes
            .create_clone("pool/master@base", "pool/a-disk")
            .await
            .unwrap();

        assert_eq!(
            volumes.origin("pool/a-disk").await.unwrap().as_deref(),
            Some("pool/master@base")
        );
        assert!(volumes.destroy("pool/master@base").await.is_err());

        volumes.rename("pool/a-disk", "pool/b-disk").await.unwrap();
        assert!(!volumes.contains("pool/a-disk"));
        assert_eq!(volumes.origin_of("pool/b-disk").as_deref(), Some("pool/master@base"));

        volumes.destroy("pool/b-disk").await.unwrap();
        volumes.destroy("pool/master@base").await.unwrap();
        assert_eq!(volumes.names(), vec!["pool/master".to_string()]);
    }

    #[tokio::test]
    async fn test_promote_takes_earlier_snapshots_along() {
        let volumes = FakeVolumes::new();
        volumes.add("pool/master");
        volumes.add("pool/master@base");
        volumes.add("pool/master@a_base");
        volumes
            .create_clone("pool/master@a_base", "pool/a-disk")
            .await
            .unwrap();
        volumes.snapshot("pool/master@b_base").await.unwrap();
        volumes
            .create_clone("pool/master@b_base", "pool/b-disk")
            .await
            .unwrap();

        volumes.promote("pool/a-disk").await.unwrap();
        assert!(volumes.origin_of("pool/a-disk").is_none());
        assert!(volumes.contains("pool/a-disk@base"));
        assert!(volumes.contains("pool/a-disk@a_base"));
        assert!(!volumes.contains("pool/master@a_base"));
        assert_eq!(
            volumes.origin_of("pool/master").as_deref(),
            Some("pool/a-disk@a_base")
        );
        assert_eq!(
            volumes.origin_of("pool/b-disk").as_deref(),
            Some("pool/master@b_base")
        );
        assert!(volumes.destroy("pool/a-disk").await.is_err());

        volumes.promote("pool/master").await.unwrap();
        assert!(volumes.origin_of("pool/master").is_none());
        assert!(volumes.contains("pool/master@base"));
        assert_eq!(
            volumes.origin_of("pool/a-disk").as_deref(),
            Some("pool/master@a_base")
        );
        assert!(volumes.promote("pool/master").await.is_err());
        volumes.destroy("pool/a-disk").await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_once_recovers() {
        let targets = FakeTargets::new();
        targets.fail_once("create_target");

        assert!(targets.create_target("iqn.x:a").await.is_err());
        targets.create_target("iqn.x:a").await.unwrap();

        let calls = targets.sequenced_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].0 < calls[1].0);
    }

    #[tokio::test]
    async fn test_injected_failure_is_scoped_to_argument() {
        let volumes = FakeVolumes::new();
        volumes.fail_on_arg("exists", "pool/x");

        assert!(volumes.exists("pool/x").await.is_err());
        assert!(!volumes.exists("pool/y").await.unwrap());
        assert_eq!(volumes.calls(), vec!["exists pool/x", "exists pool/y"]);
        assert!(volumes.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_fake_targets_drop_luns_with_backstore() {
        let targets = FakeTargets::new();
        targets.create_target("iqn.x:a").await.unwrap();
        targets.create_backstore("block_a", "/dev/zvol/p/a").await.unwrap();
        targets.create_lun("iqn.x:a", "block_a").await.unwrap();
        assert_eq!(targets.target("iqn.x:a").unwrap().luns.len(), 1);

        targets.delete_backstore("block_a").await.unwrap();
        assert!(targets.target("iqn.x:a").unwrap().luns.is_empty());
    }
}
