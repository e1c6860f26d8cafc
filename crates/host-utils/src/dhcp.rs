//! Lease Service: host reservations in ISC dhcpd configuration files.
//!
//! Reservation files are shared by every client, so all reads and mutations
//! go through one process-wide lock. Writes replace the file by rename and
//! are protected by a backup that is restored if the write or its
//! verification fails.

use crate::executor::BoxedExecutor;
use async_trait::async_trait;
use nsboot_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Boot loader served to each vendor-class bucket: legacy BIOS PXE, 32-bit
/// UEFI, and everything else (64-bit UEFI).
const BOOT_FILES: [(&str, &str); 2] = [("00000", "ipxe.kpxe"), ("00006", "ipxe32.efi")];
const DEFAULT_BOOT_FILE: &str = "ipxe.efi";

/// One host reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    /// Host name, also used to locate the block
    pub host: String,
    pub mac: String,
    pub ip: String,
    /// `iscsi:<server>::::<target>`
    pub root_path: String,
}

impl LeaseEntry {
    pub fn new(
        host: impl Into<String>,
        mac: impl Into<String>,
        ip: impl Into<String>,
        server_ip: &str,
        target_name: &str,
    ) -> Self {
        Self {
            host: host.into(),
            mac: mac.into(),
            ip: ip.into(),
            root_path: format!("iscsi:{}::::{}", server_ip, target_name),
        }
    }

    /// Render the dhcpd `host` block.
    pub fn render(&self) -> String {
        let mut block = format!(
            "host {host} {{\n    hardware ethernet {mac};\n    fixed-address {ip};\n    option host-name \"{host}\";\n",
            host = self.host,
            mac = self.mac,
            ip = self.ip,
        );
        for (i, (class, file)) in BOOT_FILES.iter().enumerate() {
            let keyword = if i == 0 { "if" } else { "elsif" };
            block.push_str(&format!(
                "    {} substring (option vendor-class-identifier, 15, 5) = \"{}\" {{\n        filename \"{}\";\n    }}\n",
                keyword, class, file
            ));
        }
        block.push_str(&format!(
            "    else {{\n        filename \"{}\";\n    }}\n",
            DEFAULT_BOOT_FILE
        ));
        block.push_str(&format!("    option root-path \"{}\";\n}}\n", self.root_path));
        block
    }
}

fn declares_host(line: &str, host: &str) -> bool {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("host") {
        return false;
    }
    match tokens.next() {
        Some(name) if name == host => true,
        Some(name) => name.strip_suffix('{') == Some(host),
        None => false,
    }
}

/// Byte range of the `host <name> { ... }` block, found by balancing braces
/// from the declaring line. The range includes the trailing newline.
pub fn find_block(content: &str, host: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut start = None;
    for line in content.split_inclusive('\n') {
        if declares_host(line, host) {
            start = Some(offset);
            break;
        }
        offset += line.len();
    }
    let start = start?;

    let mut depth = 0usize;
    let mut opened = false;
    for (i, c) in content[start..].char_indices() {
        match c {
            '{' => {
                depth += 1;
                opened = true;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if opened && depth == 0 {
                    let mut end = start + i + 1;
                    if content[end..].starts_with('\n') {
                        end += 1;
                    }
                    return Some((start, end));
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove the block for `host`, returning the new content and whether a
/// block was found.
pub fn remove_block(content: &str, host: &str) -> (String, bool) {
    match find_block(content, host) {
        Some((start, end)) => {
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            (collapse_blank_lines(&out), true)
        }
        None => (content.to_string(), false),
    }
}

fn collapse_blank_lines(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0;
    for line in content.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Parse the block for `host`, if present.
pub fn parse_entry(content: &str, host: &str) -> Option<LeaseEntry> {
    let (start, end) = find_block(content, host)?;
    let block = &content[start..end];

    let value = |key: &str| {
        block.lines().find_map(|line| {
            line.trim()
                .strip_prefix(key)
                .map(|v| v.trim().trim_end_matches(';').trim().trim_matches('"').to_string())
        })
    };

    Some(LeaseEntry {
        host: host.to_string(),
        mac: value("hardware ethernet")?.to_ascii_uppercase(),
        ip: value("fixed-address")?,
        root_path: value("option root-path").unwrap_or_default(),
    })
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Write `entry` into the file at `path`, replacing the block named
    /// `replaces` (or `entry.host` when `None`).
    async fn upsert(&self, path: &Path, entry: &LeaseEntry, replaces: Option<&str>) -> Result<()>;

    /// Remove the block for `host`. Returns whether one was present.
    async fn remove(&self, path: &Path, host: &str) -> Result<bool>;

    async fn lookup(&self, path: &Path, host: &str) -> Result<Option<LeaseEntry>>;

    /// Make the DHCP server pick up configuration changes.
    async fn reload(&self) -> Result<()>;
}

/// [`LeaseService`] writing ISC dhcpd configuration and restarting the
/// daemon through systemd.
pub struct DhcpdConfig {
    executor: BoxedExecutor,
    service: String,
    prune_empty_files: bool,
    lock: Mutex<()>,
}

impl DhcpdConfig {
    pub fn new(executor: BoxedExecutor, service: impl Into<String>) -> Self {
        Self {
            executor,
            service: service.into(),
            prune_empty_files: false,
            lock: Mutex::new(()),
        }
    }

    /// Delete a reservation file once its last block is removed. Used when
    /// each client has its own include file.
    pub fn with_prune_empty_files(mut self, prune: bool) -> Self {
        self.prune_empty_files = prune;
        self
    }

    pub fn into_service(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn read(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::collaborator(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Replace the file at `path` with `content` through a rename, so readers
    /// and the daemon only ever see the old or the new file.
    async fn replace(path: &Path, content: &str) -> std::io::Result<()> {
        let tmp = Self::sibling_path(path, ".tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Apply `mutate` to the file content under backup protection.
    async fn guarded_write<F, V>(&self, path: &Path, mutate: F, verify: V) -> Result<bool>
    where
        F: FnOnce(&str) -> Option<String> + Send,
        V: Fn(&str) -> Result<()> + Send,
    {
        let _guard = self.lock.lock().await;

        let original = Self::read(path).await?;
        let current = original.as_deref().unwrap_or("");
        let Some(updated) = mutate(current) else {
            return Ok(false);
        };

        let backup = Self::sibling_path(path, ".bak");
        if let Some(content) = &original {
            tokio::fs::write(&backup, content).await.map_err(|e| {
                Error::collaborator(format!("Failed to back up {}: {}", path.display(), e))
            })?;
        }

        let result = self.write_and_verify(path, &updated, &verify).await;
        if let Err(err) = &result {
            error!(path = %path.display(), error = %err, "lease write failed, restoring backup");
            let restored = match &original {
                Some(content) => Self::replace(path, content).await,
                None => match tokio::fs::remove_file(path).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                error!(path = %path.display(), error = %e, "failed to restore lease file");
            }
        }

        if original.is_some() {
            if let Err(e) = tokio::fs::remove_file(&backup).await {
                warn!(path = %backup.display(), error = %e, "failed to remove lease backup");
            }
        }
        result.map(|_| true)
    }

    async fn write_and_verify<V>(&self, path: &Path, content: &str, verify: &V) -> Result<()>
    where
        V: Fn(&str) -> Result<()> + Send,
    {
        if self.prune_empty_files && content.trim().is_empty() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::collaborator(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Self::replace(path, content).await.map_err(|e| {
            Error::collaborator(format!("Failed to write {}: {}", path.display(), e))
        })?;

        let written = Self::read(path).await?.unwrap_or_default();
        verify(&written)
    }
}

#[async_trait]
impl LeaseService for DhcpdConfig {
    async fn upsert(&self, path: &Path, entry: &LeaseEntry, replaces: Option<&str>) -> Result<()> {
        info!(path = %path.display(), host = %entry.host, mac = %entry.mac, ip = %entry.ip, "writing lease reservation");
        let old_host = replaces.unwrap_or(&entry.host).to_string();
        let block = entry.render();

        self.guarded_write(
            path,
            |current| {
                let (mut content, _) = remove_block(current, &old_host);
                if old_host != entry.host {
                    content = remove_block(&content, &entry.host).0;
                }
                let content = content.trim_end();
                Some(if content.is_empty() {
                    block.clone()
                } else {
                    format!("{}\n\n{}", content, block)
                })
            },
            |written| match parse_entry(written, &entry.host) {
                Some(found) if found.mac == entry.mac && found.ip == entry.ip => Ok(()),
                Some(found) => Err(Error::collaborator(format!(
                    "Lease verification failed for {}: found {} / {}, expected {} / {}",
                    entry.host, found.mac, found.ip, entry.mac, entry.ip
                ))),
                None => Err(Error::collaborator(format!(
                    "Lease verification failed: no block for {} after write",
                    entry.host
                ))),
            },
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, path: &Path, host: &str) -> Result<bool> {
        let removed = self
            .guarded_write(
                path,
                |current| {
                    let (content, found) = remove_block(current, host);
                    found.then_some(content)
                },
                |written| {
                    if find_block(written, host).is_some() {
                        Err(Error::collaborator(format!(
                            "Lease block for {} still present after removal",
                            host
                        )))
                    } else {
                        Ok(())
                    }
                },
            )
            .await?;
        if removed {
            info!(path = %path.display(), host, "removed lease reservation");
        } else {
            debug!(path = %path.display(), host, "no lease reservation to remove");
        }
        Ok(removed)
    }

    async fn lookup(&self, path: &Path, host: &str) -> Result<Option<LeaseEntry>> {
        let _guard = self.lock.lock().await;
        let content = Self::read(path).await?;
        Ok(content.and_then(|c| parse_entry(&c, host)))
    }

    async fn reload(&self) -> Result<()> {
        info!(service = %self.service, "restarting DHCP service");
        self.executor
            .execute("systemctl", &["restart", &self.service], true)
            .await?;
        Ok(())
    }
}
