//! Block-Target Service: iSCSI targets, block backstores, LUNs and portals
//! managed through `targetcli`.
//!
//! `targetcli ls` prints a tree such as
//!
//! ```text
//! o- luns ............................................ [LUNs: 1]
//!   o- lun0 .. [block/block_lab01 (/dev/zvol/nsboot0/lab01-disk) (default_tg_pt_gp)]
//! ```
//!
//! The parsing below reduces each node to its exact name and the bracketed
//! detail, so callers compare whole names and never substrings.

use crate::executor::BoxedExecutor;
use async_trait::async_trait;
use nsboot_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

const TARGETCLI: &str = "targetcli";

/// Attributes applied to the first TPG of every new target: open access for
/// any initiator, writable, no CHAP.
pub const TPG_ATTRIBUTES: [&str; 4] = [
    "generate_node_acls=1",
    "cache_dynamic_acls=1",
    "demo_mode_write_protect=0",
    "authentication=0",
];

/// A network portal, e.g. `0.0.0.0:3260`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub ip: String,
    pub port: u16,
}

impl Portal {
    /// Listen on every address on the standard iSCSI port.
    pub fn catch_all() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 3260,
        }
    }
}

impl std::fmt::Display for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A LUN and the backstore it exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lun {
    pub name: String,
    pub backstore: String,
}

#[async_trait]
pub trait TargetService: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<String>>;

    /// Create a target with its default TPG configured by [`TPG_ATTRIBUTES`].
    async fn create_target(&self, target: &str) -> Result<()>;

    async fn delete_target(&self, target: &str) -> Result<()>;

    /// Names of all block backstores.
    async fn list_backstores(&self) -> Result<Vec<String>>;

    async fn create_backstore(&self, name: &str, device: &str) -> Result<()>;

    async fn delete_backstore(&self, name: &str) -> Result<()>;

    async fn list_luns(&self, target: &str) -> Result<Vec<Lun>>;

    async fn create_lun(&self, target: &str, backstore: &str) -> Result<()>;

    async fn list_portals(&self, target: &str) -> Result<Vec<Portal>>;

    async fn create_portal(&self, target: &str, portal: &Portal) -> Result<()>;

    /// Persist the running configuration.
    async fn save(&self) -> Result<()>;
}

/// One node of a `targetcli ls` tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub detail: String,
}

/// Parse `targetcli <path> ls depth=1` output into its child nodes. The first
/// node is the listed path itself and is skipped.
pub fn parse_children(output: &str) -> Vec<Node> {
    output
        .lines()
        .filter_map(parse_node)
        .skip(1)
        .collect()
}

fn parse_node(line: &str) -> Option<Node> {
    let rest = line.trim_start().strip_prefix("o- ")?;
    let name = rest.split_whitespace().next()?.to_string();
    let detail = match (rest.find('['), rest.rfind(']')) {
        (Some(start), Some(end)) if start < end => rest[start + 1..end].to_string(),
        _ => String::new(),
    };
    Some(Node { name, detail })
}

/// Extract the backstore name from a LUN detail such as
/// `block/block_lab01 (/dev/zvol/...) (default_tg_pt_gp)`.
fn lun_backstore(detail: &str) -> Option<String> {
    let first = detail.split_whitespace().next()?;
    let (_, name) = first.split_once('/')?;
    Some(name.to_string())
}

fn parse_portal(name: &str) -> Option<Portal> {
    let (ip, port) = name.rsplit_once(':')?;
    Some(Portal {
        ip: ip.to_string(),
        port: port.parse().ok()?,
    })
}

/// [`TargetService`] backed by the `targetcli` shell.
pub struct TargetCli {
    executor: BoxedExecutor,
}

impl TargetCli {
    pub fn new(executor: BoxedExecutor) -> Arc<Self> {
        Arc::new(Self { executor })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.executor.execute(TARGETCLI, args, true).await?;
        Ok(output.stdout)
    }

    async fn children(&self, path: &str) -> Result<Vec<Node>> {
        let stdout = self.run(&[path, "ls", "depth=1"]).await?;
        let nodes = parse_children(&stdout);
        debug!(path, count = nodes.len(), "listed targetcli nodes");
        Ok(nodes)
    }
}

fn tpg_path(target: &str) -> String {
    format!("/iscsi/{}/tpg1", target)
}

#[async_trait]
impl TargetService for TargetCli {
    async fn list_targets(&self) -> Result<Vec<String>> {
        Ok(self
            .children("/iscsi")
            .await?
            .into_iter()
            .map(|n| n.name)
            .filter(|n| n.starts_with("iqn."))
            .collect())
    }

    async fn create_target(&self, target: &str) -> Result<()> {
        info!(target, "creating iSCSI target");
        self.run(&["/iscsi", "create", target]).await?;

        let tpg = tpg_path(target);
        let mut args = vec![tpg.as_str(), "set", "attribute"];
        args.extend(TPG_ATTRIBUTES);
        self.run(&args).await?;
        Ok(())
    }

    async fn delete_target(&self, target: &str) -> Result<()> {
        info!(target, "deleting iSCSI target");
        self.run(&["/iscsi", "delete", target]).await.map_err(|e| {
            if e.to_string().contains("No such") {
                Error::not_found(format!("Target '{}' does not exist", target))
            } else {
                e
            }
        })?;
        Ok(())
    }

    async fn list_backstores(&self) -> Result<Vec<String>> {
        Ok(self
            .children("/backstores/block")
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect())
    }

    async fn create_backstore(&self, name: &str, device: &str) -> Result<()> {
        info!(name, device, "creating block backstore");
        let name_arg = format!("name={}", name);
        let dev_arg = format!("dev={}", device);
        self.run(&["/backstores/block", "create", &name_arg, &dev_arg])
            .await?;
        Ok(())
    }

    async fn delete_backstore(&self, name: &str) -> Result<()> {
        info!(name, "deleting block backstore");
        self.run(&["/backstores/block", "delete", name]).await?;
        Ok(())
    }

    async fn list_luns(&self, target: &str) -> Result<Vec<Lun>> {
        let path = format!("{}/luns", tpg_path(target));
        Ok(self
            .children(&path)
            .await?
            .into_iter()
            .filter_map(|n| {
                lun_backstore(&n.detail).map(|backstore| Lun {
                    name: n.name,
                    backstore,
                })
            })
            .collect())
    }

    async fn create_lun(&self, target: &str, backstore: &str) -> Result<()> {
        info!(target, backstore, "creating LUN");
        let path = format!("{}/luns", tpg_path(target));
        let storage = format!("/backstores/block/{}", backstore);
        self.run(&[&path, "create", &storage]).await?;
        Ok(())
    }

    async fn list_portals(&self, target: &str) -> Result<Vec<Portal>> {
        let path = format!("{}/portals", tpg_path(target));
        Ok(self
            .children(&path)
            .await?
            .iter()
            .filter_map(|n| parse_portal(&n.name))
            .collect())
    }

    async fn create_portal(&self, target: &str, portal: &Portal) -> Result<()> {
        info!(target, %portal, "creating portal");
        let path = format!("{}/portals", tpg_path(target));
        let port = portal.port.to_string();
        self.run(&[&path, "create", &portal.ip, &port]).await?;
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        self.run(&["saveconfig"]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::fakes::{FakeExecutor, Invocation};

    const BACKSTORES: &str = "\
o- block ............................................ [Storage Objects: 2]
  o- block_lab1 ........ [/dev/zvol/nsboot0/lab1-disk (40.0GiB) write-thru activated]
  | o- alua ............................................... [ALUA Groups: 1]
  o- block_lab10 ...... [/dev/zvol/nsboot0/lab10-disk (40.0GiB) write-thru activated]
";

    const LUNS: &str = "\
o- luns ........................................................ [LUNs: 1]
  o- lun0 ...... [block/block_lab01 (/dev/zvol/nsboot0/lab01-disk) (default_tg_pt_gp)]
";

    const PORTALS: &str = "\
o- portals .................................................. [Portals: 1]
  o- 0.0.0.0:3260 ................................................... [OK]
";

    #[test]
    fn test_parse_children_uses_exact_names() {
        let names: Vec<String> = parse_children(BACKSTORES)
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert!(names.contains(&"block_lab1".to_string()));
        assert!(names.contains(&"block_lab10".to_string()));
        assert!(!names.contains(&"block".to_string()));
    }

    #[test]
    fn test_lun_backstore() {
        let nodes = parse_children(LUNS);
        assert_eq!(nodes.len(), 1);
        assert_eq!(lun_backstore(&nodes[0].detail).as_deref(), Some("block_lab01"));
    }

    #[test]
    fn test_parse_portal() {
        let nodes = parse_children(PORTALS);
        assert_eq!(parse_portal(&nodes[0].name), Some(Portal::catch_all()));
        assert_eq!(Portal::catch_all().to_string(), "0.0.0.0:3260");
    }

    #[tokio::test]
    async fn test_create_target_sets_tpg_attributes() {
        let executor = FakeExecutor::new();
        let cli = TargetCli::new(executor.clone().as_executor());

        cli.create_target("iqn.2025-04.com.nsboot:lab01").await.unwrap();
        assert_eq!(
            executor.commands(),
            vec![
                "targetcli /iscsi create iqn.2025-04.com.nsboot:lab01".to_string(),
                "targetcli /iscsi/iqn.2025-04.com.nsboot:lab01/tpg1 set attribute \
                 generate_node_acls=1 cache_dynamic_acls=1 demo_mode_write_protect=0 \
                 authentication=0"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_luns_through_executor() {
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|_: &Invocation| CommandOutput {
            status: Some(0),
            stdout: LUNS.to_string(),
            stderr: String::new(),
        }));
        let cli = TargetCli::new(executor.as_executor());

        let luns = cli.list_luns("iqn.2025-04.com.nsboot:lab01").await.unwrap();
        assert_eq!(
            luns,
            vec![Lun {
                name: "lun0".to_string(),
                backstore: "block_lab01".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_target_is_not_found() {
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|_: &Invocation| CommandOutput {
            status: Some(1),
            stdout: "No such Target in configfs: /sys/kernel/config/target/iscsi/iqn.x"
                .to_string(),
            stderr: String::new(),
        }));
        let cli = TargetCli::new(executor.as_executor());

        let err = cli.delete_target("iqn.x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
