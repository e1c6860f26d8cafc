//! Data models shared by the workflow and the HTTP service

use crate::naming::ResourceNames;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a client's disk was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeSource {
    /// Cloned from an explicitly requested checkpoint
    Snapshot { name: String },

    /// Cloned from a checkpoint taken from the master for this client
    ClientCheckpoint { name: String },

    /// No private copy; the master volume is exported directly
    Master { dataset: String },
}

impl VolumeSource {
    /// The checkpoint the client's clone descends from, if it has a clone.
    pub fn origin(&self) -> Option<&str> {
        match self {
            VolumeSource::Snapshot { name } | VolumeSource::ClientCheckpoint { name } => {
                Some(name)
            }
            VolumeSource::Master { .. } => None,
        }
    }
}

/// A diskless client record, as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// Normalized, lower-case unique identifier
    pub id: String,

    /// Host name used in the lease reservation
    pub name: String,

    /// Upper-case, colon-separated MAC address
    pub mac: String,

    /// Dotted-quad IPv4 address
    pub ip: String,

    /// Master image this client is based on
    pub master: String,

    /// Checkpoint explicitly requested at create/edit time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    /// Resolved clone source
    pub source: VolumeSource,

    /// Derived names; never set independently of `id`
    pub resources: ResourceNames,

    /// Block device exported through the backing store
    pub device_path: String,

    pub created_at: DateTime<Utc>,

    pub last_modified: DateTime<Utc>,
}

impl Client {
    /// Whether the client owns a private clone (as opposed to exporting the
    /// master directly).
    pub fn has_clone(&self) -> bool {
        self.source.origin().is_some()
    }
}

/// Reachability of a client, recomputed on every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Online,
    Offline,
    Unknown,
    Error,
}

/// A client record enriched with live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientView {
    #[serde(flatten)]
    pub client: Client,

    pub status: ClientStatus,

    /// True when the clone has no origin (promoted, a.k.a. Super Client)
    pub is_super_client: bool,
}

/// Request to create a client
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub master: String,
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// Request to edit a client. Absent fields keep their current value; an
/// empty `snapshot` clears the explicit checkpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditClientRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// Request for a control action
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub action: String,

    #[serde(default, rename = "makeSuper", alias = "make_super")]
    pub make_super: Option<bool>,
}

/// Response from a successful create
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateClientResponse {
    pub message: String,
    pub assigned_ip: String,
}

/// Generic success response
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A master image and the checkpoints clients can be cloned from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterImage {
    /// Reference accepted as `master` when creating or editing a client
    pub name: String,
    pub dataset: String,
    /// Oldest first
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Full `dataset@name` reference
    pub name: String,
    pub created: DateTime<Utc>,
    pub used_bytes: u64,
}

/// Request to take a checkpoint of a master image
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> Client {
        let now = Utc::now();
        Client {
            id: "lab01".to_string(),
            name: "LAB01".to_string(),
            mac: "AA:BB:CC:DD:EE:01".to_string(),
            ip: "192.168.1.101".to_string(),
            master: "win11-master".to_string(),
            snapshot: None,
            source: VolumeSource::ClientCheckpoint {
                name: "nsboot0/win11-master@lab01_base".to_string(),
            },
            resources: ResourceNames {
                clone_path: "nsboot0/lab01-disk".to_string(),
                target_name: "iqn.2025-04.com.nsboot:lab01".to_string(),
                backing_store_name: "block_lab01".to_string(),
                lease_config_path: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            },
            device_path: "/dev/zvol/nsboot0/lab01-disk".to_string(),
            created_at: now,
            last_modified: now,
        }
    }

    #[test]
    fn test_view_flattens_client() {
        let view = ClientView {
            client: sample(),
            status: ClientStatus::Offline,
            is_super_client: false,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "lab01");
        assert_eq!(json["status"], "Offline");
        assert_eq!(json["resources"]["clone_path"], "nsboot0/lab01-disk");
        assert_eq!(json["source"]["kind"], "client_checkpoint");
        assert!(json.get("snapshot").is_none());
    }

    #[test]
    fn test_control_request_accepts_camel_case() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"action":"toggleSuper","makeSuper":true}"#).unwrap();
        assert_eq!(req.make_super, Some(true));

        let req: ControlRequest = serde_json::from_str(r#"{"action":"wake"}"#).unwrap();
        assert_eq!(req.make_super, None);
    }

    #[test]
    fn test_master_source_has_no_clone() {
        let mut client = sample();
        assert!(client.has_clone());
        client.source = VolumeSource::Master {
            dataset: "nsboot0/win11-master".to_string(),
        };
        assert!(!client.has_clone());
    }
}
