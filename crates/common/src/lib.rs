pub mod error;
pub mod models;
pub mod naming;
pub mod validation;

pub use error::{Error, Result};
pub use models::{
    Client, ClientStatus, ClientView, ControlRequest, CreateClientRequest, CreateClientResponse,
    CreateSnapshotRequest, EditClientRequest, MasterImage, MessageResponse, SnapshotInfo,
    VolumeSource,
};
pub use naming::{device_path, display_name, LeaseLayout, NamingConfig, ResourceNamer, ResourceNames};
