//! Client provisioning for the network boot manager.
//!
//! The [`Provisioner`] owns the client lifecycle: each operation drives the
//! volume manager, the iSCSI target service and the DHCP lease service, and
//! records the result in a [`ClientStore`].

pub mod edit;
pub mod images;
pub mod locks;
pub mod registry;
pub mod saga;
mod super_client;
pub mod target;
pub mod workflow;

pub use edit::{classify, EditPlan};
pub use images::MASTER_SUFFIX;
pub use locks::{KeyedLocks, Reservations};
pub use registry::{open_store, ClientStore, JsonFileStore, RedisStore};
pub use workflow::{Collaborators, ProvisionState, Provisioner, ProvisionerConfig};
