mod clock;
mod cloud_provider;
mod snapshot_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cloud_provider::CloudProvider;
pub use snapshot_store::{RegistrySnapshot, SnapshotStore};
