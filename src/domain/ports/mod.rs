mod remote_store;
mod replica_store;
mod settings_store;
mod storage_quota;

pub use remote_store::{DocumentStream, RemoteStore};
pub use replica_store::{ClearScope, ReplicaStore};
pub use settings_store::SettingsStore;
pub use storage_quota::StorageQuota;
