mod manager;
mod transaction;

pub(crate) use manager::StorageManager;
pub(crate) use transaction::StorageTransaction;
