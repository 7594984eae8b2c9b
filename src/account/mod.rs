//! Account pool, selection strategies, persistent storage, and the hybrid
//! health/token-bucket trackers.

pub mod health;
pub mod pool;
pub mod store;
pub mod types;

pub use pool::{Pool, SelectedAccount};
pub use store::PersistentAccountStore;
pub use types::{Account, CooldownReason, LastSwitchReason, Plan, StorageDocument};
