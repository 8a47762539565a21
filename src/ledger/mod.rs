pub mod attribution;
pub mod lock;
pub mod models;
pub mod repository;
pub mod slug;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use models::*;
pub use repository::LedgerRepository;
pub use slug::PoolSlug;
pub use store::{LedgerStore, LedgerTx};
