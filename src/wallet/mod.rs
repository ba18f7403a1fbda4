pub mod listeners;
pub mod service;
pub mod store;
pub mod types;

pub use listeners::{ListenerRegistry, TransactionListener};
pub use service::{ServiceConfig, WalletSyncService, best_height_key};
pub use store::{Cacher, Datastore, FileCache, MemoryCache, MemoryDatastore, SignedMessageDecoder};
pub use types::*;
