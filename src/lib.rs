//! Chain synchronization core of a multi-coin wallet.
//!
//! [`indexer`] talks to a blockbook-style indexer over REST and a socket.io push
//! channel. [`wallet`] keeps one coin's wallet state in step with the chain
//! through that client.

pub mod config;
pub mod indexer;
pub mod wallet;
