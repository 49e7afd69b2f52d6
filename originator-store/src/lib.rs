//! Durable, transactional storage for queued outbound messages.
//!
//! One serialized file per message entity under the store directory, plus a
//! meta record for the singleton storage parent and the ID allocator.
//! Mutations go through closure transactions; batched iteration hands each
//! batch to a continuation after its transaction has committed.

pub mod error;
mod store;
mod types;

pub use error::{Result, StoreError};
pub use store::{ReadTx, Store, Tx};
pub use types::StoreConfig;
