//! Reference implementation of the shared counting service's storage.
//!
//! Proxies only depend on the gRPC contract; this store exists so that
//! contract has a runnable peer.

mod backend;
mod counter;
mod store;

pub use backend::CounterBackend;
pub use counter::FixedWindowCounter;
pub use store::{CounterKey, CounterStore};
