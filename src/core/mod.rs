//! Core sync pipeline: fingerprinting, the anti-loop ledger, both
//! directional pipelines, and the scheduler that drives them.

pub mod consumer;
pub mod fingerprint;
pub mod ledger;
pub mod mapping;
pub mod poller;
pub mod scheduler;
pub mod snapshot;

pub use consumer::QueueConsumer;
pub use ledger::Ledger;
pub use mapping::{FieldMap, Mapper};
pub use poller::PairPoller;
pub use snapshot::{SnapEntry, Snapshot, SnapshotStore};
