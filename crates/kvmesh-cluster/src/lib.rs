//! kvmesh Cluster - membership, routing and transport
//!
//! This crate provides:
//! - [`RoutingTable`]: the versioned partition ownership view, membership
//!   bookkeeping, the quorum and bootstrap guards and the coordinator's
//!   broadcast loop
//! - [`Transport`]: the member-to-member request seam, with the in-process
//!   [`LocalTransport`] used by multi-node tests
//! - [`LockManager`]: named async locks with scoped guards
//! - [`TaskGroup`]: tracked, cancellable background tasks

pub mod locker;
pub mod routing;
pub mod tasks;
pub mod transport;

pub use locker::{LockGuard, LockManager};
pub use routing::{RoutingSnapshot, RoutingTable};
pub use tasks::TaskGroup;
pub use transport::{LocalTransport, MessageHandler, Transport};
