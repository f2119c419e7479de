//! kvmesh DMap - distributed maps on top of partitioned fragments
//!
//! A dmap is a named keyspace. On each member it is realized as one
//! [`Fragment`] per `(partition, kind)` it has data in. This crate provides:
//! - [`DMapService`]: local put/get/delete/scan, lazy dmap creation and
//!   background compaction
//! - the transfer protocol moving a fragment between members and merging it
//!   into whatever the receiver already holds
//! - [`VersionComparator`]: the rule picking the winner when two versions of
//!   a key meet
//! - [`Balancer`]: the loop moving fragments to their desired owners

pub mod balancer;
pub mod fragment;
pub mod merge;
pub mod service;
pub mod transfer;

#[cfg(test)]
mod test_util;

pub use balancer::{Balancer, BalancerStats};
pub use fragment::{Fragment, FragmentKey, FragmentRegistry, FragmentState};
pub use merge::{LastWriteWins, VersionComparator};
pub use service::DMapService;
