//! kvmesh Placement - partition ownership and placement
//!
//! This crate holds the per-kind partition tables that answer "who owns
//! partition P" on every request, and the pluggable [`Placement`] function
//! the coordinator uses to compute the desired owners.
//!
//! # Algorithms
//!
//! ## HRW (default)
//! Rendezvous hashing: every member scores `xxh64(partition, member_id)` and
//! the highest scores win. Adding or removing one member only remaps the
//! partitions that member wins or loses.

pub mod hrw;
pub mod partition;

pub use hrw::{Assignment, HrwPlacement, Placement};
pub use partition::{Partition, PartitionTable};
