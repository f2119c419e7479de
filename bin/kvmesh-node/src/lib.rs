//! kvmesh node
//!
//! Composition of one cluster member. Every component is built by the caller
//! and handed to [`Node`]; nothing is looked up at runtime.
//!
//! - [`node`]: command dispatch, request forwarding, backup replication,
//!   start and shutdown ordering
//! - [`server`]: the axum HTTP surface (system messages, data API, health,
//!   metrics)
//! - [`client`]: the reqwest transport other members are reached through

pub mod client;
pub mod node;
pub mod server;

pub use client::HttpTransport;
pub use node::Node;
