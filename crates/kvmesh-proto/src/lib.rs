//! kvmesh Protocol - member-to-member wire messages
//!
//! Messages are protobuf encoded with prost. Every internal request travels
//! as a [`SystemMessage`] carrying an operation name and an operation
//! specific payload; every reply is a [`SystemResponse`].
//!
//! The transfer unit used to migrate a fragment ([`DmapBox`]) is wrapped in
//! a versioned envelope (see [`envelope`]) so that peers running a different
//! snapshot format reject it instead of misreading it.

pub mod command;
pub mod envelope;
pub mod messages;

pub use command::{Operation, STATUS_ERROR, STATUS_OK};
pub use envelope::{BOX_FORMAT_VERSION, BOX_MAGIC, decode_box, encode_box};
pub use messages::*;
