//! Protobuf message definitions

use kvmesh_common::{PartitionKind, Route};
use std::collections::HashMap;

/// Partition kind on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Kind {
    Primary = 0,
    Backup = 1,
}

impl From<PartitionKind> for Kind {
    fn from(kind: PartitionKind) -> Self {
        match kind {
            PartitionKind::Primary => Self::Primary,
            PartitionKind::Backup => Self::Backup,
        }
    }
}

impl From<Kind> for PartitionKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Primary => Self::Primary,
            Kind::Backup => Self::Backup,
        }
    }
}

/// Decode a wire kind, rejecting unknown values
pub fn partition_kind(value: i32) -> kvmesh_common::Result<PartitionKind> {
    Kind::try_from(value)
        .map(PartitionKind::from)
        .map_err(|_| kvmesh_common::Error::invalid_argument(format!("unknown partition kind {value}")))
}

/// Decode a prost payload, mapping failures to [`kvmesh_common::Error::Deserialization`]
pub fn decode_message<T: ::prost::Message + Default>(buf: &[u8]) -> kvmesh_common::Result<T> {
    T::decode(buf).map_err(|e| kvmesh_common::Error::Deserialization(e.to_string()))
}

/// Generic internal request: operation name plus its encoded payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemMessage {
    #[prost(string, tag = "1")]
    pub op: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Error payload carried by a failed [`SystemResponse`]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorPayload {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Reply to a [`SystemMessage`]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ErrorPayload>,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

/// Transfer unit for one fragment migration
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DmapBox {
    #[prost(uint64, tag = "1")]
    pub part_id: u64,
    #[prost(enumeration = "Kind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub name: String,
    /// Storage engine that produced `payload`
    #[prost(string, tag = "4")]
    pub engine: String,
    /// Snapshot format version of that engine
    #[prost(uint32, tag = "5")]
    pub engine_version: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
    /// Key hash -> last access (unix nanos)
    #[prost(map = "uint64, int64", tag = "7")]
    pub access_log: HashMap<u64, i64>,
}

/// One routing table row
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteEntry {
    #[prost(string, repeated, tag = "1")]
    pub primary_owners: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub replica_owners: Vec<String>,
}

impl From<&Route> for RouteEntry {
    fn from(route: &Route) -> Self {
        Self {
            primary_owners: route.primary_owners.clone(),
            replica_owners: route.replica_owners.clone(),
        }
    }
}

impl From<RouteEntry> for Route {
    fn from(entry: RouteEntry) -> Self {
        Self {
            primary_owners: entry.primary_owners,
            replica_owners: entry.replica_owners,
        }
    }
}

/// Routing table broadcast by the coordinator
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutingUpdate {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(string, tag = "2")]
    pub coordinator: String,
    #[prost(string, repeated, tag = "3")]
    pub members: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub routes: Vec<RouteEntry>,
}

/// Acknowledgement of a routing broadcast
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutingUpdateAck {
    #[prost(string, tag = "1")]
    pub member: String,
    /// Version the receiver holds after processing the update
    #[prost(uint64, tag = "2")]
    pub version: u64,
    /// Whether the update replaced the receiver's view
    #[prost(bool, tag = "3")]
    pub accepted: bool,
}

/// Full routing table query response
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutingTableResponse {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(message, repeated, tag = "2")]
    pub routes: Vec<RouteEntry>,
}

/// Number of keys a member holds for a partition
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LengthOfPartRequest {
    #[prost(uint64, tag = "1")]
    pub part_id: u64,
    #[prost(enumeration = "Kind", tag = "2")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LengthOfPartResponse {
    #[prost(uint64, tag = "1")]
    pub length: u64,
}

/// Key/value operation forwarded to the partition owner
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataRequest {
    #[prost(string, tag = "1")]
    pub dmap: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
    /// Write time (unix nanos), 0 lets the owner stamp it
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    /// Expiry (unix millis), 0 for none
    #[prost(int64, tag = "5")]
    pub ttl: i64,
    /// `BACKUP` when the primary owner replicates the operation
    #[prost(enumeration = "Kind", tag = "6")]
    pub kind: i32,
    /// Set by a member redirecting the request; the receiver serves it locally
    #[prost(bool, tag = "7")]
    pub forwarded: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(int64, tag = "3")]
    pub ttl: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanRequest {
    #[prost(string, tag = "1")]
    pub dmap: String,
    #[prost(uint64, tag = "2")]
    pub part_id: u64,
    #[prost(enumeration = "Kind", tag = "3")]
    pub kind: i32,
    #[prost(uint64, tag = "4")]
    pub cursor: u64,
    #[prost(uint32, tag = "5")]
    pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanResponse {
    /// Next cursor, 0 when the scan is complete
    #[prost(uint64, tag = "1")]
    pub cursor: u64,
    #[prost(string, repeated, tag = "2")]
    pub keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_kind_conversion() {
        assert_eq!(Kind::from(PartitionKind::Backup), Kind::Backup);
        assert_eq!(partition_kind(0).unwrap(), PartitionKind::Primary);
        assert!(partition_kind(7).is_err());
    }

    #[test]
    fn test_system_response_decode() {
        let resp = SystemResponse {
            status: "ERROR".into(),
            error: Some(ErrorPayload {
                code: "CLUSTER_QUORUM".into(),
                message: String::new(),
            }),
            value: Vec::new(),
        };
        let bytes = resp.encode_to_vec();
        let back = SystemResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, resp);
    }
}
