//! Command names and system message helpers

use crate::messages::{ErrorPayload, SystemMessage, SystemResponse};
use kvmesh_common::{Error, Result};
use std::fmt;

/// Status carried by a successful response
pub const STATUS_OK: &str = "OK";

/// Status carried by a failed response
pub const STATUS_ERROR: &str = "ERROR";

/// Operations a node serves over the system-message channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    MoveFragment,
    UpdateRouting,
    LengthOfPartition,
    ClusterRoutingTable,
    Put,
    Get,
    Delete,
    Scan,
    Ping,
}

impl Operation {
    pub const ALL: [Self; 9] = [
        Self::MoveFragment,
        Self::UpdateRouting,
        Self::LengthOfPartition,
        Self::ClusterRoutingTable,
        Self::Put,
        Self::Get,
        Self::Delete,
        Self::Scan,
        Self::Ping,
    ];

    /// Wire name of the operation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MoveFragment => "internal.movefragment",
            Self::UpdateRouting => "internal.updaterouting",
            Self::LengthOfPartition => "internal.lengthofpart",
            Self::ClusterRoutingTable => "cluster.routingtable",
            Self::Put => "dm.put",
            Self::Get => "dm.get",
            Self::Delete => "dm.del",
            Self::Scan => "dm.scan",
            Self::Ping => "ping",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Whether the operation reads or writes fragment data and therefore
    /// must pass the quorum and bootstrap checks first
    #[must_use]
    pub const fn touches_data(&self) -> bool {
        matches!(
            self,
            Self::MoveFragment
                | Self::LengthOfPartition
                | Self::Put
                | Self::Get
                | Self::Delete
                | Self::Scan
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SystemMessage {
    /// Build a request for an operation
    #[must_use]
    pub fn new(op: Operation, value: Vec<u8>) -> Self {
        Self {
            op: op.as_str().to_string(),
            value,
        }
    }

    /// Resolve the operation, rejecting unknown names
    pub fn operation(&self) -> Result<Operation> {
        Operation::parse(&self.op).ok_or_else(|| Error::UnknownOperation(self.op.clone()))
    }
}

impl SystemResponse {
    /// Successful response with an optional payload
    #[must_use]
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            error: None,
            value,
        }
    }

    /// Failed response carrying the error code and detail
    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            error: Some(ErrorPayload {
                code: err.code().to_string(),
                message: err.detail(),
            }),
            value: Vec::new(),
        }
    }

    /// Build a response from a handler result
    #[must_use]
    pub fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::error(&e),
        }
    }

    /// Convert back into a result on the caller side
    pub fn into_result(self) -> Result<Vec<u8>> {
        if self.status == STATUS_OK {
            return Ok(self.value);
        }
        match self.error {
            Some(payload) => Err(Error::from_code(&payload.code, &payload.message)),
            None => Err(Error::internal(format!(
                "response status {} without error payload",
                self.status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("dm.nope"), None);
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let msg = SystemMessage {
            op: "olric.internal.unknown".into(),
            value: Vec::new(),
        };
        assert!(matches!(msg.operation(), Err(Error::UnknownOperation(_))));
    }

    #[test]
    fn test_response_into_result() {
        assert_eq!(SystemResponse::ok(vec![1, 2]).into_result().unwrap(), vec![1, 2]);

        let err = SystemResponse::error(&Error::invalid_argument("not an owner"))
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m == "not an owner"));
    }

    #[test]
    fn test_routing_query_needs_no_precondition() {
        assert!(!Operation::ClusterRoutingTable.touches_data());
        assert!(!Operation::UpdateRouting.touches_data());
        assert!(Operation::MoveFragment.touches_data());
    }
}
