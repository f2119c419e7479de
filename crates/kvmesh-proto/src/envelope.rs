//! Versioned envelope for transfer units
//!
//! Layout:
//!
//! ```text
//! +--------+---------+---------+------------------+
//! | "KVMB" | version | crc32c  | prost DmapBox    |
//! | 4 B    | u16 BE  | u32 BE  | remaining bytes  |
//! +--------+---------+---------+------------------+
//! ```
//!
//! The checksum covers the prost body. A peer that does not know the
//! envelope version rejects the unit instead of decoding it.

use crate::messages::DmapBox;
use bytes::{Buf, BufMut};
use kvmesh_common::{Error, Result};
use prost::Message;

/// Magic prefix of an encoded transfer unit
pub const BOX_MAGIC: &[u8; 4] = b"KVMB";

/// Current envelope format version
pub const BOX_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4;

/// Encode a transfer unit into its envelope
#[must_use]
pub fn encode_box(dmap_box: &DmapBox) -> Vec<u8> {
    let body = dmap_box.encode_to_vec();
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(BOX_MAGIC);
    buf.put_u16(BOX_FORMAT_VERSION);
    buf.put_u32(crc32c::crc32c(&body));
    buf.put_slice(&body);
    buf
}

/// Decode and verify an enveloped transfer unit
pub fn decode_box(data: &[u8]) -> Result<DmapBox> {
    if data.len() < HEADER_LEN {
        return Err(Error::Deserialization(format!(
            "transfer unit too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = data;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != BOX_MAGIC {
        return Err(Error::Deserialization("bad transfer unit magic".into()));
    }

    let version = buf.get_u16();
    if version != BOX_FORMAT_VERSION {
        return Err(Error::IncompatibleSnapshot(format!(
            "transfer unit format version {version}, supported {BOX_FORMAT_VERSION}"
        )));
    }

    let expected = buf.get_u32();
    let actual = crc32c::crc32c(buf);
    if expected != actual {
        return Err(Error::Deserialization(format!(
            "transfer unit checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }

    DmapBox::decode(buf).map_err(|e| Error::Deserialization(e.to_string()))
}
