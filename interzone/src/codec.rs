//! Payload encoding boundary
//!
//! Both ends of a call agree on an encoding per message via the `encoding`
//! field of the call envelope. Three encodings are supported: plain binary
//! (fixed-width integers), length-compacted binary (varint integers) and
//! JSON. All three frame identically; only the payload bytes differ.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RpcResult};

/// Wire encoding selector.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Encoding {
    /// Whatever the channel prefers; resolves to `Binary`.
    #[default]
    Default,
    /// Fixed-width binary.
    Binary,
    /// Length-compacted (varint) binary.
    CompactBinary,
    /// JSON text.
    Json,
}

impl From<Encoding> for u8 {
    fn from(enc: Encoding) -> u8 {
        match enc {
            Encoding::Default => 0,
            Encoding::Binary => 1,
            Encoding::CompactBinary => 2,
            Encoding::Json => 3,
        }
    }
}

impl TryFrom<u8> for Encoding {
    type Error = ErrorCode;

    fn try_from(value: u8) -> Result<Self, ErrorCode> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Binary),
            2 => Ok(Self::CompactBinary),
            3 => Ok(Self::Json),
            _ => Err(ErrorCode::InvalidData),
        }
    }
}

fn binary_options() -> impl Options {
    bincode::options().with_fixint_encoding().with_little_endian()
}

fn compact_options() -> impl Options {
    bincode::options().with_varint_encoding().with_little_endian()
}

/// Encode `value` with the requested encoding.
pub fn serialise<T: Serialize>(value: &T, encoding: Encoding) -> RpcResult<Vec<u8>> {
    match encoding {
        Encoding::Default | Encoding::Binary => {
            binary_options().serialize(value).map_err(|_| ErrorCode::InvalidData)
        }
        Encoding::CompactBinary => compact_options().serialize(value).map_err(|_| ErrorCode::InvalidData),
        Encoding::Json => serde_json::to_vec(value).map_err(|_| ErrorCode::InvalidData),
    }
}

/// Decode a payload produced by [`serialise`] with the same encoding.
pub fn deserialise<T: DeserializeOwned>(encoding: Encoding, data: &[u8]) -> RpcResult<T> {
    match encoding {
        Encoding::Default | Encoding::Binary => {
            binary_options().deserialize(data).map_err(|err| {
                log::debug!("binary payload rejected: {err}");
                ErrorCode::InvalidData
            })
        }
        Encoding::CompactBinary => compact_options().deserialize(data).map_err(|err| {
            log::debug!("compact payload rejected: {err}");
            ErrorCode::InvalidData
        }),
        Encoding::Json => serde_json::from_slice(data).map_err(|err| {
            log::debug!("json payload rejected: {err}");
            ErrorCode::InvalidData
        }),
    }
}

/// Size of the encoded form without producing it.
pub fn saved_size<T: Serialize>(value: &T, encoding: Encoding) -> RpcResult<u64> {
    match encoding {
        Encoding::Default | Encoding::Binary => {
            binary_options().serialized_size(value).map_err(|_| ErrorCode::InvalidData)
        }
        Encoding::CompactBinary => {
            compact_options().serialized_size(value).map_err(|_| ErrorCode::InvalidData)
        }
        Encoding::Json => serde_json::to_vec(value).map(|v| v.len() as u64).map_err(|_| ErrorCode::InvalidData),
    }
}

/// Bytes saved by the compacted encoding relative to plain binary.
pub fn compaction_saving<T: Serialize>(value: &T) -> RpcResult<u64> {
    let plain = saved_size(value, Encoding::Binary)?;
    let compact = saved_size(value, Encoding::CompactBinary)?;
    Ok(plain.saturating_sub(compact))
}
