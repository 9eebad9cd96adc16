//! Wire envelope and message payloads
//!
//! Every message on a transport is two segments: a fixed-layout
//! [`EnvelopePrefix`] followed by an [`EnvelopePayload`] whose fingerprint
//! tells the receiver which concrete payload to decode. Prefix and payload
//! envelope are always plain binary so framing never depends on the
//! negotiated encoding; the inner payload bytes are length-compacted.

use serde::{Deserialize, Serialize};

use crate::codec::{self, Encoding};
use crate::error::{ErrorCode, RpcResult};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceOrdinal,
    KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions,
};

/// Direction marker carried by every envelope; never zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(into = "u64", try_from = "u64")]
pub enum MessageDirection {
    /// A request expecting a reply.
    Send,
    /// A reply to a previous request.
    Receive,
    /// Fire-and-forget; sequence number is always zero.
    OneWay,
}

impl From<MessageDirection> for u64 {
    fn from(direction: MessageDirection) -> u64 {
        match direction {
            MessageDirection::Send => 1,
            MessageDirection::Receive => 2,
            MessageDirection::OneWay => 3,
        }
    }
}

impl TryFrom<u64> for MessageDirection {
    type Error = ErrorCode;

    fn try_from(value: u64) -> Result<Self, ErrorCode> {
        match value {
            1 => Ok(Self::Send),
            2 => Ok(Self::Receive),
            3 => Ok(Self::OneWay),
            _ => Err(ErrorCode::InvalidData),
        }
    }
}

/// First wire segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EnvelopePrefix {
    pub version: u64,
    pub direction: MessageDirection,
    pub sequence_number: u64,
    pub payload_size: u64,
}

/// Second wire segment.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub payload_fingerprint: u64,
    pub payload: Vec<u8>,
}

/// A concrete message payload with a per-type, per-version fingerprint.
pub trait WirePayload: Serialize + serde::de::DeserializeOwned {
    /// Stable discriminator for this payload type.
    const KIND: u64;

    /// Fingerprint stamped into the payload envelope; varies by version so
    /// layout changes between protocol versions cannot be confused.
    fn fingerprint(protocol_version: u64) -> u64 {
        (protocol_version << 56) | Self::KIND
    }
}

macro_rules! wire_payload {
    ($type:ty, $kind:expr) => {
        impl WirePayload for $type {
            const KIND: u64 = $kind;
        }
    };
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CallSend {
    pub encoding: Encoding,
    pub tag: u64,
    pub caller_channel_zone_id: CallerChannelZone,
    pub caller_zone_id: CallerZone,
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub interface_id: InterfaceOrdinal,
    pub method_id: MethodId,
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CallReceive {
    pub payload: Vec<u8>,
    pub err_code: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TryCastSend {
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub interface_id: InterfaceOrdinal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TryCastReceive {
    pub err_code: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AddRefSend {
    pub destination_channel_zone_id: DestinationChannelZone,
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub caller_channel_zone_id: CallerChannelZone,
    pub caller_zone_id: CallerZone,
    pub known_direction_zone_id: KnownDirectionZone,
    pub build_out_param_channel: AddRefOptions,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AddRefReceive {
    pub ref_count: u64,
    pub err_code: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReleaseSend {
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub caller_zone_id: CallerZone,
    pub options: ReleaseOptions,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReleaseReceive {
    pub ref_count: u64,
    pub err_code: i32,
}

/// One-way post; carries the same addressing as a call plus post options.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PostSend {
    pub encoding: Encoding,
    pub tag: u64,
    pub caller_channel_zone_id: CallerChannelZone,
    pub caller_zone_id: CallerZone,
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub interface_id: InterfaceOrdinal,
    pub method_id: MethodId,
    pub options: PostOptions,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InitClientChannelSend {
    pub caller_zone_id: u64,
    pub caller_object_id: u64,
    pub destination_zone_id: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InitClientChannelResponse {
    pub err_code: i32,
    pub destination_zone_id: u64,
    pub destination_object_id: u64,
    pub reserved: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct CloseConnectionSend {}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct CloseConnectionReceived {}

wire_payload!(CallSend, 1);
wire_payload!(CallReceive, 2);
wire_payload!(TryCastSend, 3);
wire_payload!(TryCastReceive, 4);
wire_payload!(AddRefSend, 5);
wire_payload!(AddRefReceive, 6);
wire_payload!(ReleaseSend, 7);
wire_payload!(ReleaseReceive, 8);
wire_payload!(InitClientChannelSend, 9);
wire_payload!(InitClientChannelResponse, 10);
wire_payload!(CloseConnectionSend, 11);
wire_payload!(CloseConnectionReceived, 12);
wire_payload!(PostSend, 13);

/// Encode a concrete payload into its envelope.
pub fn encode_payload<T: WirePayload>(protocol_version: u64, payload: &T) -> RpcResult<EnvelopePayload> {
    Ok(EnvelopePayload {
        payload_fingerprint: T::fingerprint(protocol_version),
        payload: codec::serialise(payload, Encoding::CompactBinary)?,
    })
}

/// Decode a concrete payload out of its envelope, checking the fingerprint.
pub fn decode_payload<T: WirePayload>(protocol_version: u64, envelope: &EnvelopePayload) -> RpcResult<T> {
    if envelope.payload_fingerprint != T::fingerprint(protocol_version) {
        return Err(ErrorCode::InvalidData);
    }
    codec::deserialise(Encoding::CompactBinary, &envelope.payload)
}

/// Is this envelope carrying payload type `T` at the given version?
pub fn payload_is<T: WirePayload>(protocol_version: u64, envelope: &EnvelopePayload) -> bool {
    envelope.payload_fingerprint == T::fingerprint(protocol_version)
}

/// Encode the prefix segment (always plain binary).
pub fn encode_prefix(prefix: &EnvelopePrefix) -> RpcResult<Vec<u8>> {
    codec::serialise(prefix, Encoding::Binary)
}

/// Decode the prefix segment.
pub fn decode_prefix(bytes: &[u8]) -> RpcResult<EnvelopePrefix> {
    codec::deserialise(Encoding::Binary, bytes)
}

/// Encode the payload envelope segment (always plain binary).
pub fn encode_payload_segment(payload: &EnvelopePayload) -> RpcResult<Vec<u8>> {
    codec::serialise(payload, Encoding::Binary)
}

/// Decode the payload envelope segment.
pub fn decode_payload_segment(bytes: &[u8]) -> RpcResult<EnvelopePayload> {
    codec::deserialise(Encoding::Binary, bytes)
}
