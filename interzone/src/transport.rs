//! Transport boundary
//!
//! The runtime never opens sockets or maps shared memory itself; it talks
//! to an abstract per-peer capability. [`Marshaller`] is the five-operation
//! surface every hop implements — services, service-proxy channels,
//! pass-throughs and concrete transports alike — and [`Transport`] adds the
//! connection-status and routing-table facets a relay needs.

use smallvec::SmallVec;

use serde::{Deserialize, Serialize};

use crate::codec::Encoding;
use crate::error::RpcResult;
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceOrdinal,
    KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions,
};

/// A piggybacked, non-blocking release notification.
///
/// Reference counting must never stall the forward path, so releases that
/// happen to travel in the opposite direction of an in-flight operation
/// ride along in its back-channel list and are drained by the receiver
/// before the operation itself is dispatched.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BackChannelEntry {
    pub destination_zone_id: DestinationZone,
    pub object_id: ObjectId,
    pub caller_zone_id: CallerZone,
    pub options: ReleaseOptions,
}

/// Back-channel list; almost always empty or a single entry.
pub type BackChannel = SmallVec<[BackChannelEntry; 2]>;

/// The five-operation marshalling surface of a hop.
pub trait Marshaller: Send + Sync {
    /// Deliver a call and wait for its reply payload.
    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_buf: &[u8],
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<Vec<u8>>;

    /// Fire-and-forget delivery; must not block on the peer.
    #[allow(clippy::too_many_arguments)]
    fn post(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        options: PostOptions,
        in_buf: &[u8],
        back_in: &[BackChannelEntry],
    );

    /// Ask the destination whether the object supports another interface.
    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<()>;

    /// Increment the named stub (or channel, for the dummy object).
    /// Returns the post-increment count.
    #[allow(clippy::too_many_arguments)]
    fn add_ref(
        &self,
        protocol_version: u64,
        destination_channel_zone_id: DestinationChannelZone,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZone,
        caller_zone_id: CallerZone,
        known_direction_zone_id: KnownDirectionZone,
        options: AddRefOptions,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<u64>;

    /// Symmetric decrement. Returns the post-decrement count.
    #[allow(clippy::too_many_arguments)]
    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<u64>;
}

/// Health of a transport link.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportStatus {
    Connected,
    Disconnected,
}

/// A per-peer transport capability.
///
/// Beyond the marshalling surface, a transport knows whether its link is
/// still up and lets a relay retract a destination when the far side goes
/// away.
pub trait Transport: Marshaller {
    fn status(&self) -> TransportStatus;

    /// Drop a destination this transport was relaying towards.
    fn remove_destination(&self, destination_zone_id: DestinationZone);
}
