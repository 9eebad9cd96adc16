//! Capability-style RPC runtime for object graphs spanning isolation zones
//!
//! A *zone* is any unit of address-space or trust isolation: an OS
//! process, a secure enclave, a child runtime embedded in a host, a node
//! across a link. Each zone runs a [`Service`]; objects marshalled out of
//! a zone are wrapped in stubs, objects reached in other zones are held
//! through object proxies, and a distributed reference-count protocol
//! keeps both sides in lock-step across arbitrary topologies — multi-hop
//! chains, back-channels and optimistic (weak-like) references included.
//!
//! Concrete transports and generated interface bindings are consumed as
//! capabilities ([`transport::Marshaller`], [`bindings::Interface`]); the
//! crate ships the zone-graph core, the wire envelope, a channel manager
//! and the in-process parent/child channels.

#![warn(missing_debug_implementations)]

pub mod bindings;
pub mod channel;
pub mod codec;
pub mod error;
pub mod local;
pub mod object_proxy;
pub mod pass_through;
pub mod protocol;
pub mod service;
pub mod service_proxy;
pub mod stub;
pub mod transport;
pub mod types;
pub mod version;

pub use bindings::Interface;
pub use codec::Encoding;
pub use error::{ErrorCode, RpcResult};
pub use object_proxy::{ObjectProxy, ProxyBase, RefMode};
pub use pass_through::PassThrough;
pub use service::{create_child_zone, Service, ServiceLogger};
pub use service_proxy::{ObjectProxyCreationRule, ProxyChannel, ServiceProxy};
pub use stub::{CallContext, CastingInterface, InterfaceStub, ObjectStub};
pub use transport::{BackChannel, BackChannelEntry, Marshaller, Transport, TransportStatus};
pub use types::{
    interface_ordinal, AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone,
    InterfaceDescriptor, InterfaceOrdinal, KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions, Zone,
    DUMMY_OBJECT_ID,
};
