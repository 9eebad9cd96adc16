//! Bidirectional relay for non-endpoint zones
//!
//! A middle zone that owns two transports can splice them into a
//! [`PassThrough`]: operations whose destination matches one endpoint are
//! forwarded on the corresponding transport. Reference counts are
//! mirrored onto the relay itself so it survives exactly as long as any
//! object it routes remains referenced, and it dismantles itself on
//! transport failure or when a zone-terminating post flows through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::Encoding;
use crate::error::{ErrorCode, RpcResult};
use crate::service::Service;
use crate::transport::{BackChannel, BackChannelEntry, Marshaller, Transport, TransportStatus};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceOrdinal,
    KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions,
};

struct PassThroughLinks {
    forward_transport: Option<Arc<dyn Transport>>,
    reverse_transport: Option<Arc<dyn Transport>>,
    service: Option<Arc<Service>>,
    self_ref: Option<Arc<PassThrough>>,
}

/// Relay between two transports on behalf of zones that are not endpoints.
pub struct PassThrough {
    forward_destination: DestinationZone,
    reverse_destination: DestinationZone,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    links: Mutex<PassThroughLinks>,
}

impl PassThrough {
    pub fn new(
        forward_transport: Arc<dyn Transport>,
        reverse_transport: Arc<dyn Transport>,
        service: Arc<Service>,
        forward_destination: DestinationZone,
        reverse_destination: DestinationZone,
    ) -> Arc<Self> {
        let pass_through = Arc::new(Self {
            forward_destination,
            reverse_destination,
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            links: Mutex::new(PassThroughLinks {
                forward_transport: Some(forward_transport),
                reverse_transport: Some(reverse_transport),
                service: Some(service),
                self_ref: None,
            }),
        });
        // alive until the counts drain or a transport dies
        pass_through.links.lock().unwrap().self_ref = Some(pass_through.clone());
        pass_through
    }

    pub fn forward_destination(&self) -> DestinationZone {
        self.forward_destination
    }

    pub fn reverse_destination(&self) -> DestinationZone {
        self.reverse_destination
    }

    /// `(shared, optimistic)` mirrored counts.
    pub fn counts(&self) -> (u64, u64) {
        (self.shared_count.load(Ordering::Acquire), self.optimistic_count.load(Ordering::Acquire))
    }

    /// Still holding its transports and self-reference?
    pub fn is_live(&self) -> bool {
        self.links.lock().unwrap().self_ref.is_some()
    }

    fn directional_transport(&self, destination_zone_id: DestinationZone) -> Option<Arc<dyn Transport>> {
        let links = self.links.lock().unwrap();
        if destination_zone_id == self.forward_destination {
            links.forward_transport.clone()
        } else if destination_zone_id == self.reverse_destination {
            links.reverse_transport.clone()
        } else {
            None
        }
    }

    fn checked_transport(&self, destination_zone_id: DestinationZone) -> RpcResult<Arc<dyn Transport>> {
        let transport = self.directional_transport(destination_zone_id).ok_or(ErrorCode::ZoneNotFound)?;
        if transport.status() != TransportStatus::Connected {
            self.trigger_self_destruction();
            return Err(ErrorCode::TransportError);
        }
        Ok(transport)
    }

    fn after_forward<T>(&self, result: RpcResult<T>) -> RpcResult<T> {
        if let Err(ErrorCode::TransportError) = &result {
            self.trigger_self_destruction();
        }
        result
    }

    /// Drop the transports, the service handle and the self-reference;
    /// the relay dies once the last external reference goes.
    pub fn trigger_self_destruction(&self) {
        let mut links = self.links.lock().unwrap();
        if let Some(forward) = &links.forward_transport {
            forward.remove_destination(self.reverse_destination);
        }
        if let Some(reverse) = &links.reverse_transport {
            reverse.remove_destination(self.forward_destination);
        }
        links.forward_transport = None;
        links.reverse_transport = None;
        links.service = None;
        let self_ref = links.self_ref.take();
        drop(links);
        drop(self_ref);
    }
}

impl Marshaller for PassThrough {
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
    ) -> RpcResult<Vec<u8>> {
        let transport = self.checked_transport(destination_zone_id)?;
        let result = transport.send(
            protocol_version,
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
            destination_zone_id,
            object_id,
            interface_id,
            method_id,
            in_buf,
            back_in,
            back_out,
        );
        self.after_forward(result)
    }

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
    ) {
        let zone_terminating = options.contains(PostOptions::ZONE_TERMINATING);
        let transport = match self.directional_transport(destination_zone_id) {
            Some(transport) => transport,
            None => return,
        };
        if !zone_terminating && transport.status() != TransportStatus::Connected {
            self.trigger_self_destruction();
            return;
        }
        transport.post(
            protocol_version,
            encoding,
            tag,
            caller_channel_zone_id,
            caller_zone_id,
            destination_zone_id,
            object_id,
            interface_id,
            method_id,
            options,
            in_buf,
            back_in,
        );
        if zone_terminating {
            self.trigger_self_destruction();
        }
    }

    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<()> {
        let transport = self.checked_transport(destination_zone_id)?;
        let result = transport.try_cast(protocol_version, destination_zone_id, object_id, interface_id, back_in, back_out);
        self.after_forward(result)
    }

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
    ) -> RpcResult<u64> {
        // route-building bits still carry a shared reference; only the
        // optimistic bit selects the other counter
        if options.is_optimistic() {
            self.optimistic_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.shared_count.fetch_add(1, Ordering::AcqRel);
        }
        let transport = self.checked_transport(destination_zone_id)?;
        let result = transport.add_ref(
            protocol_version,
            destination_channel_zone_id,
            destination_zone_id,
            object_id,
            caller_channel_zone_id,
            caller_zone_id,
            known_direction_zone_id,
            options,
            back_in,
            back_out,
        );
        self.after_forward(result)
    }

    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZone,
        object_id: ObjectId,
        caller_zone_id: CallerZone,
        options: ReleaseOptions,
        back_in: &[BackChannelEntry],
        back_out: &mut BackChannel,
    ) -> RpcResult<u64> {
        let mut drained = false;
        if options.is_optimistic() {
            let previous = self.optimistic_count.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 && self.shared_count.load(Ordering::Acquire) == 0 {
                drained = true;
            }
        } else {
            let previous = self.shared_count.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 && self.optimistic_count.load(Ordering::Acquire) == 0 {
                drained = true;
            }
        }
        let transport = self.checked_transport(destination_zone_id)?;
        let result = transport.release(
            protocol_version,
            destination_zone_id,
            object_id,
            caller_zone_id,
            options,
            back_in,
            back_out,
        );
        match self.after_forward(result) {
            Ok(count) => {
                if drained {
                    self.trigger_self_destruction();
                }
                Ok(count)
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for PassThrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shared, optimistic) = self.counts();
        f.debug_struct("PassThrough")
            .field("forward", &self.forward_destination)
            .field("reverse", &self.reverse_destination)
            .field("shared", &shared)
            .field("optimistic", &optimistic)
            .field("live", &self.is_live())
            .finish()
    }
}
