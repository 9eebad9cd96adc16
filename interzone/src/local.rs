//! In-process service-proxy channels
//!
//! The zero-serialization channel pair used to embed a child zone in the
//! same address space: [`ChildChannel`] is the parent's view of the child
//! (its `connect` bootstraps the child service), [`ParentChannel`] is the
//! child's view back up. [`BoundedProxyChannel`] wraps any channel in the
//! fixed-reply-buffer discipline of enclave calls, including the
//! grow-and-retry-once contract.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::bindings::Interface;
use crate::codec::Encoding;
use crate::error::{ErrorCode, RpcResult};
use crate::service::{create_child_zone, Service};
use crate::service_proxy::ProxyChannel;
use crate::transport::{BackChannel, BackChannelEntry, Marshaller};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceDescriptor,
    InterfaceOrdinal, KnownDirectionZone, MethodId, ObjectId, PostOptions, ReleaseOptions, Zone,
};

macro_rules! delegate_marshaller {
    ($target:expr) => {
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
            let target = $target(self)?;
            target.send(
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
            )
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
            if let Ok(target) = $target(self) {
                target.post(
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
            let target = $target(self)?;
            target.try_cast(protocol_version, destination_zone_id, object_id, interface_id, back_in, back_out)
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
            let target = $target(self)?;
            target.add_ref(
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
            )
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
            let target = $target(self)?;
            target.release(protocol_version, destination_zone_id, object_id, caller_zone_id, options, back_in, back_out)
        }
    };
}

/// A child zone's channel up to the parent service in the same process.
pub struct ParentChannel {
    parent: Weak<Service>,
}

impl ParentChannel {
    pub fn new(parent: &Arc<Service>) -> Arc<Self> {
        Arc::new(Self { parent: Arc::downgrade(parent) })
    }

    fn target(&self) -> RpcResult<Arc<Service>> {
        self.parent.upgrade().ok_or(ErrorCode::ZoneNotInitialised)
    }
}

impl std::fmt::Debug for ParentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentChannel").finish_non_exhaustive()
    }
}

impl Marshaller for ParentChannel {
    delegate_marshaller!(Self::target);
}

impl ProxyChannel for ParentChannel {}

type ChildFactory<P, C> =
    Box<dyn FnOnce(Option<<P as Interface>::Handle>, &Arc<Service>) -> RpcResult<<C as Interface>::Handle> + Send>;

/// The parent's channel down into an in-process child zone.
///
/// `connect` creates the child service, pins its parent proxy over a
/// [`ParentChannel`], runs the factory to produce the child's root object
/// and returns its descriptor.
pub struct ChildChannel<P: Interface, C: Interface> {
    name: String,
    child_zone_id: Zone,
    parent: Weak<Service>,
    child: Mutex<Option<Arc<Service>>>,
    factory: Mutex<Option<ChildFactory<P, C>>>,
}

impl<P: Interface, C: Interface> ChildChannel<P, C> {
    pub fn new(
        name: &str,
        parent: &Arc<Service>,
        child_zone_id: Zone,
        factory: impl FnOnce(Option<P::Handle>, &Arc<Service>) -> RpcResult<C::Handle> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            child_zone_id,
            parent: Arc::downgrade(parent),
            child: Mutex::new(None),
            factory: Mutex::new(Some(Box::new(factory))),
        })
    }

    /// The child service, once connected.
    pub fn child_service(&self) -> Option<Arc<Service>> {
        self.child.lock().unwrap().clone()
    }

    fn target(&self) -> RpcResult<Arc<Service>> {
        self.child.lock().unwrap().clone().ok_or(ErrorCode::ZoneNotInitialised)
    }
}

impl<P: Interface, C: Interface> std::fmt::Debug for ChildChannel<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildChannel")
            .field("name", &self.name)
            .field("child_zone", &self.child_zone_id)
            .field("connected", &self.child.lock().unwrap().is_some())
            .finish_non_exhaustive()
    }
}

impl<P: Interface, C: Interface> Marshaller for ChildChannel<P, C> {
    delegate_marshaller!(Self::target);
}

impl<P: Interface, C: Interface> ProxyChannel for ChildChannel<P, C> {
    fn connect(&self, input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        let parent = self.parent.upgrade().ok_or(ErrorCode::ZoneNotInitialised)?;
        let factory = self.factory.lock().unwrap().take().ok_or(ErrorCode::UnableToCreateServiceProxy)?;
        let (child, output_descr) = create_child_zone::<P, C>(
            &self.name,
            self.child_zone_id,
            parent.zone_id().as_destination(),
            input_descr,
            factory,
            ParentChannel::new(&parent),
        )?;
        *self.child.lock().unwrap() = Some(child);
        Ok(output_descr)
    }
}

/// Fixed-reply-buffer discipline over any channel, as imposed by
/// transports with caller-supplied output buffers (enclave ecalls).
///
/// A reply that does not fit the current buffer parks in the retry
/// buffer and surfaces `NeedMoreMemory` with the required size; the
/// caller side grows the buffer to that size and retries the call exactly
/// once, which drains the parked reply without re-executing the method.
pub struct BoundedProxyChannel {
    inner: Arc<dyn ProxyChannel>,
    capacity: AtomicUsize,
    // reply parked by an attempt that overflowed the buffer
    retry_buffer: Mutex<Option<Vec<u8>>>,
    retries: AtomicU64,
}

impl BoundedProxyChannel {
    pub const DEFAULT_CAPACITY: usize = 128;

    pub fn new(inner: Arc<dyn ProxyChannel>) -> Arc<Self> {
        Self::with_capacity(inner, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn ProxyChannel>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            capacity: AtomicUsize::new(capacity),
            retry_buffer: Mutex::new(None),
            retries: AtomicU64::new(0),
        })
    }

    /// Current reply-buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of grow-and-retry round trips performed.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    /// One bounded attempt: a parked reply drains if it now fits,
    /// otherwise the call executes and an oversized reply parks.
    /// `Err(required)` reports the buffer size the reply needs.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        capacity: usize,
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
    ) -> RpcResult<Result<Vec<u8>, usize>> {
        {
            let mut parked = self.retry_buffer.lock().unwrap();
            if let Some(reply) = parked.take() {
                if reply.len() <= capacity {
                    return Ok(Ok(reply));
                }
                let required = reply.len();
                *parked = Some(reply);
                return Ok(Err(required));
            }
        }
        let reply = self.inner.send(
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
        )?;
        if reply.len() <= capacity {
            return Ok(Ok(reply));
        }
        let required = reply.len();
        *self.retry_buffer.lock().unwrap() = Some(reply);
        Ok(Err(required))
    }
}

impl std::fmt::Debug for BoundedProxyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedProxyChannel")
            .field("capacity", &self.capacity())
            .field("retries", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl Marshaller for BoundedProxyChannel {
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
        let mut capacity = self.capacity.load(Ordering::Acquire);
        for retry in 0..2 {
            let outcome = self.attempt(
                capacity,
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
            )?;
            match outcome {
                Ok(reply) => return Ok(reply),
                Err(required) if retry == 0 => {
                    // grow to the reported size and reissue exactly once
                    capacity = required;
                    self.capacity.store(required, Ordering::Release);
                    self.retries.fetch_add(1, Ordering::AcqRel);
                }
                Err(_) => break,
            }
        }
        Err(ErrorCode::NeedMoreMemory)
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
        self.inner.post(
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
        self.inner.try_cast(protocol_version, destination_zone_id, object_id, interface_id, back_in, back_out)
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
        self.inner.add_ref(
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
        )
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
        self.inner.release(protocol_version, destination_zone_id, object_id, caller_zone_id, options, back_in, back_out)
    }
}

impl ProxyChannel for BoundedProxyChannel {
    fn connect(&self, input_descr: InterfaceDescriptor) -> RpcResult<InterfaceDescriptor> {
        self.inner.connect(input_descr)
    }
}
