//! In/out interface marshalling helpers
//!
//! The binding generator (out of scope here) emits, per interface, a
//! marker type implementing [`Interface`]: the version-indexed ordinal
//! getter, a stub constructor and a proxy constructor. Everything else —
//! when to fabricate a stub on egress, when to resolve or instantiate a
//! proxy on ingress, and which side owes whom a reference — is decided by
//! the helpers in this module, which generated code calls verbatim.

use std::sync::Arc;

use crate::error::{ErrorCode, RpcResult};
use crate::object_proxy::{ObjectProxy, RefMode};
use crate::service::Service;
use crate::service_proxy::{ObjectProxyCreationRule, ServiceProxy};
use crate::stub::{CastingInterface, InterfaceStub, ObjectStub};
use crate::transport::{BackChannel, Marshaller};
use crate::types::{
    AddRefOptions, CallerChannelZone, CallerZone, DestinationChannelZone, InterfaceDescriptor, InterfaceOrdinal,
    KnownDirectionZone, ReleaseOptions,
};
use crate::version;

/// Static description of one marshallable interface; implemented by the
/// marker types the binding generator emits.
pub trait Interface: 'static {
    /// The typed handle users hold, e.g. `Arc<dyn Arithmetic>`.
    type Handle: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    /// The interface ordinal at a protocol version.
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal;

    /// Does `interface_id` name this interface at any supported version?
    fn matches(interface_id: InterfaceOrdinal) -> bool {
        (version::LOWEST_SUPPORTED_VERSION..=version::HIGHEST_SUPPORTED_VERSION)
            .any(|protocol_version| Self::interface_id(protocol_version) == interface_id)
    }

    /// View a handle as the type-erased casting interface.
    fn as_casting(handle: &Self::Handle) -> Arc<dyn CastingInterface>;

    /// Recover a typed handle from a casting interface.
    fn from_casting(casting: &Arc<dyn CastingInterface>) -> Option<Self::Handle> {
        let boxed = casting.clone().query_interface(Self::interface_id(version::current_version()))?;
        boxed.downcast::<Self::Handle>().ok().map(|handle| *handle)
    }

    /// Build the server-side view that dispatches this interface's
    /// methods into `handle`'s implementation.
    fn make_stub(handle: &Self::Handle) -> Arc<dyn InterfaceStub>;

    /// Build a typed proxy over `object_proxy` in the given reference
    /// mode.
    fn make_proxy(object_proxy: &Arc<ObjectProxy>, mode: RefMode) -> RpcResult<Self::Handle>;
}

/// Factory closure registering `I`'s view on a freshly built object stub.
pub fn interface_view_factory<I: Interface>(handle: &I::Handle) -> impl Fn(&Arc<ObjectStub>) + '_ {
    move |stub: &Arc<ObjectStub>| {
        stub.add_interface(I::make_stub(handle));
    }
}

/// Marshal a local implementation out of its zone, returning the wire
/// capability for it. The descriptor carries one shared reference owned
/// by the zone itself.
pub fn create_interface_stub<I: Interface>(service: &Arc<Service>, handle: &I::Handle) -> RpcResult<InterfaceDescriptor> {
    create_interface_stub_for::<I>(service, handle, service.zone_id().as_caller())
}

/// Like [`create_interface_stub`], but the reference is recorded on the
/// ledger of the zone the descriptor is being handed to, so that zone's
/// eventual release balances the grant.
pub fn create_interface_stub_for<I: Interface>(
    service: &Arc<Service>,
    handle: &I::Handle,
    caller_zone_id: CallerZone,
) -> RpcResult<InterfaceDescriptor> {
    let casting = I::as_casting(handle);
    if !casting.is_local() {
        return Err(ErrorCode::InvalidData);
    }
    let (descriptor, _stub) = service.get_proxy_stub_descriptor(
        version::current_version(),
        CallerChannelZone::default(),
        caller_zone_id,
        casting,
        &interface_view_factory::<I>(handle),
        false,
    )?;
    Ok(descriptor)
}

/// Caller-side binding of an interface in-parameter.
///
/// Locals are wrapped in a (new or existing) stub; handles that already
/// proxy another zone are transmitted as their existing descriptor — the
/// peer reaches the origin zone directly, there is no re-wrapping
/// round-trip.
pub fn proxy_bind_in_param<I: Interface>(
    service: &Arc<Service>,
    _protocol_version: u64,
    handle: Option<&I::Handle>,
) -> RpcResult<(InterfaceDescriptor, Option<Arc<ObjectStub>>)> {
    let handle = match handle {
        Some(handle) => handle,
        None => return Ok((InterfaceDescriptor::null(), None)),
    };
    let casting = I::as_casting(handle);
    if !casting.is_local() {
        if let Some(descriptor) = casting.remote_descriptor() {
            if descriptor.destination_zone_id != service.zone_id().as_destination() {
                return Ok((descriptor, None));
            }
        }
    }
    let (descriptor, stub) = service.get_proxy_stub_descriptor(
        version::current_version(),
        CallerChannelZone::default(),
        service.zone_id().as_caller(),
        casting,
        &interface_view_factory::<I>(handle),
        false,
    )?;
    Ok((descriptor, Some(stub)))
}

/// Callee-side binding of an interface in-parameter.
pub fn stub_bind_in_param<I: Interface>(
    protocol_version: u64,
    service: &Arc<Service>,
    caller_channel_zone_id: CallerChannelZone,
    caller_zone_id: CallerZone,
    descriptor: InterfaceDescriptor,
) -> RpcResult<Option<I::Handle>> {
    if descriptor.is_null() {
        return Ok(None);
    }
    if descriptor.destination_zone_id == service.zone_id().as_destination() {
        // the capability points at an object of this very zone
        let handle = service
            .get_local_interface::<I>(protocol_version, descriptor.object_id)
            .ok_or(ErrorCode::ObjectNotFound)?;
        return Ok(Some(handle));
    }
    let mut new_proxy_added = false;
    let proxy = service
        .get_zone_proxy(
            caller_channel_zone_id,
            caller_zone_id,
            descriptor.destination_zone_id,
            service.zone_id().as_caller(),
            &mut new_proxy_added,
        )
        .ok_or(ErrorCode::ObjectNotFound)?;
    let object_proxy = proxy.get_or_create_object_proxy(
        descriptor.object_id,
        ObjectProxyCreationRule::AddRefIfNew,
        new_proxy_added,
        caller_zone_id.as_known_direction(),
    )?;
    object_proxy.query_interface::<I>(false).map(Some)
}

/// Callee-side binding of an interface out-parameter (or return value):
/// fabricate a stub for locals, or forward the reference accounting to
/// the origin zone for handles that proxy elsewhere.
pub fn stub_bind_out_param<I: Interface>(
    service: &Arc<Service>,
    _protocol_version: u64,
    caller_channel_zone_id: CallerChannelZone,
    caller_zone_id: CallerZone,
    handle: Option<&I::Handle>,
) -> RpcResult<InterfaceDescriptor> {
    let handle = match handle {
        Some(handle) => handle,
        None => return Ok(InterfaceDescriptor::null()),
    };
    let casting = I::as_casting(handle);
    if !casting.is_local() {
        if let Some(descriptor) = casting.remote_descriptor() {
            if descriptor.destination_zone_id != service.zone_id().as_destination() {
                // grant the caller a reference held at the origin zone,
                // building the route so its release can walk back
                let mut back_out = BackChannel::new();
                service.add_ref(
                    version::current_version(),
                    DestinationChannelZone::default(),
                    descriptor.destination_zone_id,
                    descriptor.object_id,
                    caller_channel_zone_id,
                    caller_zone_id,
                    KnownDirectionZone::default(),
                    AddRefOptions::BUILD_CALLER_ROUTE,
                    &[],
                    &mut back_out,
                )?;
                return Ok(descriptor);
            }
        }
    }
    let (descriptor, _stub) = service.get_proxy_stub_descriptor(
        version::current_version(),
        caller_channel_zone_id,
        caller_zone_id,
        casting,
        &interface_view_factory::<I>(handle),
        false,
    )?;
    Ok(descriptor)
}

/// Caller-side binding of an interface out-parameter the remote already
/// add-ref'd for us.
pub fn proxy_bind_out_param<I: Interface>(
    source: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
    caller_zone_id: CallerZone,
) -> RpcResult<Option<I::Handle>> {
    if descriptor.is_null() {
        return Ok(None);
    }
    let service = source.operating_zone_service().ok_or(ErrorCode::ZoneNotInitialised)?;

    if descriptor.destination_zone_id == service.zone_id().as_destination() {
        // one of our own objects came back; fold the callee's grant away
        let stub = service.get_object(descriptor.object_id).ok_or(ErrorCode::ObjectNotFound)?;
        service.release_local_stub(&stub, false)?;
        let handle = service
            .get_local_interface::<I>(version::current_version(), descriptor.object_id)
            .ok_or(ErrorCode::InvalidInterfaceId)?;
        return Ok(Some(handle));
    }

    let proxy = if source.destination_zone_id() == descriptor.destination_zone_id {
        source.clone()
    } else {
        // the object came through `source` but lives elsewhere; the
        // channel it arrived through becomes the caller channel
        let mut new_proxy_added = false;
        service
            .get_zone_proxy(
                source.destination_zone_id().as_caller_channel(),
                caller_zone_id,
                descriptor.destination_zone_id,
                source.zone_id().as_caller(),
                &mut new_proxy_added,
            )
            .ok_or(ErrorCode::ObjectNotFound)?
    };
    let object_proxy = proxy.get_or_create_object_proxy(
        descriptor.object_id,
        ObjectProxyCreationRule::ReleaseIfNotNew,
        false,
        KnownDirectionZone::default(),
    )?;
    object_proxy.query_interface::<I>(false).map(Some)
}

/// Demarshal a descriptor received over `source` into a typed proxy
/// handle; the entry point used by connect bootstrap.
pub fn demarshall_interface_proxy<I: Interface>(
    protocol_version: u64,
    source: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
    caller_zone_id: CallerZone,
) -> RpcResult<Option<I::Handle>> {
    if protocol_version > version::current_version() {
        return Err(ErrorCode::IncompatibleService);
    }
    if descriptor.is_null() {
        return Ok(None);
    }
    if descriptor.destination_zone_id != source.destination_zone_id() {
        return proxy_bind_out_param::<I>(source, descriptor, caller_zone_id);
    }
    let service = source.operating_zone_service().ok_or(ErrorCode::ZoneNotInitialised)?;
    if service.zone_id().as_destination() == descriptor.destination_zone_id {
        // a descriptor for our own zone arriving over a channel is
        // unreachable by contract
        log::error!("descriptor for the local zone arrived over a channel: {descriptor}");
        return Err(ErrorCode::InvalidData);
    }
    let object_proxy = source.get_or_create_object_proxy(
        descriptor.object_id,
        ObjectProxyCreationRule::DoNothing,
        false,
        KnownDirectionZone::default(),
    )?;
    object_proxy.query_interface::<I>(false).map(Some)
}

/// A weak-like view of a remote object: observes liveness without keeping
/// the target alive. Dropping it issues `release(optimistic)`.
pub fn optimistic_view<I: Interface>(handle: &I::Handle) -> RpcResult<I::Handle> {
    let casting = I::as_casting(handle);
    let object_proxy = casting.object_proxy().ok_or(ErrorCode::InvalidData)?;
    I::make_proxy(&object_proxy, RefMode::Optimistic)
}

/// Upgrade an optimistic view back to a shared handle; fails with
/// `ObjectNotFound` once the target is gone.
pub fn shared_view<I: Interface>(handle: &I::Handle) -> RpcResult<I::Handle> {
    let casting = I::as_casting(handle);
    let object_proxy = casting.object_proxy().ok_or(ErrorCode::InvalidData)?;
    I::make_proxy(&object_proxy, RefMode::Shared)
}

/// Polymorphic cast between interfaces of the same object.
///
/// For remote handles the destination zone is consulted (`try_cast`) and
/// the stub lazily extended; `Ok(None)` means the object does not support
/// the target interface.
pub fn try_cast_interface<From: Interface, To: Interface>(handle: &From::Handle) -> RpcResult<Option<To::Handle>> {
    let casting = From::as_casting(handle);
    match casting.object_proxy() {
        Some(object_proxy) => match object_proxy.query_interface::<To>(true) {
            Ok(cast) => Ok(Some(cast)),
            Err(ErrorCode::InvalidInterfaceId) => Ok(None),
            Err(err) => Err(err),
        },
        None => Ok(To::from_casting(&casting)),
    }
}

/// Release the marshal-out reference taken by [`create_interface_stub`].
pub fn release_interface_stub<I: Interface>(service: &Arc<Service>, descriptor: InterfaceDescriptor) -> RpcResult<u64> {
    if descriptor.destination_zone_id != service.zone_id().as_destination() {
        return Err(ErrorCode::InvalidData);
    }
    let stub = service.get_object(descriptor.object_id).ok_or(ErrorCode::ObjectNotFound)?;
    let (count, lifetime) = stub.release(service.zone_id().as_caller(), ReleaseOptions::NORMAL)?;
    drop(stub);
    drop(lifetime);
    Ok(count)
}
